//! MQTT connection plumbing shared by the subscriber and the publisher.
//!
//! Each component owns one [`MqttLink`] and runs it through
//! [`drive_connection`], which implements the single reconnect policy: on any
//! connection error wait a fixed delay, then poll again so rumqttc reconnects.
//! Only a failed initial connect is fatal.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 100;

/// Parse broker URL in format mqtt://host:port, tcp://host:port or host[:port]
pub fn parse_broker_url(url: &str, default_port: u16) -> Result<(String, u16)> {
    let trimmed = url.trim();
    let address = trimmed
        .strip_prefix("mqtt://")
        .or_else(|| trimmed.strip_prefix("tcp://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    let (host, port) = match address.split_once(':') {
        None => (address, default_port),
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in broker URL: {}", url))?;
            (host, port)
        }
    };

    if host.is_empty() || host.contains(':') {
        bail!("Invalid broker URL format: {}", url);
    }

    Ok((host.to_string(), port))
}

/// `{prefix}-{role}-{random}` so a restart never collides with a lingering session
pub fn client_id(prefix: &str, role: &str) -> String {
    format!("{}-{}-{}", prefix, role, Uuid::new_v4().simple())
}

/// Outbound side of a broker connection
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Per-component behaviour plugged into [`drive_connection`]
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Called on every ConnAck. Sessions are clean, so subscriptions and
    /// presence messages must be re-issued here. Must not block on the
    /// request channel since the event loop is not polled meanwhile.
    fn on_connected(&self, reconnect: bool) -> Result<()>;

    async fn on_publish(&self, _topic: &str, _payload: &[u8]) {}

    /// Retained message to send right before a graceful disconnect
    fn farewell(&self) -> Option<(String, Vec<u8>)> {
        None
    }
}

/// One MQTT client plus its event loop and connection flag
pub struct MqttLink {
    name: &'static str,
    endpoint: String,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    connected: AtomicBool,
}

impl MqttLink {
    pub fn new(
        name: &'static str,
        server: &str,
        default_port: u16,
        client_id: String,
        last_will: Option<LastWill>,
    ) -> Result<Self> {
        let (host, port) = parse_broker_url(server, default_port)?;

        let mut options = MqttOptions::new(client_id, host.clone(), port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(will) = last_will {
            options.set_last_will(will);
        }

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        event_loop
            .network_options
            .set_connection_timeout(CONNECT_TIMEOUT.as_secs());

        Ok(Self {
            name,
            endpoint: format!("{}:{}", host, port),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            connected: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn take_event_loop(&self) -> Result<EventLoop> {
        self.event_loop
            .lock()
            .map_err(|_| anyhow!("{} event loop lock poisoned", self.name))?
            .take()
            .ok_or_else(|| anyhow!("{} connection already started", self.name))
    }
}

#[async_trait]
impl MessageTransport for MqttLink {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            bail!("not connected to {} broker", self.name);
        }

        tokio::time::timeout(
            OPERATION_TIMEOUT,
            self.client.publish(topic, qos, retain, payload),
        )
        .await
        .map_err(|_| anyhow!("publish to {} timed out after {:?}", topic, OPERATION_TIMEOUT))?
        .with_context(|| format!("publish to {} failed", topic))
    }

    fn is_connected(&self) -> bool {
        MqttLink::is_connected(self)
    }
}

/// Wait for the first ConnAck. `Ok(false)` means cancelled before connecting.
async fn initial_connect(
    link: &MqttLink,
    event_loop: &mut EventLoop,
    cancel: &CancellationToken,
) -> Result<bool> {
    let wait_for_ack = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(anyhow!(e)),
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        result = tokio::time::timeout(CONNECT_TIMEOUT, wait_for_ack) => {
            result
                .map_err(|_| anyhow!("timed out after {:?}", CONNECT_TIMEOUT))?
                .with_context(|| format!("Failed to connect to {} broker at {}", link.name, link.endpoint))?;
            Ok(true)
        }
    }
}

/// Run a link until cancellation.
///
/// Returns `Err` only when the initial connect (or the initial session setup)
/// fails. Later disconnects are retried after `reconnect_delay`.
#[tracing::instrument(skip_all, fields(link = link.name(), endpoint = %link.endpoint()))]
pub async fn drive_connection<H>(
    link: &MqttLink,
    handler: &H,
    reconnect_delay: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    H: SessionHandler + ?Sized,
{
    let mut event_loop = link.take_event_loop()?;

    info!("Connecting to {} broker", link.name);
    if !initial_connect(link, &mut event_loop, cancel).await? {
        info!("Cancelled before {} connection was established", link.name);
        return Ok(());
    }

    link.set_connected(true);
    info!("Connected to {} broker", link.name);
    handler
        .on_connected(false)
        .with_context(|| format!("Failed to set up {} session", link.name))?;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                shutdown(link, handler, &mut event_loop).await;
                info!("{} connection stopped", link.name);
                return Ok(());
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    link.set_connected(true);
                    info!("Reconnected to {} broker", link.name);
                    metrics::counter!("lorawan_bridge.mqtt.reconnects_total", "link" => link.name)
                        .increment(1);
                    if let Err(e) = handler.on_connected(true) {
                        error!("Failed to restore {} session: {:#}", link.name, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handler.on_publish(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("Subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    link.set_connected(false);
                    warn!(
                        "{} connection lost: {}. Reconnecting in {:?}",
                        link.name, e, reconnect_delay
                    );
                    metrics::counter!("lorawan_bridge.mqtt.disconnects_total", "link" => link.name)
                        .increment(1);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("{} connection stopped while disconnected", link.name);
                            return Ok(());
                        }
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }
    }
}

/// Best-effort farewell and disconnect, bounded by [`SHUTDOWN_DRAIN`]
async fn shutdown<H>(link: &MqttLink, handler: &H, event_loop: &mut EventLoop)
where
    H: SessionHandler + ?Sized,
{
    if !link.is_connected() {
        return;
    }

    if let Some((topic, payload)) = handler.farewell()
        && let Err(e) = link
            .client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)
    {
        debug!("Could not queue {} farewell message: {}", link.name, e);
    }

    if let Err(e) = link.client.try_disconnect() {
        debug!("Could not queue {} disconnect: {}", link.name, e);
    }

    let drain = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        warn!("{} disconnect did not complete within {:?}", link.name, SHUTDOWN_DRAIN);
    }

    link.set_connected(false);
}
