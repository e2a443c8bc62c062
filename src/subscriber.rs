use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{QoS, SubscribeFilter};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chirpstack::{EventKind, JoinEvent, UplinkEvent, parse_event_topic};
use crate::config::ChirpStackConfig;
use crate::mqtt::{self, MqttLink, SessionHandler};

pub const DEFAULT_PORT: u16 = 1883;

/// Event handed from the subscriber to the orchestrator
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Uplink(UplinkEvent),
    Join(JoinEvent),
}

#[derive(Debug, Default)]
struct SubscriberCounters {
    uplinks_received: AtomicU64,
    joins_received: AtomicU64,
    errors: AtomicU64,
    last_uplink_at: RwLock<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of the subscriber counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub uplinks_received: u64,
    pub joins_received: u64,
    pub errors: u64,
    pub last_uplink_at: Option<DateTime<Utc>>,
}

/// Consumes device events from the ChirpStack broker
pub struct ChirpStackSubscriber {
    link: MqttLink,
    topics: Vec<String>,
    events: flume::Sender<BridgeEvent>,
    reconnect_delay: Duration,
    counters: SubscriberCounters,
}

impl ChirpStackSubscriber {
    pub fn new(
        config: &ChirpStackConfig,
        events: flume::Sender<BridgeEvent>,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        let link = MqttLink::new(
            "ChirpStack",
            &config.mqtt_server,
            DEFAULT_PORT,
            mqtt::client_id(&config.client_id, "subscriber"),
            None,
        )
        .context("Invalid ChirpStack MQTT settings")?;

        Ok(Self {
            link,
            topics: vec![config.uplink_topic.clone(), config.join_topic.clone()],
            events,
            reconnect_delay,
            counters: SubscriberCounters::default(),
        })
    }

    /// Connect, subscribe and consume until `cancel` fires
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        mqtt::drive_connection(&self.link, self, self.reconnect_delay, &cancel).await
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            uplinks_received: self.counters.uplinks_received.load(Ordering::Relaxed),
            joins_received: self.counters.joins_received.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            last_uplink_at: self
                .counters
                .last_uplink_at
                .read()
                .map(|guard| *guard)
                .unwrap_or_default(),
        }
    }

    fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lorawan_bridge.subscriber.errors_total").increment(1);
    }

    /// Parse one broker message and forward it to the orchestrator.
    ///
    /// Never fails: malformed input is logged and counted.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(parsed) = parse_event_topic(topic) else {
            warn!(topic = %topic, "Invalid ChirpStack topic format, skipping message");
            self.record_error();
            return;
        };

        let event = match parsed.kind {
            EventKind::Uplink => match serde_json::from_slice::<UplinkEvent>(payload) {
                Ok(uplink) => {
                    let dev_eui = uplink.dev_eui().unwrap_or(parsed.dev_eui);
                    debug!(
                        dev_eui = %dev_eui,
                        f_port = uplink.f_port,
                        f_cnt = uplink.f_cnt,
                        "Uplink received"
                    );

                    self.counters.uplinks_received.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut last) = self.counters.last_uplink_at.write() {
                        *last = Some(Utc::now());
                    }
                    metrics::counter!("lorawan_bridge.uplinks_received_total").increment(1);
                    BridgeEvent::Uplink(uplink)
                }
                Err(e) => {
                    warn!(topic = %topic, dev_eui = %parsed.dev_eui, "Failed to parse uplink event: {}", e);
                    self.record_error();
                    return;
                }
            },
            EventKind::Join => match serde_json::from_slice::<JoinEvent>(payload) {
                Ok(join) => {
                    let dev_eui = join.dev_eui().unwrap_or(parsed.dev_eui);
                    info!(dev_eui = %dev_eui, "Device joined network");

                    self.counters.joins_received.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("lorawan_bridge.joins_received_total").increment(1);
                    BridgeEvent::Join(join)
                }
                Err(e) => {
                    warn!(topic = %topic, dev_eui = %parsed.dev_eui, "Failed to parse join event: {}", e);
                    self.record_error();
                    return;
                }
            },
            EventKind::Other => {
                debug!(topic = %topic, event_type = %parsed.event_type, "Ignoring ChirpStack event");
                return;
            }
        };

        if self.events.send_async(event).await.is_err() {
            debug!("Event channel closed, dropping event");
        }
    }
}

#[async_trait]
impl SessionHandler for ChirpStackSubscriber {
    fn on_connected(&self, reconnect: bool) -> Result<()> {
        let filters = self
            .topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce));

        self.link
            .client()
            .try_subscribe_many(filters)
            .context("Failed to queue ChirpStack subscriptions")?;

        info!(
            topics = ?self.topics,
            reconnect,
            "Subscribed to ChirpStack topics"
        );
        Ok(())
    }

    async fn on_publish(&self, topic: &str, payload: &[u8]) {
        self.handle_message(topic, payload).await;
    }
}
