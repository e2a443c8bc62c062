use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{LastWill, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MyIoTGridConfig;
use crate::messages::{
    NODES_JOINED_TOPIC, NodeJoinedMessage, ReadingMessage, STATUS_TOPIC, StatusMessage,
};
use crate::mqtt::{self, MessageTransport, MqttLink, SessionHandler};

pub const DEFAULT_PORT: u16 = 1884;

#[derive(Debug, Default)]
struct PublisherCounters {
    readings_published: AtomicU64,
    joins_published: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub readings_published: u64,
    pub joins_published: u64,
    pub errors: u64,
}

/// Publishes normalized events to the myIoTGrid broker.
///
/// Publish operations never fail towards the caller. Failures are logged and
/// counted so they surface in the next status broadcast.
pub struct MyIoTGridPublisher<T> {
    transport: T,
    counters: PublisherCounters,
}

impl<T: MessageTransport> MyIoTGridPublisher<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            counters: PublisherCounters::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            readings_published: self.counters.readings_published.load(Ordering::Relaxed),
            joins_published: self.counters.joins_published.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    pub async fn publish_reading(&self, reading: &ReadingMessage) {
        let topic = reading.topic();
        if self.publish_json("reading", &topic, false, reading).await {
            self.counters.readings_published.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("lorawan_bridge.readings_published_total").increment(1);
            debug!(
                node_id = %reading.node_id,
                sensor_type = %reading.sensor_type,
                "Published reading {} {}",
                reading.value,
                reading.unit
            );
        }
    }

    pub async fn publish_node_joined(&self, joined: &NodeJoinedMessage) {
        if self
            .publish_json("node joined", NODES_JOINED_TOPIC, true, joined)
            .await
        {
            self.counters.joins_published.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("lorawan_bridge.joins_published_total").increment(1);
            info!(node_id = %joined.node_id, dev_eui = %joined.dev_eui, "Published node joined");
        }
    }

    pub async fn publish_status(&self, status: &StatusMessage) {
        if self.publish_json("status", STATUS_TOPIC, true, status).await {
            debug!(status = %status.status, "Published bridge status");
        }
    }

    async fn publish_json<M: Serialize + Sync>(
        &self,
        kind: &str,
        topic: &str,
        retain: bool,
        message: &M,
    ) -> bool {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize {} message: {}", kind, e);
                self.record_error();
                return false;
            }
        };

        match self
            .transport
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(topic = %topic, "Failed to publish {}: {:#}", kind, e);
                self.record_error();
                false
            }
        }
    }

    fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lorawan_bridge.publisher.errors_total").increment(1);
    }
}

fn offline_payload() -> Result<Vec<u8>> {
    serde_json::to_vec(&StatusMessage::offline()).context("Failed to serialize offline status")
}

impl MyIoTGridPublisher<MqttLink> {
    /// Build the broker link, registering a retained offline last will
    pub fn new(config: &MyIoTGridConfig) -> Result<Self> {
        let last_will = LastWill::new(STATUS_TOPIC, offline_payload()?, QoS::AtLeastOnce, true);
        let link = MqttLink::new(
            "myIoTGrid",
            &config.mqtt_server,
            DEFAULT_PORT,
            mqtt::client_id(&config.client_id, "publisher"),
            Some(last_will),
        )
        .context("Invalid myIoTGrid MQTT settings")?;

        Ok(Self::with_transport(link))
    }

    /// Keep the connection alive until `cancel` fires, then say goodbye
    pub async fn start(&self, reconnect_delay: Duration, cancel: CancellationToken) -> Result<()> {
        mqtt::drive_connection(&self.transport, self, reconnect_delay, &cancel).await
    }
}

#[async_trait]
impl SessionHandler for MyIoTGridPublisher<MqttLink> {
    fn on_connected(&self, reconnect: bool) -> Result<()> {
        // Presence only; the orchestrator's periodic status carries full state
        let online = serde_json::to_vec(&StatusMessage::online(false, true, None))
            .context("Failed to serialize online status")?;

        self.transport
            .client()
            .try_publish(STATUS_TOPIC, QoS::AtLeastOnce, true, online)
            .context("Failed to queue online status")?;

        info!(reconnect, "Announced bridge online");
        Ok(())
    }

    fn farewell(&self) -> Option<(String, Vec<u8>)> {
        match offline_payload() {
            Ok(payload) => Some((STATUS_TOPIC.to_string(), payload)),
            Err(e) => {
                debug!("Skipping offline status: {:#}", e);
                None
            }
        }
    }
}
