//! Routes ChirpStack events through the decoder and identity mapping to the
//! myIoTGrid publisher, and broadcasts bridge status on a fixed interval.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chirpstack::{JoinEvent, UplinkEvent};
use crate::decoder::PayloadDecoder;
use crate::identity::IdentityMapper;
use crate::messages::{
    BridgeStatistics, NodeJoinedMessage, PROTOCOL_LORAWAN, ReadingMessage, StatusMessage,
};
use crate::mqtt::MessageTransport;
use crate::publisher::MyIoTGridPublisher;
use crate::subscriber::{BridgeEvent, SubscriberStats};

/// Device id used when an event carries no DevEUI
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Upstream state the orchestrator reports on
pub trait UpstreamStatus: Send + Sync {
    fn is_connected(&self) -> bool;
    fn stats(&self) -> SubscriberStats;
}

impl UpstreamStatus for crate::subscriber::ChirpStackSubscriber {
    fn is_connected(&self) -> bool {
        crate::subscriber::ChirpStackSubscriber::is_connected(self)
    }

    fn stats(&self) -> SubscriberStats {
        crate::subscriber::ChirpStackSubscriber::stats(self)
    }
}

/// `LoRa-` plus the last 8 characters of the device id
pub fn fallback_node_name(dev_eui: &str) -> String {
    let start = dev_eui
        .char_indices()
        .rev()
        .nth(7)
        .map(|(index, _)| index)
        .unwrap_or(0);
    format!("LoRa-{}", &dev_eui[start..])
}

pub struct BridgeOrchestrator<T> {
    decoder: Arc<dyn PayloadDecoder>,
    upstream: Arc<dyn UpstreamStatus>,
    publisher: Arc<MyIoTGridPublisher<T>>,
    identities: IdentityMapper,
    started_at: DateTime<Utc>,
    status_interval: Duration,
}

impl<T: MessageTransport + 'static> BridgeOrchestrator<T> {
    pub fn new(
        decoder: Arc<dyn PayloadDecoder>,
        upstream: Arc<dyn UpstreamStatus>,
        publisher: Arc<MyIoTGridPublisher<T>>,
        status_interval: Duration,
    ) -> Self {
        Self {
            decoder,
            upstream,
            publisher,
            identities: IdentityMapper::new(),
            started_at: Utc::now(),
            status_interval,
        }
    }

    pub fn identities(&self) -> &IdentityMapper {
        &self.identities
    }

    /// Consume events and broadcast status until cancellation.
    ///
    /// Every event and every status broadcast runs on its own task; a failing
    /// handler never stops the loop.
    pub async fn run(self: Arc<Self>, events: flume::Receiver<BridgeEvent>, cancel: CancellationToken) {
        info!(
            decoder = self.decoder.name(),
            "Bridge orchestrator started, status every {:?}",
            self.status_interval
        );

        let mut status_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.status_interval,
            self.status_interval,
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = status_timer.tick() => {
                    // Published off-loop so a slow broker never stalls event intake
                    let status = self.status_snapshot();
                    let publisher = Arc::clone(&self.publisher);
                    tokio::spawn(async move { publisher.publish_status(&status).await });
                }
                event = events.recv_async() => match event {
                    Ok(event) => {
                        let orchestrator = Arc::clone(&self);
                        tokio::spawn(async move { orchestrator.dispatch(event).await });
                    }
                    Err(_) => {
                        warn!("Event channel closed, waiting for shutdown");
                        cancel.cancelled().await;
                        break;
                    }
                },
            }
        }

        info!("Bridge orchestrator stopped");
    }

    /// Handle one event with panics contained
    pub async fn dispatch(&self, event: BridgeEvent) {
        let outcome = match event {
            BridgeEvent::Uplink(uplink) => catch_panic(self.handle_uplink(&uplink)).await,
            BridgeEvent::Join(join) => catch_panic(self.handle_join(&join)).await,
        };

        if outcome.is_err() {
            error!("Event handler panicked; continuing with next event");
            metrics::counter!("lorawan_bridge.handler_panics_total").increment(1);
        }
    }

    pub async fn handle_uplink(&self, uplink: &UplinkEvent) {
        let dev_eui = uplink.dev_eui().unwrap_or(UNKNOWN_DEVICE);

        let Some(payload) = uplink.decoded_data() else {
            warn!(dev_eui = %dev_eui, f_port = uplink.f_port, "Uplink has no payload");
            return;
        };

        if !self.decoder.can_decode(&payload, uplink.f_port) {
            warn!(
                decoder = self.decoder.name(),
                dev_eui = %dev_eui,
                f_port = uplink.f_port,
                length = payload.len(),
                "Decoder cannot handle payload"
            );
            return;
        }

        let measurements = match self.decoder.decode(&payload, dev_eui, uplink.f_port) {
            Ok(measurements) => measurements,
            Err(e) => {
                error!(
                    decoder = self.decoder.name(),
                    dev_eui = %dev_eui,
                    "Failed to decode uplink: {}",
                    e
                );
                return;
            }
        };

        let node_id = self.identities.node_id(dev_eui);
        let metadata = self.uplink_metadata(uplink, dev_eui);

        for measurement in &measurements {
            let reading = ReadingMessage {
                node_id,
                sensor_id: self
                    .identities
                    .sensor_id(dev_eui, &measurement.measurement_type),
                sensor_type: measurement.measurement_type.clone(),
                value: measurement.value,
                unit: measurement.unit.clone(),
                timestamp: measurement.timestamp,
                metadata: metadata.clone(),
            };
            self.publisher.publish_reading(&reading).await;
        }

        debug!(
            dev_eui = %dev_eui,
            node_id = %node_id,
            "Processed uplink into {} readings",
            measurements.len()
        );
    }

    fn uplink_metadata(&self, uplink: &UplinkEvent, dev_eui: &str) -> BTreeMap<String, String> {
        let rx = uplink.first_rx();

        BTreeMap::from([
            ("devEui".to_string(), dev_eui.to_string()),
            (
                "devAddr".to_string(),
                uplink.dev_addr.clone().unwrap_or_default(),
            ),
            ("fCnt".to_string(), uplink.f_cnt.to_string()),
            ("fPort".to_string(), uplink.f_port.to_string()),
            (
                "rssi".to_string(),
                rx.map(|rx| rx.rssi.to_string()).unwrap_or_default(),
            ),
            (
                "snr".to_string(),
                rx.map(|rx| rx.snr.to_string()).unwrap_or_default(),
            ),
            (
                "gatewayId".to_string(),
                rx.and_then(|rx| rx.gateway_id.clone()).unwrap_or_default(),
            ),
            ("decoder".to_string(), self.decoder.name().to_string()),
        ])
    }

    pub async fn handle_join(&self, join: &JoinEvent) {
        let dev_eui = join.dev_eui().unwrap_or(UNKNOWN_DEVICE);
        let info = join.device_info.clone().unwrap_or_default();

        let name = info
            .device_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback_node_name(dev_eui));

        let joined = NodeJoinedMessage {
            node_id: self.identities.node_id(dev_eui),
            dev_eui: dev_eui.to_string(),
            dev_addr: join.dev_addr.clone(),
            name,
            protocol: PROTOCOL_LORAWAN.to_string(),
            timestamp: join.time.unwrap_or_else(Utc::now),
            metadata: BTreeMap::from([
                ("tenantId".to_string(), info.tenant_id.unwrap_or_default()),
                ("applicationId".to_string(), info.application_id.unwrap_or_default()),
                ("applicationName".to_string(), info.application_name.unwrap_or_default()),
                ("deviceProfileId".to_string(), info.device_profile_id.unwrap_or_default()),
                ("deviceProfileName".to_string(), info.device_profile_name.unwrap_or_default()),
            ]),
        };

        self.publisher.publish_node_joined(&joined).await;
    }

    /// Combined connectivity and counters from both connections
    pub fn status_snapshot(&self) -> StatusMessage {
        let upstream = self.upstream.stats();
        let downstream = self.publisher.stats();

        StatusMessage::online(
            self.upstream.is_connected(),
            self.publisher.is_connected(),
            Some(BridgeStatistics {
                uplinks_received: upstream.uplinks_received,
                readings_published: downstream.readings_published,
                joins_received: upstream.joins_received,
                errors: upstream.errors + downstream.errors,
                last_uplink_at: upstream.last_uplink_at,
                started_at: self.started_at,
            }),
        )
    }
}

async fn catch_panic<F: Future<Output = ()>>(future: F) -> Result<(), ()> {
    AssertUnwindSafe(future).catch_unwind().await.map_err(|_| ())
}
