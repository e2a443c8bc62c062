//! Outbound envelopes published to the myIoTGrid broker.
//!
//! All payloads are camelCase JSON. Topics and retain flags are fixed here so
//! the publisher and the downstream hub agree on one contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const READINGS_TOPIC_PREFIX: &str = "myiotgrid/readings";
pub const NODES_JOINED_TOPIC: &str = "myiotgrid/nodes/joined";
pub const STATUS_TOPIC: &str = "myiotgrid/status/gateway-lorawan";

pub const PROTOCOL_LORAWAN: &str = "LoRaWAN";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// `myiotgrid/readings/{node_id}/{measurement_type}`
pub fn reading_topic(node_id: &Uuid, measurement_type: &str) -> String {
    format!("{READINGS_TOPIC_PREFIX}/{node_id}/{measurement_type}")
}

/// One decoded measurement with full LoRaWAN provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingMessage {
    pub node_id: Uuid,
    pub sensor_id: Uuid,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// devEui, devAddr, fCnt, fPort, rssi, snr, gatewayId, decoder
    pub metadata: BTreeMap<String, String>,
}

impl ReadingMessage {
    pub fn topic(&self) -> String {
        reading_topic(&self.node_id, &self.sensor_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeJoinedMessage {
    pub node_id: Uuid,
    pub dev_eui: String,
    pub dev_addr: Option<String>,
    pub name: String,
    pub protocol: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatistics {
    pub uplinks_received: u64,
    pub readings_published: u64,
    pub joins_received: u64,
    pub errors: u64,
    pub last_uplink_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub connected_to_chirp_stack: bool,
    #[serde(rename = "connectedToMyIoTGrid")]
    pub connected_to_myiotgrid: bool,
    pub statistics: Option<BridgeStatistics>,
}

impl StatusMessage {
    pub fn online(
        connected_to_chirp_stack: bool,
        connected_to_myiotgrid: bool,
        statistics: Option<BridgeStatistics>,
    ) -> Self {
        Self {
            status: STATUS_ONLINE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            connected_to_chirp_stack,
            connected_to_myiotgrid,
            statistics,
        }
    }

    pub fn offline() -> Self {
        Self {
            status: STATUS_OFFLINE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            connected_to_chirp_stack: false,
            connected_to_myiotgrid: false,
            statistics: None,
        }
    }
}
