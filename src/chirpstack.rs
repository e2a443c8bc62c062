//! ChirpStack MQTT integration event schema.
//!
//! ChirpStack publishes device events as JSON on
//! `application/{application_id}/device/{dev_eui}/event/{type}`. Only the
//! `up` and `join` events are consumed by the bridge. Every field is optional
//! so partially populated events (older ChirpStack versions, simulators)
//! still deserialize.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimum number of `/`-separated segments in an event topic
pub const MIN_TOPIC_SEGMENTS: usize = 6;

/// Index of the event type segment (`up`, `join`, ...)
const EVENT_TYPE_SEGMENT: usize = 5;

/// Index of the DevEUI segment
const DEV_EUI_SEGMENT: usize = 3;

/// Uplink event: a device transmitted data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UplinkEvent {
    pub deduplication_id: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub device_info: Option<DeviceInfo>,
    pub dev_addr: Option<String>,
    pub adr: bool,
    pub dr: i32,
    pub f_cnt: u32,
    pub f_port: i32,
    pub confirmed: bool,
    /// Base64 encoded FRMPayload
    pub data: Option<String>,
    pub rx_info: Option<Vec<RxInfo>>,
    pub tx_info: Option<TxInfo>,
}

impl UplinkEvent {
    /// DevEUI reported in the event body
    pub fn dev_eui(&self) -> Option<&str> {
        self.device_info.as_ref()?.dev_eui.as_deref()
    }

    /// Decode the base64 `data` field.
    ///
    /// Returns `None` when the field is missing, empty, or not valid base64.
    pub fn decoded_data(&self) -> Option<Vec<u8>> {
        let data = self.data.as_deref()?;
        if data.is_empty() {
            return None;
        }
        STANDARD.decode(data).ok()
    }

    /// First gateway reception report, if any
    pub fn first_rx(&self) -> Option<&RxInfo> {
        self.rx_info.as_ref()?.first()
    }
}

/// Join event: a device (re)joined the network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinEvent {
    pub deduplication_id: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub device_info: Option<DeviceInfo>,
    pub dev_addr: Option<String>,
}

impl JoinEvent {
    pub fn dev_eui(&self) -> Option<&str> {
        self.device_info.as_ref()?.dev_eui.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub tenant_id: Option<String>,
    pub tenant_name: Option<String>,
    pub application_id: Option<String>,
    pub application_name: Option<String>,
    pub device_profile_id: Option<String>,
    pub device_profile_name: Option<String>,
    pub device_name: Option<String>,
    pub dev_eui: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Reception report from a single gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RxInfo {
    pub gateway_id: Option<String>,
    pub uplink_id: u32,
    pub ns_time: Option<DateTime<Utc>>,
    pub rssi: i32,
    pub snr: f64,
    pub channel: i32,
    pub location: Option<GatewayLocation>,
    pub context: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub crc_status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub source: Option<String>,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TxInfo {
    pub frequency: u32,
    pub modulation: Option<Modulation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Modulation {
    pub lora: Option<LoraModulation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoraModulation {
    pub bandwidth: u32,
    pub spreading_factor: i32,
    pub code_rate: Option<String>,
}

/// Event kind selected by the topic's event type segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Uplink,
    Join,
    /// Any other ChirpStack event (`status`, `ack`, `txack`, `log`, ...)
    Other,
}

/// Parsed ChirpStack event topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopic<'a> {
    pub dev_eui: &'a str,
    pub event_type: &'a str,
    pub kind: EventKind,
}

/// Parse `application/{app}/device/{dev_eui}/event/{type}`.
///
/// Returns `None` when the topic has fewer than six segments.
pub fn parse_event_topic(topic: &str) -> Option<EventTopic<'_>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < MIN_TOPIC_SEGMENTS {
        return None;
    }

    let event_type = parts[EVENT_TYPE_SEGMENT];
    let kind = match event_type {
        "up" => EventKind::Uplink,
        "join" => EventKind::Join,
        _ => EventKind::Other,
    };

    Some(EventTopic {
        dev_eui: parts[DEV_EUI_SEGMENT],
        event_type,
        kind,
    })
}
