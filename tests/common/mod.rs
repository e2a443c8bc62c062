//! Shared fixtures for bridge integration tests.
//!
//! Nothing here talks to a broker: [`RecordingTransport`] captures publishes in
//! memory and [`StubDecoder`] returns canned measurements.

#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{TimeZone, Utc};
use rumqttc::QoS;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use lorawan_bridge::chirpstack::{DeviceInfo, JoinEvent, RxInfo, UplinkEvent};
use lorawan_bridge::decoder::{DecodeError, DecodedMeasurement, PayloadDecoder};
use lorawan_bridge::mqtt::MessageTransport;
use lorawan_bridge::orchestrator::UpstreamStatus;
use lorawan_bridge::subscriber::SubscriberStats;

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

/// In-memory transport recording every successful publish
#[derive(Debug)]
pub struct RecordingTransport {
    published: Mutex<Vec<Published>>,
    connected: AtomicBool,
    failures_pending: AtomicUsize,
    stalled_prefix: Mutex<Option<String>>,
}

impl RecordingTransport {
    pub fn connected() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            failures_pending: AtomicUsize::new(0),
            stalled_prefix: Mutex::new(None),
        }
    }

    pub fn disconnected() -> Self {
        let transport = Self::connected();
        transport.connected.store(false, Ordering::SeqCst);
        transport
    }

    /// Make the next `count` publishes fail
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Publishes to topics under `prefix` never complete
    pub fn stall(&self, prefix: &str) {
        *self.stalled_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, prefix: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected");
        }

        let stalled = self
            .stalled_prefix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| topic.starts_with(prefix));
        if stalled {
            std::future::pending::<()>().await;
        }

        let should_fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            bail!("simulated publish failure");
        }

        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Decoder returning a fixed set of measurements for any payload on the
/// accepted port
pub struct StubDecoder {
    pub accept_port: i32,
    pub measurements: Vec<(&'static str, f64, &'static str)>,
    pub panic_on_decode: bool,
}

impl StubDecoder {
    pub fn returning(accept_port: i32, measurements: Vec<(&'static str, f64, &'static str)>) -> Self {
        Self {
            accept_port,
            measurements,
            panic_on_decode: false,
        }
    }

    pub fn panicking(accept_port: i32) -> Self {
        Self {
            accept_port,
            measurements: Vec::new(),
            panic_on_decode: true,
        }
    }
}

impl PayloadDecoder for StubDecoder {
    fn name(&self) -> &str {
        "stub"
    }

    fn can_decode(&self, payload: &[u8], f_port: i32) -> bool {
        !payload.is_empty() && f_port == self.accept_port
    }

    fn decode(
        &self,
        _payload: &[u8],
        _dev_eui: &str,
        _f_port: i32,
    ) -> Result<Vec<DecodedMeasurement>, DecodeError> {
        if self.panic_on_decode {
            panic!("stub decoder asked to panic");
        }

        let timestamp = Utc::now();
        Ok(self
            .measurements
            .iter()
            .map(|(kind, value, unit)| DecodedMeasurement::new(*kind, *value, *unit, timestamp))
            .collect())
    }
}

/// Upstream status with settable values
#[derive(Debug, Default)]
pub struct FakeUpstream {
    pub connected: AtomicBool,
    pub stats: Mutex<SubscriberStats>,
}

impl UpstreamStatus for FakeUpstream {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> SubscriberStats {
        self.stats.lock().unwrap().clone()
    }
}

pub fn device_info(dev_eui: &str) -> DeviceInfo {
    DeviceInfo {
        tenant_id: Some("52f14cd4-c6f1-4fbd-8f87-4025e1d49242".to_string()),
        application_id: Some("17c82e96-be03-4f38-aef3-f83d48582d97".to_string()),
        application_name: Some("Erft".to_string()),
        device_profile_id: Some("14855bf7-d10d-4aee-b618-ebfcb64dc7ad".to_string()),
        device_profile_name: Some("myIoTGrid LoRa32".to_string()),
        dev_eui: Some(dev_eui.to_string()),
        ..Default::default()
    }
}

pub fn uplink(dev_eui: &str, f_port: i32, payload: &[u8]) -> UplinkEvent {
    UplinkEvent {
        time: Some(Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap()),
        device_info: Some(device_info(dev_eui)),
        dev_addr: Some("00189440".to_string()),
        f_cnt: 42,
        f_port,
        data: Some(STANDARD.encode(payload)),
        rx_info: Some(vec![RxInfo {
            gateway_id: Some("0016c001f153a14c".to_string()),
            rssi: -87,
            snr: 7.5,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn join(dev_eui: Option<&str>, device_name: Option<&str>) -> JoinEvent {
    JoinEvent {
        time: Some(Utc.with_ymd_and_hms(2024, 5, 4, 11, 59, 0).unwrap()),
        device_info: dev_eui.map(|eui| DeviceInfo {
            device_name: device_name.map(str::to_string),
            ..device_info(eui)
        }),
        dev_addr: Some("01ab2c3d".to_string()),
        ..Default::default()
    }
}

/// Poll `condition` every 10ms for up to two seconds
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// MQTT 3.1.1 control packet types (upper nibble of the fixed header)
pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

const BROKER_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// One raw control packet as seen on the wire
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: u8,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn kind(&self) -> u8 {
        self.header >> 4
    }

    pub fn retain(&self) -> bool {
        self.header & 0x01 != 0
    }

    pub fn qos(&self) -> u8 {
        (self.header >> 1) & 0x03
    }

    /// CONNECT flags byte, after protocol name and level
    pub fn connect_flags(&self) -> u8 {
        let name_len = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
        self.body[2 + name_len + 1]
    }

    /// Topic, packet id and payload of a PUBLISH
    pub fn publish(&self) -> (String, Option<u16>, Vec<u8>) {
        let topic_len = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
        let topic = String::from_utf8(self.body[2..2 + topic_len].to_vec()).unwrap();
        let mut offset = 2 + topic_len;
        let packet_id = (self.qos() > 0).then(|| {
            let id = u16::from_be_bytes([self.body[offset], self.body[offset + 1]]);
            offset += 2;
            id
        });
        (topic, packet_id, self.body[offset..].to_vec())
    }

    /// Packet id and topic filters of a SUBSCRIBE
    pub fn subscription(&self) -> (u16, Vec<String>) {
        let packet_id = u16::from_be_bytes([self.body[0], self.body[1]]);
        let mut filters = Vec::new();
        let mut offset = 2;
        while offset < self.body.len() {
            let len = u16::from_be_bytes([self.body[offset], self.body[offset + 1]]) as usize;
            offset += 2;
            filters.push(String::from_utf8(self.body[offset..offset + len].to_vec()).unwrap());
            // requested QoS
            offset += len + 1;
        }
        (packet_id, filters)
    }
}

fn encode_packet(header: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![header];
    let mut remaining = body.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        frame.push(byte);
        if remaining == 0 {
            break;
        }
    }
    frame.extend_from_slice(body);
    frame
}

/// Minimal MQTT broker on a random local port, one client at a time
pub struct FakeBroker {
    listener: TcpListener,
}

impl FakeBroker {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr())
    }

    /// Accept a TCP connection and read its CONNECT without answering it
    pub async fn accept_pending(&self) -> (BrokerSession, Packet) {
        let (stream, _) = tokio::time::timeout(BROKER_IO_TIMEOUT, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        let mut session = BrokerSession { stream };
        let connect = session.expect(CONNECT).await;
        (session, connect)
    }

    /// Accept a client and complete the handshake with a clean-session CONNACK
    pub async fn accept(&self) -> (BrokerSession, Packet) {
        let (mut session, connect) = self.accept_pending().await;
        session.send(CONNACK << 4, &[0x00, 0x00]).await;
        (session, connect)
    }
}

/// Broker side of one client connection
pub struct BrokerSession {
    stream: TcpStream,
}

impl BrokerSession {
    pub async fn send(&mut self, header: u8, body: &[u8]) {
        self.stream
            .write_all(&encode_packet(header, body))
            .await
            .unwrap();
    }

    pub async fn read_packet(&mut self) -> Packet {
        tokio::time::timeout(BROKER_IO_TIMEOUT, async {
            let header = self.stream.read_u8().await.unwrap();
            let mut length = 0usize;
            let mut shift = 0;
            loop {
                let byte = self.stream.read_u8().await.unwrap();
                length |= ((byte & 0x7F) as usize) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            let mut body = vec![0u8; length];
            self.stream.read_exact(&mut body).await.unwrap();
            Packet { header, body }
        })
        .await
        .expect("no packet from client")
    }

    /// Next packet of `kind`, answering keep-alive pings on the way
    pub async fn expect(&mut self, kind: u8) -> Packet {
        loop {
            let packet = self.read_packet().await;
            if packet.kind() == kind {
                return packet;
            }
            match packet.kind() {
                PINGREQ => self.send(PINGRESP << 4, &[]).await,
                other => panic!("expected packet type {}, got {}", kind, other),
            }
        }
    }

    /// Read a SUBSCRIBE, grant every filter at QoS 1 and return the filters
    pub async fn accept_subscribe(&mut self) -> Vec<String> {
        let (packet_id, filters) = self.expect(SUBSCRIBE).await.subscription();
        let mut body = packet_id.to_be_bytes().to_vec();
        body.extend(std::iter::repeat_n(0x01, filters.len()));
        self.send(SUBACK << 4, &body).await;
        filters
    }

    /// Read a PUBLISH and acknowledge it when QoS 1
    pub async fn accept_publish(&mut self) -> Packet {
        let packet = self.expect(PUBLISH).await;
        if let (_, Some(packet_id), _) = packet.publish() {
            self.send(PUBACK << 4, &packet_id.to_be_bytes()).await;
        }
        packet
    }

    /// Deliver a QoS 0 message to the client
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        self.send(PUBLISH << 4, &body).await;
    }
}
