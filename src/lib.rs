//! LoRaWAN ingestion bridge
//!
//! Subscribes to ChirpStack device events, decodes uplink payloads into
//! sensor readings with stable identifiers, and republishes them to the
//! myIoTGrid broker.

pub mod chirpstack;
pub mod config;
pub mod decoder;
pub mod identity;
pub mod log_format;
pub mod messages;
pub mod mqtt;
pub mod orchestrator;
pub mod publisher;
pub mod subscriber;
pub mod telemetry;

pub use config::BridgeConfig;
pub use decoder::{DecodedMeasurement, PayloadDecoder};
pub use orchestrator::BridgeOrchestrator;
pub use publisher::MyIoTGridPublisher;
pub use subscriber::{BridgeEvent, ChirpStackSubscriber};
