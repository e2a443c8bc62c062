//! Payload decoders turning raw LoRaWAN FRMPayload bytes into measurements.
//!
//! A deployment selects exactly one decoder at startup. The orchestrator asks
//! [`PayloadDecoder::can_decode`] first and skips payloads the decoder does not
//! recognise, so a mismatched decoder only drops messages.

pub mod cayenne_lpp;
pub mod myiotgrid;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

pub use cayenne_lpp::CayenneLppDecoder;
pub use myiotgrid::MyIoTGridDecoder;

/// One typed value extracted from a payload
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMeasurement {
    /// Free-form measurement type, e.g. `temperature`
    pub measurement_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl DecodedMeasurement {
    pub fn new(
        measurement_type: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            measurement_type: measurement_type.into(),
            value,
            unit: unit.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("invalid payload length {length}: must be a multiple of {record_size}")]
    InvalidLength { length: usize, record_size: usize },

    #[error("unsupported sensor type: 0x{0:02X}")]
    UnsupportedType(u8),

    #[error("unknown sensor type name: {0}")]
    UnknownSensorType(String),
}

/// Decode contract: binary in, typed measurements out
pub trait PayloadDecoder: Send + Sync {
    /// Name reported in reading provenance metadata and logs
    fn name(&self) -> &str;

    /// Whether this decoder understands a payload received on `f_port`
    fn can_decode(&self, payload: &[u8], f_port: i32) -> bool;

    fn decode(
        &self,
        payload: &[u8],
        dev_eui: &str,
        f_port: i32,
    ) -> Result<Vec<DecodedMeasurement>, DecodeError>;
}

/// Look up a decoder by its configuration name
pub fn decoder_by_name(name: &str) -> Result<Arc<dyn PayloadDecoder>> {
    match name.to_ascii_lowercase().as_str() {
        "myiotgrid" => Ok(Arc::new(MyIoTGridDecoder::new())),
        "cayenne-lpp" | "cayenne_lpp" | "cayenne" => Ok(Arc::new(CayenneLppDecoder::new())),
        other => Err(anyhow::anyhow!(
            "Unknown payload decoder '{}' - expected 'myiotgrid' or 'cayenne-lpp'",
            other
        )),
    }
}
