//! Cayenne Low Power Payload.
//!
//! Records are `[channel][type][data...]` with a data length fixed by the
//! type. Multi-axis types produce one measurement per axis.

use chrono::{DateTime, Utc};

use super::{DecodeError, DecodedMeasurement, PayloadDecoder};

const DIGITAL_INPUT: u8 = 0;
const DIGITAL_OUTPUT: u8 = 1;
const ANALOG_INPUT: u8 = 2;
const ANALOG_OUTPUT: u8 = 3;
const ILLUMINANCE: u8 = 101;
const PRESENCE: u8 = 102;
const TEMPERATURE: u8 = 103;
const HUMIDITY: u8 = 104;
const ACCELEROMETER: u8 = 113;
const BAROMETER: u8 = 115;
const GYROMETER: u8 = 134;
const GPS: u8 = 136;

const HEADER_SIZE: usize = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct CayenneLppDecoder;

impl CayenneLppDecoder {
    pub fn new() -> Self {
        Self
    }

    fn data_size(type_id: u8) -> Result<usize, DecodeError> {
        match type_id {
            DIGITAL_INPUT | DIGITAL_OUTPUT | PRESENCE | HUMIDITY => Ok(1),
            ANALOG_INPUT | ANALOG_OUTPUT | ILLUMINANCE | TEMPERATURE | BAROMETER => Ok(2),
            ACCELEROMETER | GYROMETER => Ok(6),
            GPS => Ok(9),
            other => Err(DecodeError::UnsupportedType(other)),
        }
    }

    /// Walk the record structure without producing values
    fn walk(payload: &[u8]) -> Result<Vec<(u8, u8, &[u8])>, DecodeError> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset < payload.len() {
            if offset + HEADER_SIZE > payload.len() {
                return Err(DecodeError::InsufficientData {
                    expected: HEADER_SIZE,
                    actual: payload.len() - offset,
                });
            }

            let channel = payload[offset];
            let type_id = payload[offset + 1];
            offset += HEADER_SIZE;

            let size = Self::data_size(type_id)?;
            if offset + size > payload.len() {
                return Err(DecodeError::InsufficientData {
                    expected: size,
                    actual: payload.len() - offset,
                });
            }

            records.push((channel, type_id, &payload[offset..offset + size]));
            offset += size;
        }

        Ok(records)
    }

    fn push_values(
        out: &mut Vec<DecodedMeasurement>,
        channel: u8,
        type_id: u8,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) {
        let mut push = |name: &str, value: f64, unit: &str| {
            out.push(DecodedMeasurement::new(
                format!("{name}_{channel}"),
                value,
                unit,
                timestamp,
            ));
        };

        match type_id {
            DIGITAL_INPUT => push("digital_input", data[0] as f64, ""),
            DIGITAL_OUTPUT => push("digital_output", data[0] as f64, ""),
            ANALOG_INPUT => push("analog_input", i16_at(data, 0) as f64 / 100.0, ""),
            ANALOG_OUTPUT => push("analog_output", i16_at(data, 0) as f64 / 100.0, ""),
            ILLUMINANCE => push("illuminance", u16_at(data, 0) as f64, "lux"),
            PRESENCE => push("presence", data[0] as f64, ""),
            TEMPERATURE => push("temperature", i16_at(data, 0) as f64 / 10.0, "°C"),
            HUMIDITY => push("humidity", data[0] as f64 / 2.0, "%"),
            BAROMETER => push("barometer", u16_at(data, 0) as f64 / 10.0, "hPa"),
            ACCELEROMETER => {
                push("accelerometer_x", i16_at(data, 0) as f64 / 1000.0, "G");
                push("accelerometer_y", i16_at(data, 2) as f64 / 1000.0, "G");
                push("accelerometer_z", i16_at(data, 4) as f64 / 1000.0, "G");
            }
            GYROMETER => {
                push("gyrometer_x", i16_at(data, 0) as f64 / 100.0, "°/s");
                push("gyrometer_y", i16_at(data, 2) as f64 / 100.0, "°/s");
                push("gyrometer_z", i16_at(data, 4) as f64 / 100.0, "°/s");
            }
            GPS => {
                push("gps_latitude", i24_at(data, 0) as f64 / 10000.0, "°");
                push("gps_longitude", i24_at(data, 3) as f64 / 10000.0, "°");
                push("gps_altitude", i24_at(data, 6) as f64 / 100.0, "m");
            }
            // walk() already rejected anything else
            _ => {}
        }
    }
}

fn i16_at(data: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([data[at], data[at + 1]])
}

fn u16_at(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn i24_at(data: &[u8], at: usize) -> i32 {
    // Place the 24 bits high and shift back down to sign-extend
    let raw = (i32::from(data[at]) << 24)
        | (i32::from(data[at + 1]) << 16)
        | (i32::from(data[at + 2]) << 8);
    raw >> 8
}

impl PayloadDecoder for CayenneLppDecoder {
    fn name(&self) -> &str {
        "cayenne-lpp"
    }

    fn can_decode(&self, payload: &[u8], _f_port: i32) -> bool {
        !payload.is_empty() && Self::walk(payload).is_ok()
    }

    fn decode(
        &self,
        payload: &[u8],
        _dev_eui: &str,
        _f_port: i32,
    ) -> Result<Vec<DecodedMeasurement>, DecodeError> {
        let timestamp = Utc::now();
        let mut measurements = Vec::new();

        for (channel, type_id, data) in Self::walk(payload)? {
            Self::push_values(&mut measurements, channel, type_id, data, timestamp);
        }

        Ok(measurements)
    }
}
