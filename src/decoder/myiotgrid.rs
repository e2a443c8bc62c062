//! myIoTGrid compact sensor payload.
//!
//! A payload is a sequence of 3-byte records:
//! - 1 byte: sensor type code
//! - 2 bytes: signed 16-bit value, big endian, scaled by the type's divisor
//!
//! Frame ports 1-10 are reserved for sensor data.

use chrono::Utc;
use tracing::{debug, warn};

use super::{DecodeError, DecodedMeasurement, PayloadDecoder};

const RECORD_SIZE: usize = 3;
const SENSOR_PORTS: std::ops::RangeInclusive<i32> = 1..=10;

/// (type code, measurement type, unit, divisor)
const SENSOR_TYPES: &[(u8, &str, &str, i32)] = &[
    // Environment
    (0x01, "temperature", "°C", 100),
    (0x02, "humidity", "%", 100),
    (0x03, "pressure", "hPa", 10),
    (0x04, "water_level", "cm", 10),
    (0x05, "battery", "%", 100),
    (0x06, "voltage", "V", 100),
    // GPS
    (0x10, "latitude", "°", 10000),
    (0x11, "longitude", "°", 10000),
    (0x12, "altitude", "m", 10),
    // Air quality
    (0x20, "pm25", "µg/m³", 1),
    (0x21, "pm10", "µg/m³", 1),
    (0x22, "co2", "ppm", 1),
    (0x23, "voc", "ppb", 1),
    // Light
    (0x30, "light", "lux", 1),
    (0x31, "uv", "index", 100),
    // Weather
    (0x40, "wind_speed", "m/s", 100),
    (0x41, "wind_direction", "°", 1),
    (0x42, "rainfall", "mm", 10),
    // Soil
    (0x50, "soil_moisture", "%", 100),
    (0x51, "soil_temperature", "°C", 100),
    (0x52, "soil_ph", "pH", 100),
    // Water
    (0x60, "water_temperature", "°C", 100),
    (0x61, "water_ph", "pH", 100),
    (0x62, "water_conductivity", "µS/cm", 1),
    (0x63, "water_dissolved_oxygen", "mg/L", 100),
    (0x64, "water_turbidity", "NTU", 10),
    (0x65, "water_flow", "m³/s", 1000),
    // System
    (0xF0, "rssi", "dBm", 1),
    (0xF1, "snr", "dB", 10),
    (0xFE, "error_code", "", 1),
    (0xFF, "status", "", 1),
];

fn sensor_by_code(code: u8) -> Option<(&'static str, &'static str, i32)> {
    SENSOR_TYPES
        .iter()
        .find(|(c, ..)| *c == code)
        .map(|&(_, name, unit, divisor)| (name, unit, divisor))
}

fn sensor_by_name(name: &str) -> Option<(u8, i32)> {
    SENSOR_TYPES
        .iter()
        .find(|(_, n, ..)| *n == name)
        .map(|&(code, _, _, divisor)| (code, divisor))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MyIoTGridDecoder;

impl MyIoTGridDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode one sensor value as a 3-byte record. Used by simulators and tests.
    pub fn encode(sensor_type: &str, value: f64) -> Result<[u8; RECORD_SIZE], DecodeError> {
        let (code, divisor) = sensor_by_name(sensor_type)
            .ok_or_else(|| DecodeError::UnknownSensorType(sensor_type.to_string()))?;

        let raw = (value * divisor as f64).round() as i16;
        let [hi, lo] = raw.to_be_bytes();
        Ok([code, hi, lo])
    }

    /// Encode several sensor values into one payload
    pub fn encode_multiple(readings: &[(&str, f64)]) -> Result<Vec<u8>, DecodeError> {
        let mut payload = Vec::with_capacity(readings.len() * RECORD_SIZE);
        for (sensor_type, value) in readings {
            payload.extend_from_slice(&Self::encode(sensor_type, *value)?);
        }
        Ok(payload)
    }
}

impl PayloadDecoder for MyIoTGridDecoder {
    fn name(&self) -> &str {
        "myIoTGrid"
    }

    fn can_decode(&self, payload: &[u8], f_port: i32) -> bool {
        !payload.is_empty() && payload.len() % RECORD_SIZE == 0 && SENSOR_PORTS.contains(&f_port)
    }

    fn decode(
        &self,
        payload: &[u8],
        dev_eui: &str,
        _f_port: i32,
    ) -> Result<Vec<DecodedMeasurement>, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::InsufficientData {
                expected: RECORD_SIZE,
                actual: 0,
            });
        }
        if payload.len() % RECORD_SIZE != 0 {
            return Err(DecodeError::InvalidLength {
                length: payload.len(),
                record_size: RECORD_SIZE,
            });
        }

        // One timestamp for every value in the frame
        let timestamp = Utc::now();
        let mut measurements = Vec::with_capacity(payload.len() / RECORD_SIZE);

        for record in payload.chunks_exact(RECORD_SIZE) {
            let code = record[0];
            let raw = i16::from_be_bytes([record[1], record[2]]);

            match sensor_by_code(code) {
                Some((name, unit, divisor)) => {
                    let value = raw as f64 / divisor as f64;
                    debug!(
                        dev_eui = %dev_eui,
                        "Decoded {} = {} {}",
                        name, value, unit
                    );
                    measurements.push(DecodedMeasurement::new(name, value, unit, timestamp));
                }
                None => {
                    warn!(
                        dev_eui = %dev_eui,
                        "Unknown sensor type 0x{:02X}, skipping record",
                        code
                    );
                }
            }
        }

        Ok(measurements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const DEV_EUI: &str = "0000000000000001";

    fn decode(payload: &[u8]) -> Vec<DecodedMeasurement> {
        MyIoTGridDecoder::new().decode(payload, DEV_EUI, 1).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_decode_temperature_positive() {
        // 0x07D0 = 2000 -> 20.00 °C
        let readings = decode(&hex!("0107D0"));
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].measurement_type, "temperature");
        assert_eq!(readings[0].unit, "°C");
        assert_close(readings[0].value, 20.0);
    }

    #[test]
    fn test_decode_temperature_sign_and_range() {
        assert_close(decode(&hex!("01F830"))[0].value, -20.0);
        assert_close(decode(&hex!("017FFF"))[0].value, 327.67);
        assert_close(decode(&hex!("018000"))[0].value, -327.68);
        assert_close(decode(&hex!("010000"))[0].value, 0.0);
    }

    #[test]
    fn test_decode_divisors() {
        // pressure 10130 / 10
        let pressure = decode(&hex!("032792"));
        assert_eq!(pressure[0].measurement_type, "pressure");
        assert_eq!(pressure[0].unit, "hPa");
        assert_close(pressure[0].value, 1013.0);

        // latitude 0x13D1 = 5073 / 10000
        let latitude = decode(&hex!("1013D1"));
        assert_close(latitude[0].value, 0.5073);

        // water flow 1500 / 1000
        let flow = decode(&hex!("6505DC"));
        assert_eq!(flow[0].unit, "m³/s");
        assert_close(flow[0].value, 1.5);

        // co2 is unscaled
        let co2 = decode(&hex!("2201A4"));
        assert_close(co2[0].value, 420.0);
    }

    #[test]
    fn test_decode_multi_sensor_payload_shares_timestamp() {
        // temperature 21.50, humidity 65.00, battery 87.00
        let readings = decode(&hex!("0108660219640521FC"));
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0].measurement_type, "temperature");
        assert_close(readings[0].value, 21.5);
        assert_eq!(readings[1].measurement_type, "humidity");
        assert_close(readings[1].value, 65.0);
        assert_eq!(readings[2].measurement_type, "battery");
        assert_close(readings[2].value, 87.0);
        assert!(readings.iter().all(|r| r.timestamp == readings[0].timestamp));
    }

    #[test]
    fn test_decode_skips_unknown_type() {
        let readings = decode(&hex!("7A00010107D0"));
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].measurement_type, "temperature");
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let decoder = MyIoTGridDecoder::new();
        assert!(matches!(
            decoder.decode(&hex!("0107"), DEV_EUI, 1),
            Err(DecodeError::InvalidLength { length: 2, .. })
        ));
        assert!(matches!(
            decoder.decode(&[], DEV_EUI, 1),
            Err(DecodeError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_can_decode() {
        let decoder = MyIoTGridDecoder::new();
        assert!(decoder.can_decode(&hex!("0107D0"), 1));
        assert!(decoder.can_decode(&hex!("0107D0"), 10));
        assert!(!decoder.can_decode(&hex!("0107D0"), 0));
        assert!(!decoder.can_decode(&hex!("0107D0"), 11));
        assert!(!decoder.can_decode(&hex!("0107"), 1));
        assert!(!decoder.can_decode(&[], 1));
    }

    #[test]
    fn test_encode() {
        assert_eq!(MyIoTGridDecoder::encode("temperature", 20.0).unwrap(), hex!("0107D0"));
        assert_eq!(MyIoTGridDecoder::encode("temperature", -20.0).unwrap(), hex!("01F830"));
        assert!(matches!(
            MyIoTGridDecoder::encode("radiation", 1.0),
            Err(DecodeError::UnknownSensorType(_))
        ));
    }

    #[test]
    fn test_encode_multiple_decodes_back() {
        let payload =
            MyIoTGridDecoder::encode_multiple(&[("water_level", 123.4), ("voltage", 3.7)]).unwrap();
        assert_eq!(payload.len(), 6);

        let readings = decode(&payload);
        assert_eq!(readings[0].measurement_type, "water_level");
        assert_close(readings[0].value, 123.4);
        assert_eq!(readings[1].measurement_type, "voltage");
        assert_close(readings[1].value, 3.7);
    }
}
