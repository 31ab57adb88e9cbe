use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use time::OffsetDateTime;

use crate::reading::{Measurements, Reading, ReadingError};

// ---------------------------------------------------------------------------
// Device line protocol
// ---------------------------------------------------------------------------

/// One inbound record as the device writes it, a single JSON object per line.
#[derive(Debug, Deserialize)]
pub(crate) struct DeviceRecord {
    pub(crate) temp: f64,
    pub(crate) humidity: f64,
    pub(crate) soil: f64,
    pub(crate) co2: f64,
    pub(crate) light: Option<f64>,
    pub(crate) ph: Option<f64>,
    pub(crate) nutrients: Option<f64>,
}

impl From<DeviceRecord> for Measurements {
    fn from(r: DeviceRecord) -> Self {
        Self {
            temperature: r.temp,
            humidity: r.humidity,
            soil_moisture: r.soil,
            co2_level: r.co2,
            light_level: r.light,
            ph_level: r.ph,
            nutrient_level: r.nutrients,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid reading: {0}")]
    Invalid(#[from] ReadingError),
}

/// Parse one trimmed line from the device into a validated reading.
pub(crate) fn parse_record(line: &str) -> Result<Reading, RecordError> {
    let record: DeviceRecord = serde_json::from_str(line.trim())?;
    Ok(Reading::new(record.into())?)
}

/// Outbound actuator command, serialized as one JSON line.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DeviceCommand {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) params: BTreeMap<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) timestamp: OffsetDateTime,
    pub(crate) source: String,
}

impl DeviceCommand {
    pub(crate) fn new(kind: impl Into<String>, params: BTreeMap<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            params,
            timestamp: OffsetDateTime::now_utc(),
            source: "greenhouse_hub".to_string(),
        }
    }

    /// Wire form including the trailing newline.
    pub(crate) fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_record --------------------------------------------------------

    #[test]
    fn parse_record_full() {
        let r = parse_record(
            r#"{"temp":22.5,"humidity":55,"soil":0.42,"co2":810,"light":430.5,"ph":6.4,"nutrients":0.7}"#,
        )
        .unwrap();
        assert_eq!(r.temperature(), 22.5);
        assert_eq!(r.soil_moisture(), 0.42);
        assert_eq!(r.co2_level(), 810.0);
        assert_eq!(r.ph_level(), Some(6.4));
    }

    #[test]
    fn parse_record_optional_fields_absent() {
        let r = parse_record(r#"{"temp":20,"humidity":50,"soil":0.5,"co2":600}"#).unwrap();
        assert_eq!(r.light_level(), None);
        assert_eq!(r.nutrient_level(), None);
    }

    #[test]
    fn parse_record_surrounding_whitespace() {
        assert!(parse_record("  {\"temp\":20,\"humidity\":50,\"soil\":0.5,\"co2\":600}\r\n").is_ok());
    }

    #[test]
    fn parse_record_extra_fields_ignored() {
        assert!(parse_record(r#"{"temp":20,"humidity":50,"soil":0.5,"co2":600,"fw":"1.2"}"#).is_ok());
    }

    #[test]
    fn parse_record_missing_core_field() {
        let err = parse_record(r#"{"temp":20,"humidity":50,"co2":600}"#).unwrap_err();
        assert!(matches!(err, RecordError::Malformed(_)));
    }

    #[test]
    fn parse_record_garbage() {
        assert!(matches!(
            parse_record("temp=20;hum=50"),
            Err(RecordError::Malformed(_))
        ));
    }

    #[test]
    fn parse_record_empty() {
        assert!(parse_record("").is_err());
    }

    #[test]
    fn parse_record_out_of_range() {
        let err = parse_record(r#"{"temp":20,"humidity":150,"soil":0.5,"co2":600}"#).unwrap_err();
        assert!(matches!(err, RecordError::Invalid(_)));
    }

    // -- DeviceCommand -------------------------------------------------------

    #[test]
    fn command_line_shape() {
        let mut params = BTreeMap::new();
        params.insert("duration".to_string(), Value::from(30));
        let line = DeviceCommand::new("water", params).to_line().unwrap();
        assert!(line.ends_with('\n'));

        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["type"], "water");
        assert_eq!(v["params"]["duration"], 30);
        assert_eq!(v["source"], "greenhouse_hub");
        assert!(v["timestamp"].is_string());
    }
}
