//! The canonical telemetry sample.
//!
//! A [`Reading`] is validated once, at construction, and never changes
//! afterwards. Out-of-range values are rejected rather than clamped.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Declared ranges
// ---------------------------------------------------------------------------

const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 100.0);
const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);
const SOIL_MOISTURE_RANGE: (f64, f64) = (0.0, 1.0);
const CO2_RANGE: (f64, f64) = (0.0, 5000.0);
const LIGHT_RANGE: (f64, f64) = (0.0, f64::INFINITY);
const PH_RANGE: (f64, f64) = (0.0, 14.0);
const NUTRIENT_RANGE: (f64, f64) = (0.0, f64::INFINITY);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadingError {
    #[error("{field} {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field} is not a finite number")]
    NotFinite { field: &'static str },
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Raw measured values, before validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
    /// Unitless fraction, 0 = bone dry, 1 = saturated.
    pub soil_moisture: f64,
    /// Parts per million.
    pub co2_level: f64,
    pub light_level: Option<f64>,
    pub ph_level: Option<f64>,
    pub nutrient_level: Option<f64>,
}

/// One immutable, timestamped telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(flatten)]
    values: Measurements,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    #[serde(skip)]
    captured: Instant,
}

impl Reading {
    /// Validate `values` and stamp them with the current monotonic and
    /// wall-clock time.
    pub fn new(values: Measurements) -> Result<Self, ReadingError> {
        Self::captured_at(values, Instant::now(), OffsetDateTime::now_utc())
    }

    /// Validate `values` with explicit capture stamps.
    pub fn captured_at(
        values: Measurements,
        captured: Instant,
        timestamp: OffsetDateTime,
    ) -> Result<Self, ReadingError> {
        check("temperature", values.temperature, TEMPERATURE_RANGE)?;
        check("humidity", values.humidity, HUMIDITY_RANGE)?;
        check("soil_moisture", values.soil_moisture, SOIL_MOISTURE_RANGE)?;
        check("co2_level", values.co2_level, CO2_RANGE)?;
        check_opt("light_level", values.light_level, LIGHT_RANGE)?;
        check_opt("ph_level", values.ph_level, PH_RANGE)?;
        check_opt("nutrient_level", values.nutrient_level, NUTRIENT_RANGE)?;

        Ok(Self {
            values,
            timestamp,
            captured,
        })
    }

    pub fn measurements(&self) -> &Measurements {
        &self.values
    }

    pub fn temperature(&self) -> f64 {
        self.values.temperature
    }

    pub fn humidity(&self) -> f64 {
        self.values.humidity
    }

    pub fn soil_moisture(&self) -> f64 {
        self.values.soil_moisture
    }

    pub fn co2_level(&self) -> f64 {
        self.values.co2_level
    }

    pub fn light_level(&self) -> Option<f64> {
        self.values.light_level
    }

    pub fn ph_level(&self) -> Option<f64> {
        self.values.ph_level
    }

    pub fn nutrient_level(&self) -> Option<f64> {
        self.values.nutrient_level
    }

    /// Wall-clock capture time (UTC).
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// Monotonic capture time, used for window queries.
    pub fn captured(&self) -> Instant {
        self.captured
    }
}

fn check(field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), ReadingError> {
    if !value.is_finite() {
        return Err(ReadingError::NotFinite { field });
    }
    if value < min || value > max {
        return Err(ReadingError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_opt(
    field: &'static str,
    value: Option<f64>,
    range: (f64, f64),
) -> Result<(), ReadingError> {
    match value {
        Some(v) => check(field, v, range),
        None => Ok(()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
