//! Trend extrapolation over a window of readings.
//!
//! Each metric gets an ordinary least-squares line against sample index; the
//! point forecast is `last + slope * hours`. Too little data is not an error:
//! it yields an `insufficient_data` forecast with zero confidence.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::history::Window;
use crate::reading::Reading;

/// Fewer samples than this produce an insufficient-data forecast.
pub const MIN_SAMPLES: usize = 5;

/// Largest horizon accepted at the API boundary.
pub const MAX_HORIZON_HOURS: i64 = 72;

const BASE_CONFIDENCE: f64 = 0.7;
const STABLE_BONUS: f64 = 0.2;
const STABLE_SLOPE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForecastError {
    #[error("forecast horizon must be between 1 and {max} hours, got {got}")]
    HorizonOutOfRange { got: i64, max: i64 },
}

/// A validated, positive forecast horizon in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForecastHorizon(u32);

impl ForecastHorizon {
    pub const MIN: Self = Self(1);

    pub fn new(hours: i64) -> Result<Self, ForecastError> {
        if hours <= 0 || hours > MAX_HORIZON_HOURS {
            return Err(ForecastError::HorizonOutOfRange {
                got: hours,
                max: MAX_HORIZON_HOURS,
            });
        }
        Ok(Self(hours as u32))
    }

    pub fn hours(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    InsufficientData,
    TrendAnalysis,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub prediction_type: PredictionType,
    pub forecast_hours: u32,
    pub predicted_values: BTreeMap<&'static str, f64>,
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub risk_factors: Vec<String>,
}

impl Forecast {
    pub fn has_risks(&self) -> bool {
        self.prediction_type == PredictionType::TrendAnalysis && !self.risk_factors.is_empty()
    }
}

type Extractor = fn(&Reading) -> f64;

const METRICS: [(&str, Extractor); 5] = [
    ("temperature", Reading::temperature),
    ("humidity", Reading::humidity),
    ("soil_moisture", Reading::soil_moisture),
    ("co2_level", Reading::co2_level),
    ("light_level", light_or_default),
];

fn light_or_default(r: &Reading) -> f64 {
    r.light_level().unwrap_or(500.0)
}

pub fn forecast(window: &Window, horizon: ForecastHorizon) -> Forecast {
    let hours = horizon.hours();
    if window.len() < MIN_SAMPLES {
        return Forecast {
            prediction_type: PredictionType::InsufficientData,
            forecast_hours: hours,
            predicted_values: BTreeMap::new(),
            confidence: 0.0,
            recommendations: vec!["Collect more sensor data for accurate predictions".into()],
            risk_factors: vec!["Insufficient historical data".into()],
        };
    }

    let mut predicted = BTreeMap::new();
    let mut stable = true;
    for (name, extract) in METRICS {
        let values: Vec<f64> = window.iter().map(extract).collect();
        let slope = ols_slope(&values);
        let last = values.last().copied().unwrap_or_default();
        predicted.insert(name, round2(last + slope * f64::from(hours)));
        stable &= slope.abs() < STABLE_SLOPE;
    }

    let mut risk_factors = Vec::new();
    let mut recommendations = Vec::new();

    let temp = predicted.get("temperature").copied().unwrap_or(20.0);
    if temp > 30.0 {
        risk_factors.push("Temperature trending too high".to_string());
        recommendations.push("Prepare cooling measures".to_string());
    } else if temp < 15.0 {
        risk_factors.push("Temperature trending too low".to_string());
        recommendations.push("Prepare heating".to_string());
    }

    if predicted.get("soil_moisture").copied().unwrap_or(0.5) < 0.2 {
        risk_factors.push("Soil moisture decreasing rapidly".to_string());
        recommendations.push("Schedule watering".to_string());
    }

    let confidence = if stable {
        BASE_CONFIDENCE + STABLE_BONUS
    } else {
        BASE_CONFIDENCE
    };

    Forecast {
        prediction_type: PredictionType::TrendAnalysis,
        forecast_hours: hours,
        predicted_values: predicted,
        confidence,
        recommendations,
        risk_factors,
    }
}

/// Least-squares slope of `ys` against 0..n.
fn ols_slope(ys: &[f64]) -> f64 {
    let n = ys.len() as f64;
    if ys.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::reading::Measurements;
    use std::time::Duration;

    fn history_of(points: &[(f64, f64)]) -> Window {
        let h = History::new(100);
        for &(temperature, soil_moisture) in points {
            h.append(
                Reading::new(Measurements {
                    temperature,
                    humidity: 55.0,
                    soil_moisture,
                    co2_level: 800.0,
                    light_level: Some(500.0),
                    ..Default::default()
                })
                .unwrap(),
            );
        }
        h.window(Duration::from_secs(3600))
    }

    fn horizon(h: i64) -> ForecastHorizon {
        ForecastHorizon::new(h).unwrap()
    }

    // -- Horizon -------------------------------------------------------------

    #[test]
    fn horizon_bounds() {
        assert!(ForecastHorizon::new(0).is_err());
        assert!(ForecastHorizon::new(-3).is_err());
        assert!(ForecastHorizon::new(73).is_err());
        assert_eq!(horizon(72).hours(), 72);
        assert_eq!(horizon(1).hours(), 1);
    }

    // -- Insufficient data ---------------------------------------------------

    #[test]
    fn fewer_than_five_samples_is_insufficient() {
        for n in 0..MIN_SAMPLES {
            let points: Vec<(f64, f64)> = (0..n).map(|_| (22.0, 0.5)).collect();
            let f = forecast(&history_of(&points), horizon(24));
            assert_eq!(f.prediction_type, PredictionType::InsufficientData);
            assert_eq!(f.confidence, 0.0);
            assert!(f.predicted_values.is_empty());
            assert_eq!(f.forecast_hours, 24);
            assert!(!f.has_risks());
        }
    }

    // -- Trend analysis ------------------------------------------------------

    #[test]
    fn drying_soil_flags_watering_risk() {
        let points: Vec<(f64, f64)> = (0..10)
            .map(|i| (22.0, 0.6 - 0.3 * i as f64 / 9.0))
            .collect();
        let f = forecast(&history_of(&points), horizon(24));

        assert_eq!(f.prediction_type, PredictionType::TrendAnalysis);
        assert!(f.predicted_values["soil_moisture"] < 0.2);
        assert!(f
            .risk_factors
            .contains(&"Soil moisture decreasing rapidly".to_string()));
        assert!(f.recommendations.contains(&"Schedule watering".to_string()));
        assert!(f.has_risks());
    }

    #[test]
    fn flat_series_gets_stability_bonus() {
        let points = vec![(22.0, 0.5); 8];
        let f = forecast(&history_of(&points), horizon(12));
        assert!((f.confidence - 0.9).abs() < 1e-9);
        assert_eq!(f.predicted_values["temperature"], 22.0);
        assert!(f.risk_factors.is_empty());
    }

    #[test]
    fn rising_temperature_flags_heat() {
        let points: Vec<(f64, f64)> = (0..6).map(|i| (24.0 + i as f64, 0.5)).collect();
        let f = forecast(&history_of(&points), horizon(6));
        // last 29 + 1/sample * 6
        assert_eq!(f.predicted_values["temperature"], 35.0);
        assert_eq!(f.risk_factors, vec!["Temperature trending too high"]);
        assert!((f.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn predicted_values_cover_all_metrics() {
        let f = forecast(&history_of(&[(22.0, 0.5); 5]), horizon(1));
        let keys: Vec<&str> = f.predicted_values.keys().copied().collect();
        assert_eq!(
            keys,
            vec!["co2_level", "humidity", "light_level", "soil_moisture", "temperature"]
        );
    }

    #[test]
    fn slope_of_line() {
        assert!((ols_slope(&[1.0, 3.0, 5.0, 7.0]) - 2.0).abs() < 1e-12);
        assert_eq!(ols_slope(&[4.0]), 0.0);
    }
}
