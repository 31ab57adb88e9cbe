//! Rule evaluation over readings: threshold alerts, rate-of-change alerts,
//! and the health analysis used by the scheduler.
//!
//! Everything here is a pure function of its inputs. Alert timestamps come
//! from the reading that triggered them, so evaluating the same reading twice
//! yields the same alerts.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::history::Window;
use crate::reading::{Measurements, Reading};

/// Maximum number of recommendations attached to a health report.
const MAX_RECOMMENDATIONS: usize = 5;

/// Light level assumed when the device does not report one.
const DEFAULT_LIGHT_LEVEL: f64 = 500.0;

// ---------------------------------------------------------------------------
// Alert model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Temperature,
    Humidity,
    Watering,
    AirQuality,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Watering => "watering",
            Self::AirQuality => "air_quality",
        }
    }
}

/// A rejected acknowledge/resolve. Each flag is set at most once, by the
/// persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AlertError {
    #[error("alert {0} already acknowledged")]
    AlreadyAcknowledged(i64),
    #[error("alert {0} already resolved")]
    AlreadyResolved(i64),
}

/// A rule-triggered notification. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub severity: Severity,
    pub category: Category,
    pub title: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Alert {
    pub fn new(
        severity: Severity,
        category: Category,
        title: impl Into<String>,
        message: impl Into<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            severity,
            category,
            title: title.into(),
            message: message.into(),
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Tunable alert limits. Defaults match the greenhouse profile the system
/// ships with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub temperature_critical_low: f64,
    pub temperature_critical_high: f64,
    pub humidity_warning_low: f64,
    pub humidity_warning_high: f64,
    pub soil_critical_low: f64,
    pub soil_warning_high: f64,
    pub co2_info_low: f64,
    /// Absolute temperature change per hour that raises a trend alert.
    pub temperature_rate_per_hour: f64,
    /// Soil moisture loss per hour that raises a trend alert.
    pub soil_drop_per_hour: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature_critical_low: 15.0,
            temperature_critical_high: 35.0,
            humidity_warning_low: 25.0,
            humidity_warning_high: 85.0,
            soil_critical_low: 0.2,
            soil_warning_high: 0.9,
            co2_info_low: 300.0,
            temperature_rate_per_hour: 5.0,
            soil_drop_per_hour: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// Threshold rules
// ---------------------------------------------------------------------------

/// Evaluate the threshold table against one reading. Every rule that fires
/// contributes exactly one alert.
pub fn evaluate(reading: &Reading, th: &Thresholds) -> Vec<Alert> {
    let at = reading.timestamp();
    let t = reading.temperature();
    let h = reading.humidity();
    let s = reading.soil_moisture();
    let co2 = reading.co2_level();
    let mut alerts = Vec::new();

    if t < th.temperature_critical_low {
        alerts.push(Alert::new(
            Severity::Critical,
            Category::Temperature,
            "Critical Low Temperature",
            format!("Temperature is {t}°C - Risk of plant damage"),
            at,
        ));
    } else if t > th.temperature_critical_high {
        alerts.push(Alert::new(
            Severity::Critical,
            Category::Temperature,
            "Critical High Temperature",
            format!("Temperature is {t}°C - Risk of heat stress"),
            at,
        ));
    }

    if h < th.humidity_warning_low {
        alerts.push(Alert::new(
            Severity::Warning,
            Category::Humidity,
            "Low Humidity Alert",
            format!("Humidity is {h}% - Consider humidification"),
            at,
        ));
    } else if h > th.humidity_warning_high {
        alerts.push(Alert::new(
            Severity::Warning,
            Category::Humidity,
            "High Humidity Alert",
            format!("Humidity is {h}% - Risk of fungal issues"),
            at,
        ));
    }

    if s < th.soil_critical_low {
        alerts.push(Alert::new(
            Severity::Critical,
            Category::Watering,
            "Low Soil Moisture",
            format!("Soil moisture is {s:.2} - Plant needs watering"),
            at,
        ));
    } else if s > th.soil_warning_high {
        alerts.push(Alert::new(
            Severity::Warning,
            Category::Watering,
            "Overwatering Risk",
            format!("Soil moisture is {s:.2} - Risk of root rot"),
            at,
        ));
    }

    if co2 < th.co2_info_low {
        alerts.push(Alert::new(
            Severity::Info,
            Category::AirQuality,
            "Low CO2 Levels",
            format!("CO2 is {co2}ppm - Consider ventilation adjustment"),
            at,
        ));
    }

    alerts
}

/// Rate-of-change rules over a trailing window, comparing its first and last
/// samples. Needs two samples spread over a non-zero interval.
pub fn evaluate_trend(window: &Window, th: &Thresholds) -> Vec<Alert> {
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return Vec::new();
    };
    let elapsed = last.captured().saturating_duration_since(first.captured());
    if window.len() < 2 || elapsed.is_zero() {
        return Vec::new();
    }
    let hours = elapsed.as_secs_f64() / 3600.0;
    let at = last.timestamp();
    let mut alerts = Vec::new();

    let temp_rate = (last.temperature() - first.temperature()) / hours;
    if temp_rate.abs() > th.temperature_rate_per_hour {
        alerts.push(Alert::new(
            Severity::Warning,
            Category::Temperature,
            "Rapid Temperature Change",
            format!("Temperature changing at {temp_rate:+.1}°C/h - Check climate control"),
            at,
        ));
    }

    let soil_drop = (first.soil_moisture() - last.soil_moisture()) / hours;
    if soil_drop > th.soil_drop_per_hour {
        alerts.push(Alert::new(
            Severity::Warning,
            Category::Watering,
            "Soil Drying Rapidly",
            format!("Soil moisture falling at {soil_drop:.2}/h - Check watering"),
            at,
        ));
    }

    alerts
}

// ---------------------------------------------------------------------------
// Health scoring
// ---------------------------------------------------------------------------

/// Whether health scores come from a trained model or the transparent
/// rule-based fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    // reported by model-backed scorers; only the rule-based one ships
    #[allow(dead_code)]
    Model,
    RuleBasedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub health: f64,
    pub growth: f64,
}

/// Replaceable health scoring function.
pub trait HealthScorer: Send + Sync {
    fn mode(&self) -> ScoringMode;
    fn score(&self, m: &Measurements) -> Scores;
}

/// Mean of per-metric distance-from-optimum scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedScorer;

impl HealthScorer for RuleBasedScorer {
    fn mode(&self) -> ScoringMode {
        ScoringMode::RuleBasedOnly
    }

    fn score(&self, m: &Measurements) -> Scores {
        let light = m.light_level.unwrap_or(DEFAULT_LIGHT_LEVEL);
        let parts = [
            100.0 - (m.temperature - 22.0).abs() * 5.0,
            100.0 - (m.humidity - 55.0).abs() * 2.0,
            100.0 - (m.soil_moisture - 0.6).abs() * 100.0,
            100.0 - (m.co2_level - 800.0).abs() * 0.1,
            (light * 0.1).min(100.0),
        ];
        let health = (parts.iter().sum::<f64>() / parts.len() as f64).clamp(0.0, 100.0);
        Scores {
            health,
            growth: (health * 0.8).clamp(0.0, 100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub health_score: f64,
    pub growth_rate_score: f64,
    pub disease_probability: f64,
    pub stress_indicators: Vec<String>,
    pub recommendations: Vec<String>,
    pub confidence_level: f64,
    pub scoring: ScoringMode,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Full health analysis of one reading.
pub fn analyze(reading: &Reading, scorer: &dyn HealthScorer) -> HealthReport {
    let m = reading.measurements();
    let scores = scorer.score(m);
    let stress = stress_indicators(m);
    let disease = disease_probability(m, stress.len());
    let recommendations = recommendations(m, scores.health);

    HealthReport {
        health_score: scores.health.clamp(0.0, 100.0),
        growth_rate_score: scores.growth.clamp(0.0, 100.0),
        disease_probability: disease,
        confidence_level: confidence(m, scores.health),
        stress_indicators: stress,
        recommendations,
        scoring: scorer.mode(),
        timestamp: reading.timestamp(),
    }
}

pub fn stress_indicators(m: &Measurements) -> Vec<String> {
    let mut out = Vec::new();

    if m.temperature < 15.0 {
        out.push("Cold stress - temperature too low");
    } else if m.temperature > 30.0 {
        out.push("Heat stress - temperature too high");
    }

    if m.humidity < 30.0 {
        out.push("Low humidity stress");
    } else if m.humidity > 80.0 {
        out.push("High humidity - risk of fungal issues");
    }

    if m.soil_moisture < 0.2 {
        out.push("Drought stress - soil too dry");
    } else if m.soil_moisture > 0.9 {
        out.push("Waterlogged soil - risk of root rot");
    }

    if m.co2_level < 400.0 {
        out.push("Low CO2 - limited photosynthesis");
    } else if m.co2_level > 1500.0 {
        out.push("Excessive CO2 levels");
    }

    if m.light_level.is_some_and(|l| l < 200.0) {
        out.push("Insufficient light for photosynthesis");
    }

    out.into_iter().map(String::from).collect()
}

/// Weighted disease-risk heuristic, clipped to [0, 1].
pub fn disease_probability(m: &Measurements, stress_count: usize) -> f64 {
    let mut risk = 0.0;

    // warm and humid: fungal risk
    if m.humidity > 70.0 && m.temperature > 25.0 {
        risk += 0.3;
    }
    // poor air circulation
    if m.humidity > 75.0 && m.co2_level > 1200.0 {
        risk += 0.2;
    }
    risk += stress_count as f64 * 0.1;
    // saturated soil
    if m.soil_moisture > 0.8 {
        risk += 0.2;
    }

    risk.clamp(0.0, 1.0)
}

pub fn recommendations(m: &Measurements, health_score: f64) -> Vec<String> {
    let mut out: Vec<&str> = Vec::new();

    if m.temperature < 18.0 {
        out.push("Increase temperature - consider heating");
    } else if m.temperature > 28.0 {
        out.push("Reduce temperature - improve ventilation");
    }

    if m.humidity < 40.0 {
        out.push("Increase humidity - use humidifier");
    } else if m.humidity > 75.0 {
        out.push("Reduce humidity - improve air circulation");
    }

    if m.soil_moisture < 0.3 {
        out.push("Water the plant - soil is too dry");
    } else if m.soil_moisture > 0.8 {
        out.push("Reduce watering - risk of overwatering");
    }

    if m.light_level.is_some_and(|l| l < 300.0) {
        out.push("Increase light exposure - add grow lights");
    }

    if health_score < 50.0 {
        out.push("Plant health is poor - review all environmental conditions");
    } else if health_score < 70.0 {
        out.push("Monitor plant closely - some improvements needed");
    }

    let mut unique: Vec<String> = Vec::new();
    for r in out {
        if !unique.iter().any(|u| u == r) {
            unique.push(r.to_string());
        }
    }
    unique.truncate(MAX_RECOMMENDATIONS);
    unique
}

pub fn confidence(m: &Measurements, health_score: f64) -> f64 {
    let mut c: f64 = 0.8;

    if m.temperature < 10.0 || m.temperature > 35.0 {
        c -= 0.1;
    }
    if m.humidity < 20.0 || m.humidity > 90.0 {
        c -= 0.1;
    }
    if m.soil_moisture < 0.1 || m.soil_moisture > 0.95 {
        c -= 0.1;
    }
    if (30.0..=90.0).contains(&health_score) {
        c += 0.1;
    }

    c.clamp(0.3, 1.0)
}

/// Actions attached to an emergency event for a critically low health score.
pub fn emergency_actions(report: &HealthReport) -> Vec<String> {
    let mut actions = Vec::new();
    if report.health_score < 20.0 {
        actions.push("Critical plant health - immediate intervention required".to_string());
    }
    if report
        .stress_indicators
        .iter()
        .any(|s| s.to_lowercase().contains("drought stress"))
    {
        actions.push("Emergency watering protocol activated".to_string());
    }
    actions
}

// ===========================================================================
// Tests
// ===========================================================================
