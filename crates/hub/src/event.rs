//! Outbound real-time events.
//!
//! Every event goes on the wire as `{ "type": ..., "data": {...}, "timestamp": ... }`.
//! The set of event types is closed; each variant owns a fixed `data` shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::alerts::{Alert, HealthReport};
use crate::forecast::Forecast;
use crate::reading::Reading;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Subscription topics. `System` events bypass subscriber filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Telemetry,
    Alerts,
    Analysis,
    System,
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telemetry" => Ok(Self::Telemetry),
            "alerts" => Ok(Self::Alerts),
            "analysis" => Ok(Self::Analysis),
            other => Err(format!("Unknown subscription: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Snapshot attached to `system_alert`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub connection_state: String,
    pub subscribers: usize,
    pub scheduler_running: bool,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub host_uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Connection {
        message: String,
    },
    Pong {},
    SubscriptionConfirmed {
        subscription: Topic,
    },
    Error {
        message: String,
    },
    TelemetryUpdate(Reading),
    HealthAnalysis(HealthReport),
    NewAlerts {
        alerts: Vec<Alert>,
        count: usize,
    },
    PredictionUpdate(Forecast),
    PredictiveAlert {
        risks: Vec<String>,
        recommendations: Vec<String>,
        forecast_hours: u32,
    },
    SystemAlert {
        issues: Vec<String>,
        status: SystemStatus,
    },
    EmergencyAlert {
        health_score: f64,
        actions: Vec<String>,
        recommendations: Vec<String>,
    },
    SystemError {
        #[serde(skip_serializing_if = "Option::is_none")]
        job: Option<String>,
        error: String,
    },
    SystemRestarted {
        #[serde(with = "time::serde::rfc3339")]
        restarted_at: OffsetDateTime,
    },
    ActuatorAction {
        action: String,
        parameters: BTreeMap<String, Value>,
        triggered_by: String,
        success: bool,
    },
}

impl Event {
    pub fn new_alerts(alerts: Vec<Alert>) -> Self {
        let count = alerts.len();
        Self::NewAlerts { alerts, count }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Pong {} => "pong",
            Self::SubscriptionConfirmed { .. } => "subscription_confirmed",
            Self::Error { .. } => "error",
            Self::TelemetryUpdate(_) => "telemetry_update",
            Self::HealthAnalysis(_) => "health_analysis",
            Self::NewAlerts { .. } => "new_alerts",
            Self::PredictionUpdate(_) => "prediction_update",
            Self::PredictiveAlert { .. } => "predictive_alert",
            Self::SystemAlert { .. } => "system_alert",
            Self::EmergencyAlert { .. } => "emergency_alert",
            Self::SystemError { .. } => "system_error",
            Self::SystemRestarted { .. } => "system_restarted",
            Self::ActuatorAction { .. } => "actuator_action",
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Self::TelemetryUpdate(_) => Topic::Telemetry,
            Self::NewAlerts { .. } | Self::PredictiveAlert { .. } | Self::EmergencyAlert { .. } => {
                Topic::Alerts
            }
            Self::HealthAnalysis(_) | Self::PredictionUpdate(_) => Topic::Analysis,
            _ => Topic::System,
        }
    }

    /// Serialize with the current time as the envelope timestamp.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        self.to_wire_at(OffsetDateTime::now_utc())
    }

    pub fn to_wire_at(&self, timestamp: OffsetDateTime) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            event: self,
            timestamp,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a Event,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

// ===========================================================================
// Tests
// ===========================================================================
