use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{error, info};

use crate::alerts::{HealthScorer, RuleBasedScorer, ScoringMode};
use crate::config::Config;
use crate::db::Db;
use crate::device::DeviceSource;
use crate::event::Event;
use crate::history::History;
use crate::hub::BroadcastHub;
use crate::pipeline::{ConnectionState, Pipeline};
use crate::scheduler::Scheduler;

/// Upper bound on reconnecting the device during a restart.
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<AppState>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Owns the running services. Built once in `main`, shared with the API.
pub struct AppState {
    pipeline: Pipeline,
    scheduler: Scheduler,
    scorer: Arc<dyn HealthScorer>,
    limits: ApiLimits,
    started_at: Instant,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Caps on caller-supplied query ranges.
#[derive(Debug, Clone, Copy)]
pub struct ApiLimits {
    pub max_history_hours: u32,
    pub max_forecast_hours: u32,
}

// ---------------------------------------------------------------------------
// JSON response (what /api/health returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub components: Components,
    pub subscribers: usize,
    pub uptime_secs: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Serialize)]
pub struct Components {
    pub device: &'static str,
    pub device_source: String,
    pub scheduler: &'static str,
    pub database: &'static str,
    pub scoring: ScoringMode,
    pub history_len: usize,
}

// ---------------------------------------------------------------------------
// Construction & lifecycle
// ---------------------------------------------------------------------------

impl AppState {
    /// Wire up the service graph from a validated config. Nothing runs until
    /// [`AppState::start`].
    pub fn build(config: &Config, source: DeviceSource, db: Option<Db>) -> Result<Self> {
        let hub = BroadcastHub::new();
        let history = History::new(config.history.capacity);
        let pipeline = Pipeline::new(source, history, hub, db, config.pipeline_settings());

        let scorer: Arc<dyn HealthScorer> = Arc::new(RuleBasedScorer);
        let scheduler = Scheduler::new(
            pipeline.clone(),
            Arc::clone(&scorer),
            config.scheduler_settings()?,
        );

        Ok(Self {
            pipeline,
            scheduler,
            scorer,
            limits: ApiLimits {
                max_history_hours: config.web.max_history_hours,
                max_forecast_hours: config.web.max_forecast_hours,
            },
            started_at: Instant::now(),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn start(&self) {
        let _guard = self.lifecycle.lock().await;
        self.pipeline.start().await;
        self.scheduler.start();
        info!(state = self.pipeline.state().as_str(), "services started");
    }

    /// Stop everything, bring it back up, and announce the outcome to
    /// subscribers.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        info!("restarting services");

        self.scheduler.shutdown();
        self.pipeline.stop();
        let reconnected = tokio::time::timeout(RESTART_TIMEOUT, self.pipeline.start()).await;
        self.scheduler.start();

        if reconnected.is_err() {
            self.pipeline.stop();
            let msg = format!(
                "device did not reconnect within {}s",
                RESTART_TIMEOUT.as_secs()
            );
            error!(error = %msg, "restart failed");
            self.hub().publish(&Event::SystemError {
                job: None,
                error: msg.clone(),
            });
            bail!(msg);
        }

        self.hub().publish(&Event::SystemRestarted {
            restarted_at: OffsetDateTime::now_utc(),
        });
        info!(state = self.pipeline.state().as_str(), "services restarted");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.pipeline.stop();
        info!("services stopped");
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn hub(&self) -> &BroadcastHub {
        self.pipeline.hub()
    }

    pub fn history(&self) -> &History {
        self.pipeline.history()
    }

    pub fn db(&self) -> Option<&Db> {
        self.pipeline.db()
    }

    pub fn scorer(&self) -> &dyn HealthScorer {
        self.scorer.as_ref()
    }

    pub fn limits(&self) -> ApiLimits {
        self.limits
    }

    /// Build the JSON-serialisable health snapshot.
    pub fn to_health(&self) -> HealthResponse {
        let device = self.pipeline.state();
        let scheduler_running = self.scheduler.is_running();
        let healthy = device == ConnectionState::Connected && scheduler_running;

        HealthResponse {
            status: if healthy { "healthy" } else { "degraded" },
            components: Components {
                device: device.as_str(),
                device_source: self.pipeline.device(),
                scheduler: if scheduler_running { "running" } else { "stopped" },
                database: if self.db().is_some() { "enabled" } else { "disabled" },
                scoring: self.scorer.mode(),
                history_len: self.history().len(),
            },
            subscribers: self.hub().count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
