//! Ingestion pipeline.
//!
//! Owns the device connection, turns inbound lines into readings, and pushes
//! each one through the history buffer, the broadcast hub, and (best effort)
//! the database, in that order. When no device is connected a ticker
//! synthesizes readings on the same cadence, so consumers never go dark.
//!
//! A lost device is not reconnected; the pipeline stays degraded until it is
//! restarted.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::device::{CommandSink, DeviceSource, LineStream};
use crate::event::Event;
use crate::history::History;
use crate::hub::BroadcastHub;
use crate::protocol::{parse_record, DeviceCommand};
use crate::reading::{Measurements, Reading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub read_interval: Duration,
    pub command_timeout: Duration,
    /// Fixed seed for the synthetic generator; random when unset.
    pub seed: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            read_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            seed: None,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    source: DeviceSource,
    history: History,
    hub: BroadcastHub,
    db: Option<Db>,
    settings: PipelineSettings,
    state: watch::Sender<ConnectionState>,
    commands: Mutex<Option<CommandSink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    rng: Mutex<fastrand::Rng>,
}

impl Pipeline {
    pub fn new(
        source: DeviceSource,
        history: History,
        hub: BroadcastHub,
        db: Option<Db>,
        settings: PipelineSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let rng = settings.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);
        Self {
            inner: Arc::new(Inner {
                source,
                history,
                hub,
                db,
                settings,
                state,
                commands: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                rng: Mutex::new(rng),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Connect to the device and start ingesting. A second call while
    /// running does nothing.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let source = self.inner.source.describe();
        info!(device = %source, "pipeline starting");

        let ticker = tokio::spawn(degraded_ticker(Arc::clone(&self.inner)));
        self.inner.tasks.lock().push(ticker);

        self.inner.set_state(ConnectionState::Connecting);
        match self.inner.source.connect().await {
            Ok(link) => {
                if !self.inner.running.load(Ordering::SeqCst) {
                    // stopped while connecting
                    return;
                }
                *self.inner.commands.lock() = Some(link.commands);
                self.inner.set_state(ConnectionState::Connected);
                info!(device = %source, "device connected");
                let reader = tokio::spawn(read_loop(Arc::clone(&self.inner), link.lines));
                self.inner.tasks.lock().push(reader);
            }
            Err(e) => {
                warn!(device = %source, error = %e, "device unavailable, using synthetic data");
                if self.inner.running.load(Ordering::SeqCst) {
                    self.inner.set_state(ConnectionState::Degraded);
                }
            }
        }
    }

    /// Stop all pipeline tasks and release the device. Safe to call at any
    /// time, any number of times.
    pub fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.commands.lock().take();
        self.inner.set_state(ConnectionState::Disconnected);
        if was_running {
            info!("pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ── Data path ───────────────────────────────────────────────────

    /// Push one reading through buffer, hub, and database.
    #[cfg(test)]
    pub async fn ingest(&self, reading: Reading) -> Arc<Reading> {
        self.inner.ingest(reading).await
    }

    /// Send a command to the device. Fails fast when not connected.
    pub async fn send_command(&self, cmd: &DeviceCommand) -> bool {
        if self.state() != ConnectionState::Connected {
            warn!(command = %cmd.kind, "cannot send command, device not connected");
            return false;
        }
        let Some(sink) = self.inner.commands.lock().clone() else {
            return false;
        };
        let line = match cmd.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(command = %cmd.kind, error = %e, "failed to encode command");
                return false;
            }
        };

        match tokio::time::timeout(self.inner.settings.command_timeout, sink.send(line)).await {
            Ok(Ok(())) => {
                info!(command = %cmd.kind, "command sent");
                true
            }
            Ok(Err(e)) => {
                error!(command = %cmd.kind, error = %e, "command write failed");
                self.inner.commands.lock().take();
                self.inner.set_state(ConnectionState::Disconnected);
                false
            }
            Err(_) => {
                error!(command = %cmd.kind, "command timed out");
                false
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn device(&self) -> String {
        self.inner.source.describe()
    }

    pub fn history(&self) -> &History {
        &self.inner.history
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    pub fn db(&self) -> Option<&Db> {
        self.inner.db.as_ref()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = prev.as_str(), to = next.as_str(), "connection state");
        }
    }

    async fn ingest(&self, reading: Reading) -> Arc<Reading> {
        let stored = self.history.append(reading);
        self.hub.publish(&Event::TelemetryUpdate(Reading::clone(&stored)));
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_reading(&stored).await {
                error!(error = %e, "failed to persist reading");
            }
        }
        stored
    }

    fn synthetic(&self) -> Option<Reading> {
        let values = synthetic_measurements(&mut self.rng.lock());
        match Reading::new(values) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "synthetic reading rejected");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn read_loop(inner: Arc<Inner>, mut lines: LineStream) {
    while let Some(item) = lines.next_line().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "device read failed");
                break;
            }
        };
        let Ok(text) = std::str::from_utf8(&bytes) else {
            warn!(len = bytes.len(), "discarding non-utf8 device record");
            continue;
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        match parse_record(text) {
            Ok(reading) => {
                inner.ingest(reading).await;
            }
            Err(e) => warn!(error = %e, record = %text, "discarding device record"),
        }
    }

    inner.commands.lock().take();
    inner.set_state(ConnectionState::Disconnected);
    warn!("device link closed, not reconnecting");
}

async fn degraded_ticker(inner: Arc<Inner>) {
    let period = inner.settings.read_interval;
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        let state = *inner.state.borrow();
        if matches!(state, ConnectionState::Connected | ConnectionState::Connecting) {
            continue;
        }
        if state != ConnectionState::Degraded {
            info!("no device connected, entering degraded mode");
            inner.set_state(ConnectionState::Degraded);
        }
        if let Some(reading) = inner.synthetic() {
            inner.ingest(reading).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Synthetic data
// ---------------------------------------------------------------------------

fn uniform(rng: &mut fastrand::Rng, center: f64, spread: f64) -> f64 {
    center + (rng.f64() * 2.0 - 1.0) * spread
}

fn round_to(v: f64, places: i32) -> f64 {
    let p = 10f64.powi(places);
    (v * p).round() / p
}

/// Plausible greenhouse values around a comfortable set point.
pub(crate) fn synthetic_measurements(rng: &mut fastrand::Rng) -> Measurements {
    Measurements {
        temperature: round_to(uniform(rng, 23.0, 3.0), 1),
        humidity: round_to(uniform(rng, 60.0, 15.0), 1).clamp(0.0, 100.0),
        soil_moisture: round_to(uniform(rng, 0.6, 0.2), 2).clamp(0.0, 1.0),
        co2_level: uniform(rng, 800.0, 200.0).round().clamp(300.0, 1500.0),
        light_level: Some(round_to(uniform(rng, 450.0, 100.0), 1).max(0.0)),
        ph_level: Some(round_to(uniform(rng, 6.5, 1.0), 1)),
        nutrient_level: Some(round_to(0.3 + rng.f64() * 0.6, 2)),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
