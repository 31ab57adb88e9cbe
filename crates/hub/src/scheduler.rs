//! Periodic analysis and maintenance jobs.
//!
//! Each enabled job runs on its own cadence in its own task. Every firing is
//! spawned separately and supervised: an `Err` or a panic is logged and
//! published as `system_error`, and the job keeps its schedule.
//!
//! ```text
//! health_analysis      latest reading ─▶ analyze ─▶ health_analysis (+ emergency_alert)
//! alert_check          latest reading + trend window ─▶ rules ─▶ new_alerts (one batch)
//! predictive_analysis  trailing window ─▶ forecast ─▶ prediction_update (+ predictive_alert)
//! system_health        connection state, subscribers, host ─▶ system_alert
//! data_retention       purge history + database older than the horizon
//! ```

use anyhow::Result;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use time::{OffsetDateTime, Time};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::{analyze, emergency_actions, evaluate, evaluate_trend, HealthScorer, Thresholds};
use crate::event::{Event, SystemStatus};
use crate::forecast::{forecast, ForecastHorizon};
use crate::hub::BroadcastHub;
use crate::pipeline::{ConnectionState, Pipeline};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Jobs and cadences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    HealthAnalysis,
    AlertCheck,
    PredictiveAnalysis,
    SystemHealth,
    DataRetention,
}

impl Job {
    #[cfg(test)]
    pub const ALL: [Job; 5] = [
        Job::HealthAnalysis,
        Job::AlertCheck,
        Job::PredictiveAnalysis,
        Job::SystemHealth,
        Job::DataRetention,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::HealthAnalysis => "health_analysis",
            Self::AlertCheck => "alert_check",
            Self::PredictiveAnalysis => "predictive_analysis",
            Self::SystemHealth => "system_health",
            Self::DataRetention => "data_retention",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed period; first firing one period after start.
    Every(Duration),
    /// Once a day at the given UTC wall-clock time.
    DailyAt { hour: u8, minute: u8 },
}

impl Cadence {
    /// Time until the next firing of a `DailyAt` cadence, or the period.
    pub fn next_delay(&self, now: OffsetDateTime) -> Duration {
        match *self {
            Cadence::Every(period) => period,
            Cadence::DailyAt { hour, minute } => {
                let at = Time::from_hms(hour, minute, 0).unwrap_or(Time::MIDNIGHT);
                let now = now.to_offset(time::UtcOffset::UTC);
                let mut next = now.replace_time(at);
                if next <= now {
                    next += time::Duration::DAY;
                }
                Duration::try_from(next - now).unwrap_or(ONE_DAY)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Enabled jobs and their cadences.
    pub jobs: Vec<(Job, Cadence)>,
    pub thresholds: Thresholds,
    /// Health score below which an emergency event is raised.
    pub emergency_threshold: f64,
    pub trend_window: Duration,
    pub predictive_window: Duration,
    pub predictive_horizon: ForecastHorizon,
    pub predictive_min_samples: usize,
    pub retention: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            jobs: vec![
                (Job::HealthAnalysis, Cadence::Every(Duration::from_secs(10 * 60))),
                (Job::AlertCheck, Cadence::Every(Duration::from_secs(5 * 60))),
                (Job::PredictiveAnalysis, Cadence::Every(Duration::from_secs(60 * 60))),
                (Job::SystemHealth, Cadence::Every(Duration::from_secs(30 * 60))),
                (Job::DataRetention, Cadence::DailyAt { hour: 2, minute: 0 }),
            ],
            thresholds: Thresholds::default(),
            emergency_threshold: 40.0,
            trend_window: Duration::from_secs(60 * 60),
            predictive_window: ONE_DAY,
            predictive_horizon: ForecastHorizon::new(12).unwrap_or(ForecastHorizon::MIN),
            predictive_min_samples: 10,
            retention: 30 * ONE_DAY,
        }
    }
}

// ---------------------------------------------------------------------------
// Job context
// ---------------------------------------------------------------------------

/// Everything a job needs, cloned into each firing.
#[derive(Clone)]
pub struct JobContext {
    pub pipeline: Pipeline,
    pub scorer: Arc<dyn HealthScorer>,
    pub settings: Arc<SchedulerSettings>,
    running: Arc<AtomicBool>,
}

impl JobContext {
    fn hub(&self) -> &BroadcastHub {
        self.pipeline.hub()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    ctx: JobContext,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        pipeline: Pipeline,
        scorer: Arc<dyn HealthScorer>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            ctx: JobContext {
                pipeline,
                scorer,
                settings: Arc::new(settings),
                running: Arc::new(AtomicBool::new(false)),
            },
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Arm every enabled job. No-op if already running.
    pub fn start(&self) {
        if self.ctx.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock();
        for &(job, cadence) in &self.ctx.settings.jobs {
            handles.push(tokio::spawn(job_loop(job, cadence, self.ctx.clone())));
        }
        info!(jobs = handles.len(), "scheduler started");
    }

    /// Disarm all jobs. Firings already in flight run to completion.
    pub fn shutdown(&self) {
        let was_running = self.ctx.running.swap(false, Ordering::SeqCst);
        for h in self.handles.lock().drain(..) {
            h.abort();
        }
        if was_running {
            info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ctx.running.load(Ordering::SeqCst)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn job_loop(job: Job, cadence: Cadence, ctx: JobContext) {
    match cadence {
        Cadence::Every(period) => {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                fire(job, ctx.clone());
            }
        }
        Cadence::DailyAt { .. } => loop {
            tokio::time::sleep(cadence.next_delay(OffsetDateTime::now_utc())).await;
            fire(job, ctx.clone());
        },
    }
}

fn fire(job: Job, ctx: JobContext) -> JoinHandle<()> {
    let hub = ctx.hub().clone();
    supervise(job, hub, async move { run_job(job, &ctx).await })
}

/// Run `work` in its own task and report any failure as `system_error`.
fn supervise<F>(job: Job, hub: BroadcastHub, work: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = match tokio::spawn(work).await {
            Ok(Ok(())) => {
                debug!(job = job.name(), "job finished");
                return;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(e) if e.is_panic() => panic_message(e.into_panic()),
            Err(_) => return, // cancelled
        };
        error!(job = job.name(), error = %outcome, "job failed");
        hub.publish(&Event::SystemError {
            job: Some(job.name().to_string()),
            error: outcome,
        });
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Job bodies
// ---------------------------------------------------------------------------

pub async fn run_job(job: Job, ctx: &JobContext) -> Result<()> {
    match job {
        Job::HealthAnalysis => health_analysis(ctx),
        Job::AlertCheck => alert_check(ctx).await,
        Job::PredictiveAnalysis => predictive_analysis(ctx),
        Job::SystemHealth => system_health(ctx),
        Job::DataRetention => data_retention(ctx).await,
    }
}

fn health_analysis(ctx: &JobContext) -> Result<()> {
    let Some(latest) = ctx.pipeline.history().latest() else {
        debug!("health analysis skipped, no data");
        return Ok(());
    };
    let report = analyze(&latest, ctx.scorer.as_ref());
    ctx.hub().publish(&Event::HealthAnalysis(report.clone()));

    if report.health_score < ctx.settings.emergency_threshold {
        let actions = emergency_actions(&report);
        warn!(
            health_score = report.health_score,
            actions = actions.len(),
            "plant health critical"
        );
        ctx.hub().publish(&Event::EmergencyAlert {
            health_score: report.health_score,
            actions,
            recommendations: report.recommendations,
        });
    }
    Ok(())
}

async fn alert_check(ctx: &JobContext) -> Result<()> {
    let history = ctx.pipeline.history();
    let Some(latest) = history.latest() else {
        return Ok(());
    };
    let th = &ctx.settings.thresholds;
    let mut alerts = evaluate(&latest, th);
    alerts.extend(evaluate_trend(&history.window(ctx.settings.trend_window), th));
    if alerts.is_empty() {
        return Ok(());
    }

    if let Some(db) = ctx.pipeline.db() {
        for a in &alerts {
            if let Err(e) = db.insert_alert(a).await {
                error!(title = %a.title, error = %e, "failed to persist alert");
            }
        }
    }
    info!(count = alerts.len(), "alerts raised");
    ctx.hub().publish(&Event::new_alerts(alerts));
    Ok(())
}

fn predictive_analysis(ctx: &JobContext) -> Result<()> {
    let s = &ctx.settings;
    let window = ctx.pipeline.history().window(s.predictive_window);
    if window.len() < s.predictive_min_samples {
        debug!(samples = window.len(), "predictive analysis skipped, not enough data");
        return Ok(());
    }

    let f = forecast(&window, s.predictive_horizon);
    ctx.hub().publish(&Event::PredictionUpdate(f.clone()));
    if f.has_risks() {
        ctx.hub().publish(&Event::PredictiveAlert {
            risks: f.risk_factors,
            recommendations: f.recommendations,
            forecast_hours: f.forecast_hours,
        });
    }
    Ok(())
}

fn system_health(ctx: &JobContext) -> Result<()> {
    let state = ctx.pipeline.state();
    let subscribers = ctx.hub().count();

    let mut sys = System::new();
    sys.refresh_memory();
    let status = SystemStatus {
        connection_state: state.as_str().to_string(),
        subscribers,
        scheduler_running: ctx.running.load(Ordering::SeqCst),
        memory_used_bytes: sys.used_memory(),
        memory_total_bytes: sys.total_memory(),
        host_uptime_secs: System::uptime(),
    };

    let mut issues = Vec::new();
    if state != ConnectionState::Connected {
        issues.push("Sensor connection lost".to_string());
    }
    if subscribers == 0 {
        issues.push("No active dashboard connections".to_string());
    }
    if issues.is_empty() {
        debug!(subscribers, "system healthy");
        return Ok(());
    }

    warn!(issues = ?issues, "system health issues");
    ctx.hub().publish(&Event::SystemAlert { issues, status });
    Ok(())
}

async fn data_retention(ctx: &JobContext) -> Result<()> {
    let horizon = time::Duration::try_from(ctx.settings.retention)?;
    let cutoff = OffsetDateTime::now_utc() - horizon;

    let buffered = ctx.pipeline.history().purge_before(cutoff);
    let stored = match ctx.pipeline.db() {
        Some(db) => db.purge_before(cutoff).await?,
        None => 0,
    };
    info!(buffered, stored, "retention purge complete");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RuleBasedScorer;
    use crate::db::Db;
    use crate::device::DeviceSource;
    use crate::history::History;
    use crate::hub::Subscription;
    use crate::pipeline::PipelineSettings;
    use crate::reading::{Measurements, Reading};
    use serde_json::Value;
    use time::macros::datetime;

    fn pipeline(db: Option<Db>) -> Pipeline {
        Pipeline::new(
            DeviceSource::Absent,
            History::new(500),
            BroadcastHub::new(),
            db,
            PipelineSettings::default(),
        )
    }

    fn scheduler_with(p: &Pipeline, settings: SchedulerSettings) -> Scheduler {
        Scheduler::new(p.clone(), Arc::new(RuleBasedScorer), settings)
    }

    fn reading(temperature: f64, humidity: f64, soil_moisture: f64, co2_level: f64) -> Reading {
        Reading::new(Measurements {
            temperature,
            humidity,
            soil_moisture,
            co2_level,
            ..Default::default()
        })
        .unwrap()
    }

    fn listen(p: &Pipeline) -> Subscription {
        let mut sub = p.hub().register();
        sub.outbox.try_recv().unwrap(); // handshake
        sub
    }

    fn drain(sub: &mut Subscription) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = sub.outbox.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    fn types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|v| v["type"].as_str().unwrap().to_string())
            .collect()
    }

    // -- Cadence -------------------------------------------------------------

    #[test]
    fn daily_cadence_later_today() {
        let c = Cadence::DailyAt { hour: 2, minute: 0 };
        let d = c.next_delay(datetime!(2026-03-01 01:30 UTC));
        assert_eq!(d, Duration::from_secs(30 * 60));
    }

    #[test]
    fn daily_cadence_rolls_to_tomorrow() {
        let c = Cadence::DailyAt { hour: 2, minute: 0 };
        let d = c.next_delay(datetime!(2026-03-01 02:00 UTC));
        assert_eq!(d, ONE_DAY);
        let d = c.next_delay(datetime!(2026-03-01 23:00 UTC));
        assert_eq!(d, Duration::from_secs(3 * 60 * 60));
    }

    #[test]
    fn job_names() {
        let names: Vec<&str> = Job::ALL.iter().map(Job::name).collect();
        assert_eq!(
            names,
            vec![
                "health_analysis",
                "alert_check",
                "predictive_analysis",
                "system_health",
                "data_retention"
            ]
        );
    }

    // -- Lifecycle -----------------------------------------------------------

    #[tokio::test]
    async fn shutdown_without_start_is_safe() {
        let p = pipeline(None);
        let s = scheduler_with(&p, SchedulerSettings::default());
        s.shutdown();
        assert!(!s.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let p = pipeline(None);
        let s = scheduler_with(&p, SchedulerSettings::default());
        s.start();
        s.start();
        assert_eq!(s.handles.lock().len(), Job::ALL.len());
        s.shutdown();
        assert!(s.handles.lock().is_empty());
        assert!(!s.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn alert_check_fires_on_cadence() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(
            &p,
            SchedulerSettings {
                jobs: vec![(Job::AlertCheck, Cadence::Every(Duration::from_secs(60)))],
                ..SchedulerSettings::default()
            },
        );
        p.history().append(reading(12.0, 60.0, 0.6, 800.0));
        s.start();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(drain(&mut sub).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(types(&drain(&mut sub)), vec!["new_alerts"]);

        s.shutdown();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(drain(&mut sub).is_empty());
    }

    // -- Isolation -----------------------------------------------------------

    #[tokio::test]
    async fn failing_job_reports_system_error() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register();
        sub.outbox.try_recv().unwrap();

        supervise(Job::DataRetention, hub.clone(), async {
            anyhow::bail!("disk on fire")
        })
        .await
        .unwrap();

        let v: Value = serde_json::from_str(&sub.outbox.try_recv().unwrap()).unwrap();
        assert_eq!(v["type"], "system_error");
        assert_eq!(v["data"]["job"], "data_retention");
        assert_eq!(v["data"]["error"], "disk on fire");
    }

    #[tokio::test]
    async fn panicking_job_reports_system_error() {
        let hub = BroadcastHub::new();
        let mut sub = hub.register();
        sub.outbox.try_recv().unwrap();

        supervise(Job::HealthAnalysis, hub.clone(), async {
            panic!("scorer exploded");
        })
        .await
        .unwrap();

        let v: Value = serde_json::from_str(&sub.outbox.try_recv().unwrap()).unwrap();
        assert_eq!(v["type"], "system_error");
        assert!(v["data"]["error"].as_str().unwrap().contains("scorer exploded"));
    }

    // -- Health analysis -----------------------------------------------------

    #[tokio::test]
    async fn health_analysis_without_data_is_quiet() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());
        run_job(Job::HealthAnalysis, &s.ctx).await.unwrap();
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn healthy_reading_publishes_analysis_only() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());
        p.history().append(reading(22.0, 55.0, 0.6, 800.0));

        run_job(Job::HealthAnalysis, &s.ctx).await.unwrap();
        let events = drain(&mut sub);
        assert_eq!(types(&events), vec!["health_analysis"]);
        assert_eq!(events[0]["data"]["scoring"], "rule_based_only");
    }

    #[tokio::test]
    async fn poor_health_raises_emergency() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());
        p.history().append(reading(45.0, 5.0, 0.02, 4000.0));

        run_job(Job::HealthAnalysis, &s.ctx).await.unwrap();
        let events = drain(&mut sub);
        assert_eq!(types(&events), vec!["health_analysis", "emergency_alert"]);
        let actions = events[1]["data"]["actions"].as_array().unwrap();
        assert!(actions
            .iter()
            .any(|a| a == "Emergency watering protocol activated"));
    }

    // -- Alert check ---------------------------------------------------------

    #[tokio::test]
    async fn alert_check_batches_and_persists() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let p = pipeline(Some(db.clone()));
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());
        p.history().append(reading(40.0, 90.0, 0.1, 800.0));

        run_job(Job::AlertCheck, &s.ctx).await.unwrap();
        let events = drain(&mut sub);
        assert_eq!(types(&events), vec!["new_alerts"]);
        assert_eq!(events[0]["data"]["count"], 3);
        assert_eq!(db.active_alerts(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn alert_check_nominal_is_quiet() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());
        p.history().append(reading(22.0, 55.0, 0.6, 800.0));
        run_job(Job::AlertCheck, &s.ctx).await.unwrap();
        assert!(drain(&mut sub).is_empty());
    }

    // -- Predictive analysis -------------------------------------------------

    #[tokio::test]
    async fn predictive_skips_below_min_samples() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());
        for _ in 0..9 {
            p.history().append(reading(22.0, 55.0, 0.6, 800.0));
        }
        run_job(Job::PredictiveAnalysis, &s.ctx).await.unwrap();
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn predictive_publishes_forecast_and_risks() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());
        for i in 0..10 {
            let soil = 0.6 - 0.3 * f64::from(i) / 9.0;
            p.history().append(reading(22.0, 55.0, soil, 800.0));
        }

        run_job(Job::PredictiveAnalysis, &s.ctx).await.unwrap();
        let events = drain(&mut sub);
        assert_eq!(types(&events), vec!["prediction_update", "predictive_alert"]);
        assert_eq!(events[1]["data"]["forecast_hours"], 12);
        assert!(events[1]["data"]["risks"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r == "Soil moisture decreasing rapidly"));
    }

    // -- System health -------------------------------------------------------

    #[tokio::test]
    async fn system_health_reports_lost_device() {
        let p = pipeline(None);
        let mut sub = listen(&p);
        let s = scheduler_with(&p, SchedulerSettings::default());

        run_job(Job::SystemHealth, &s.ctx).await.unwrap();
        let events = drain(&mut sub);
        assert_eq!(types(&events), vec!["system_alert"]);
        assert_eq!(events[0]["data"]["issues"][0], "Sensor connection lost");
        assert_eq!(events[0]["data"]["status"]["subscribers"], 1);
        assert!(events[0]["data"]["status"]["memory_total_bytes"].is_u64());
    }

    // -- Retention -----------------------------------------------------------

    #[tokio::test]
    async fn retention_purges_history_and_db() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let p = pipeline(Some(db.clone()));
        let s = scheduler_with(&p, SchedulerSettings::default());

        let old = Reading::captured_at(
            *reading(22.0, 55.0, 0.6, 800.0).measurements(),
            Instant::now(),
            OffsetDateTime::now_utc() - time::Duration::days(40),
        )
        .unwrap();
        p.ingest(old).await;
        p.ingest(reading(22.0, 55.0, 0.6, 800.0)).await;

        run_job(Job::DataRetention, &s.ctx).await.unwrap();
        assert_eq!(p.history().len(), 1);
        assert_eq!(db.count_readings().await.unwrap(), 1);
    }
}
