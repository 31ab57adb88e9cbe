//! TOML config file loading, environment overrides, and validation.
//!
//! Every section is optional. A missing file yields the defaults, which
//! describe a single greenhouse on a serial-less host (synthetic data).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::alerts::Thresholds;
use crate::device::DeviceSource;
use crate::forecast::{ForecastHorizon, MAX_HORIZON_HOURS, MIN_SAMPLES};
use crate::history::DEFAULT_CAPACITY;
use crate::pipeline::PipelineSettings;
use crate::scheduler::{Cadence, Job, SchedulerSettings};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceSection,
    pub history: HistorySection,
    pub thresholds: Thresholds,
    pub scheduler: SchedulerSection,
    pub retention: RetentionSection,
    pub web: WebSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Serial device path.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Program to spawn instead of opening a port, e.g. the board emulator.
    /// With neither `port` nor `command` the hub runs on synthetic data.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub read_interval_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            command: None,
            args: Vec::new(),
            read_interval_secs: 5,
            command_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub capacity: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobEntry {
    pub enabled: bool,
    /// Period in minutes; the job's built-in default when unset.
    pub every_mins: Option<u64>,
}

impl Default for JobEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            every_mins: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DailyEntry {
    pub enabled: bool,
    /// UTC hour of day.
    pub hour: u8,
    pub minute: u8,
}

impl Default for DailyEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: 2,
            minute: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub health_analysis: JobEntry,
    pub alert_check: JobEntry,
    pub predictive_analysis: JobEntry,
    pub system_health: JobEntry,
    pub data_retention: DailyEntry,
    pub emergency_threshold: f64,
    pub trend_window_mins: u64,
    pub predictive_window_hours: u64,
    pub predictive_horizon_hours: i64,
    pub predictive_min_samples: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            health_analysis: JobEntry::default(),
            alert_check: JobEntry::default(),
            predictive_analysis: JobEntry::default(),
            system_health: JobEntry::default(),
            data_retention: DailyEntry::default(),
            emergency_threshold: 40.0,
            trend_window_mins: 60,
            predictive_window_hours: 24,
            predictive_horizon_hours: 12,
            predictive_min_samples: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub days: u32,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self { days: 30 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
    pub max_history_hours: u32,
    pub max_forecast_hours: u32,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: 8080,
            max_history_hours: 168,
            max_forecast_hours: MAX_HORIZON_HOURS as u32,
        }
    }
}

/// Default period in minutes for each periodic job.
fn default_every_mins(job: Job) -> u64 {
    match job {
        Job::HealthAnalysis => 10,
        Job::AlertCheck => 5,
        Job::PredictiveAnalysis => 60,
        Job::SystemHealth => 30,
        Job::DataRetention => 24 * 60,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_scheduler(&mut errors);
        self.validate_web(&mut errors);

        if self.history.capacity == 0 {
            errors.push("history: capacity must be positive".to_string());
        }
        if self.retention.days == 0 {
            errors.push("retention: days must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if let Some(port) = &d.port {
            if port.trim().is_empty() {
                errors.push("device: port is empty (omit it to run without a device)".into());
            }
        }
        if let Some(command) = &d.command {
            if command.trim().is_empty() {
                errors.push("device: command is empty".into());
            }
            if d.port.is_some() {
                errors.push("device: set either port or command, not both".into());
            }
        } else if !d.args.is_empty() {
            errors.push("device: args given without a command".into());
        }
        if d.baud_rate == 0 {
            errors.push("device: baud_rate must be positive".into());
        }
        if d.read_interval_secs == 0 {
            errors.push("device: read_interval_secs must be positive".into());
        }
        if d.command_timeout_secs == 0 {
            errors.push("device: command_timeout_secs must be positive".into());
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;

        // ── Band ordering ───────────────────────────────────
        let bands = [
            ("temperature_critical", t.temperature_critical_low, t.temperature_critical_high),
            ("humidity_warning", t.humidity_warning_low, t.humidity_warning_high),
            ("soil", t.soil_critical_low, t.soil_warning_high),
        ];
        for (name, low, high) in bands {
            if low >= high {
                errors.push(format!(
                    "thresholds: {name} low ({low}) must be below high ({high})"
                ));
            }
        }

        // ── Physical ranges ─────────────────────────────────
        for (name, v) in [
            ("humidity_warning_low", t.humidity_warning_low),
            ("humidity_warning_high", t.humidity_warning_high),
        ] {
            if !(0.0..=100.0).contains(&v) {
                errors.push(format!("thresholds: {name} {v} out of range [0, 100]"));
            }
        }
        for (name, v) in [
            ("soil_critical_low", t.soil_critical_low),
            ("soil_warning_high", t.soil_warning_high),
        ] {
            if !(0.0..=1.0).contains(&v) {
                errors.push(format!("thresholds: {name} {v} out of range [0.0, 1.0]"));
            }
        }
        if t.co2_info_low < 0.0 {
            errors.push(format!("thresholds: co2_info_low {} is negative", t.co2_info_low));
        }

        // ── Trend rates ─────────────────────────────────────
        if t.temperature_rate_per_hour <= 0.0 {
            errors.push(format!(
                "thresholds: temperature_rate_per_hour must be positive, got {}",
                t.temperature_rate_per_hour
            ));
        }
        if t.soil_drop_per_hour <= 0.0 {
            errors.push(format!(
                "thresholds: soil_drop_per_hour must be positive, got {}",
                t.soil_drop_per_hour
            ));
        }
    }

    fn validate_scheduler(&self, errors: &mut Vec<String>) {
        let s = &self.scheduler;

        for (job, entry) in self.periodic_entries() {
            if entry.every_mins == Some(0) {
                errors.push(format!(
                    "scheduler.{}: every_mins must be positive",
                    job.name()
                ));
            }
        }

        let r = &s.data_retention;
        if r.hour > 23 {
            errors.push(format!("scheduler.data_retention: hour {} out of range [0, 23]", r.hour));
        }
        if r.minute > 59 {
            errors.push(format!(
                "scheduler.data_retention: minute {} out of range [0, 59]",
                r.minute
            ));
        }

        if !(0.0..=100.0).contains(&s.emergency_threshold) {
            errors.push(format!(
                "scheduler: emergency_threshold {} out of range [0, 100]",
                s.emergency_threshold
            ));
        }
        if s.trend_window_mins == 0 {
            errors.push("scheduler: trend_window_mins must be positive".into());
        }
        if s.predictive_window_hours == 0 {
            errors.push("scheduler: predictive_window_hours must be positive".into());
        }
        if let Err(e) = ForecastHorizon::new(s.predictive_horizon_hours) {
            errors.push(format!("scheduler: predictive_horizon_hours: {e}"));
        }
        if s.predictive_min_samples < MIN_SAMPLES {
            errors.push(format!(
                "scheduler: predictive_min_samples {} is below the forecast minimum of {MIN_SAMPLES}",
                s.predictive_min_samples
            ));
        }
    }

    fn validate_web(&self, errors: &mut Vec<String>) {
        let w = &self.web;
        if w.port == 0 {
            errors.push("web: port must be non-zero".into());
        }
        if w.max_history_hours == 0 {
            errors.push("web: max_history_hours must be positive".into());
        }
        if w.max_forecast_hours == 0 || i64::from(w.max_forecast_hours) > MAX_HORIZON_HOURS {
            errors.push(format!(
                "web: max_forecast_hours {} out of range [1, {MAX_HORIZON_HOURS}]",
                w.max_forecast_hours
            ));
        }
    }

    fn periodic_entries(&self) -> [(Job, &JobEntry); 4] {
        let s = &self.scheduler;
        [
            (Job::HealthAnalysis, &s.health_analysis),
            (Job::AlertCheck, &s.alert_check),
            (Job::PredictiveAnalysis, &s.predictive_analysis),
            (Job::SystemHealth, &s.system_health),
        ]
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Apply `SERIAL_PORT`, `SERIAL_BAUDRATE`, and `WEB_PORT` on top of the
    /// file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = get("SERIAL_PORT") {
            self.device.port = if port.trim().is_empty() {
                None
            } else {
                Some(port)
            };
        }
        if let Some(baud) = get("SERIAL_BAUDRATE") {
            self.device.baud_rate = baud
                .trim()
                .parse()
                .with_context(|| format!("invalid SERIAL_BAUDRATE: {baud}"))?;
        }
        if let Some(port) = get("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid WEB_PORT: {port}"))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversions
    // -----------------------------------------------------------------------

    pub fn device_source(&self) -> DeviceSource {
        let d = &self.device;
        match (&d.port, &d.command) {
            (Some(path), _) => DeviceSource::Serial {
                path: path.clone(),
                baud_rate: d.baud_rate,
            },
            (None, Some(program)) => DeviceSource::Process {
                program: program.clone(),
                args: d.args.clone(),
            },
            (None, None) => DeviceSource::Absent,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            read_interval: Duration::from_secs(self.device.read_interval_secs),
            command_timeout: Duration::from_secs(self.device.command_timeout_secs),
            seed: None,
        }
    }

    /// Scheduler settings. Call after [`Config::validate`].
    pub fn scheduler_settings(&self) -> Result<SchedulerSettings> {
        let s = &self.scheduler;

        let mut jobs = Vec::new();
        for (job, entry) in self.periodic_entries() {
            if entry.enabled {
                let mins = entry.every_mins.unwrap_or_else(|| default_every_mins(job));
                jobs.push((job, Cadence::Every(Duration::from_secs(mins * 60))));
            }
        }
        if s.data_retention.enabled {
            jobs.push((
                Job::DataRetention,
                Cadence::DailyAt {
                    hour: s.data_retention.hour,
                    minute: s.data_retention.minute,
                },
            ));
        }

        Ok(SchedulerSettings {
            jobs,
            thresholds: self.thresholds.clone(),
            emergency_threshold: s.emergency_threshold,
            trend_window: Duration::from_secs(s.trend_window_mins * 60),
            predictive_window: Duration::from_secs(s.predictive_window_hours * 3600),
            predictive_horizon: ForecastHorizon::new(s.predictive_horizon_hours)?,
            predictive_min_samples: s.predictive_min_samples,
            retention: Duration::from_secs(u64::from(self.retention.days) * 24 * 3600),
        })
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the defaults. Environment
/// overrides are applied and the result re-validated.
pub fn load_or_default(path: &str) -> Result<Config> {
    let mut config = if std::path::Path::new(path).exists() {
        load(path)?
    } else {
        info!(path, "no config file, using defaults");
        Config::default()
    };
    config.apply_env()?;
    config.validate().context("invalid config after environment overrides")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[device]
port = "/dev/ttyACM0"
baud_rate = 115200
read_interval_secs = 10

[history]
capacity = 2000

[thresholds]
temperature_critical_high = 32.0
soil_drop_per_hour = 0.05

[scheduler]
emergency_threshold = 35.0
predictive_horizon_hours = 6

[scheduler.alert_check]
every_mins = 1

[scheduler.system_health]
enabled = false

[scheduler.data_retention]
hour = 3
minute = 30

[retention]
days = 14

[web]
port = 9000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.device.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.device.baud_rate, 115200);
        assert_eq!(config.device.command_timeout_secs, 2);
        assert_eq!(config.history.capacity, 2000);
        assert_eq!(config.thresholds.temperature_critical_high, 32.0);
        assert_eq!(config.thresholds.temperature_critical_low, 15.0);
        assert_eq!(config.scheduler.alert_check.every_mins, Some(1));
        assert!(!config.scheduler.system_health.enabled);
        assert_eq!(config.retention.days, 14);
        assert_eq!(config.web.port, 9000);
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.device.port.is_none());
        assert_eq!(config.history.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.web.max_history_hours, 168);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_section_types_rejected() {
        assert!(toml::from_str::<Config>("[device]\nbaud_rate = \"fast\"").is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn zero_read_interval_rejected() {
        let mut cfg = Config::default();
        cfg.device.read_interval_secs = 0;
        assert_validation_err(&cfg, "read_interval_secs must be positive");
    }

    #[test]
    fn empty_port_rejected() {
        let mut cfg = Config::default();
        cfg.device.port = Some("  ".into());
        assert_validation_err(&cfg, "port is empty");
    }

    #[test]
    fn port_and_command_conflict() {
        let mut cfg = Config::default();
        cfg.device.port = Some("/dev/ttyACM0".into());
        cfg.device.command = Some("greenhouse-node".into());
        assert_validation_err(&cfg, "either port or command");
    }

    #[test]
    fn args_need_a_command() {
        let mut cfg = Config::default();
        cfg.device.args = vec!["--fast".into()];
        assert_validation_err(&cfg, "args given without a command");
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut cfg = Config::default();
        cfg.history.capacity = 0;
        assert_validation_err(&cfg, "capacity must be positive");
    }

    #[test]
    fn inverted_temperature_band_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.temperature_critical_low = 40.0;
        assert_validation_err(&cfg, "temperature_critical low (40) must be below high (35)");
    }

    #[test]
    fn soil_threshold_out_of_range() {
        let mut cfg = Config::default();
        cfg.thresholds.soil_warning_high = 1.5;
        assert_validation_err(&cfg, "soil_warning_high 1.5 out of range");
    }

    #[test]
    fn zero_job_period_rejected() {
        let mut cfg = Config::default();
        cfg.scheduler.health_analysis.every_mins = Some(0);
        assert_validation_err(&cfg, "scheduler.health_analysis: every_mins must be positive");
    }

    #[test]
    fn retention_hour_out_of_range() {
        let mut cfg = Config::default();
        cfg.scheduler.data_retention.hour = 24;
        assert_validation_err(&cfg, "hour 24 out of range");
    }

    #[test]
    fn predictive_horizon_capped() {
        let mut cfg = Config::default();
        cfg.scheduler.predictive_horizon_hours = 100;
        assert_validation_err(&cfg, "predictive_horizon_hours");
    }

    #[test]
    fn predictive_min_samples_floor() {
        let mut cfg = Config::default();
        cfg.scheduler.predictive_min_samples = 2;
        assert_validation_err(&cfg, "below the forecast minimum");
    }

    #[test]
    fn forecast_cap_above_engine_limit() {
        let mut cfg = Config::default();
        cfg.web.max_forecast_hours = 100;
        assert_validation_err(&cfg, "max_forecast_hours 100 out of range");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.device.baud_rate = 0;
        cfg.retention.days = 0;
        cfg.web.port = 0;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        // Should report many errors, not bail after the first
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("baud_rate"), "{msg}");
        assert!(msg.contains("retention"), "{msg}");
        assert!(msg.contains("web: port"), "{msg}");
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_device_and_web() {
        let mut cfg = Config::default();
        cfg.apply_env_from(env(&[
            ("SERIAL_PORT", "/dev/ttyUSB1"),
            ("SERIAL_BAUDRATE", "57600"),
            ("WEB_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(cfg.device.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(cfg.device.baud_rate, 57600);
        assert_eq!(cfg.web.port, 9100);
    }

    #[test]
    fn empty_serial_port_env_disables_device() {
        let mut cfg = Config::default();
        cfg.device.port = Some("/dev/ttyACM0".into());
        cfg.apply_env_from(env(&[("SERIAL_PORT", "")])).unwrap();
        assert!(matches!(cfg.device_source(), DeviceSource::Absent));
    }

    #[test]
    fn bad_env_number_is_an_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_from(env(&[("SERIAL_BAUDRATE", "fast")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid SERIAL_BAUDRATE"));
    }

    // -- Conversions ------------------------------------------------------

    #[test]
    fn scheduler_settings_respect_enable_flags() {
        let mut cfg = Config::default();
        cfg.scheduler.system_health.enabled = false;
        cfg.scheduler.alert_check.every_mins = Some(1);
        let s = cfg.scheduler_settings().unwrap();

        let jobs: Vec<Job> = s.jobs.iter().map(|(j, _)| *j).collect();
        assert!(!jobs.contains(&Job::SystemHealth));
        assert_eq!(jobs.len(), 4);

        let alert = s.jobs.iter().find(|(j, _)| *j == Job::AlertCheck).unwrap();
        assert_eq!(alert.1, Cadence::Every(Duration::from_secs(60)));
        assert_eq!(s.predictive_horizon.hours(), 12);
        assert_eq!(s.retention, Duration::from_secs(30 * 24 * 3600));
    }

    #[test]
    fn default_cadences() {
        let s = Config::default().scheduler_settings().unwrap();
        let health = s
            .jobs
            .iter()
            .find(|(j, _)| *j == Job::HealthAnalysis)
            .unwrap();
        assert_eq!(health.1, Cadence::Every(Duration::from_secs(600)));
        assert!(s
            .jobs
            .contains(&(Job::DataRetention, Cadence::DailyAt { hour: 2, minute: 0 })));
    }

    #[test]
    fn command_selects_process_source() {
        let cfg: Config = toml::from_str(
            "[device]\ncommand = \"greenhouse-node\"\nargs = [\"--quiet\"]",
        )
        .unwrap();
        cfg.validate().unwrap();
        match cfg.device_source() {
            DeviceSource::Process { program, args } => {
                assert_eq!(program, "greenhouse-node");
                assert_eq!(args, vec!["--quiet".to_string()]);
            }
            other => panic!("unexpected source: {}", other.describe()),
        }
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(load("/nonexistent/greenhouse.toml").is_err());
    }
}
