//! Stateful greenhouse climate simulator for local development.
//!
//! Models plausible sensor behaviour for every channel the board reports:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual soil drying drift (evaporation)
//! - Per-reading electronic noise
//! - Occasional soil sensor spikes, which may leave the valid range
//! - Diurnal (day/night) cycle for temperature, humidity and light
//! - Closed-loop watering response (soil moisture rises while watering)

use serde::Serialize;
use std::f64::consts::PI;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(rng: &mut fastrand::Rng, mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal(rng)
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, steady drift toward dry. Moderate noise. ~3% spike
    /// rate. Trips the hub's soil trend and drought alerts within hours.
    Drying,
    /// Hovers near the optimum. Low noise, rare spikes. Good for dashboards
    /// without alert traffic.
    Stable,
    /// High noise, ~10% spike rate, large spikes. Exercises the hub's record
    /// validation and the forecast's tolerance for noisy windows.
    Flaky,
    /// Starts near saturation. Very slow drying. Raises waterlogging
    /// warnings until it dries out.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Output record
// ---------------------------------------------------------------------------

/// One record in the board's wire format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub temp: f64,
    pub humidity: f64,
    pub soil: f64,
    pub co2: f64,
    pub light: f64,
    pub ph: f64,
    pub nutrients: f64,
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// A mean-reverting random walk bounded to `[lo, hi]`.
#[derive(Debug, Clone)]
struct Channel {
    value: f64,
    center: f64,
    lo: f64,
    hi: f64,
    walk_sigma: f64,
    mean_reversion: f64,
}

impl Channel {
    fn new(start: f64, center: f64, (lo, hi): (f64, f64), walk_sigma: f64, mean_reversion: f64) -> Self {
        Self {
            value: start,
            center,
            lo,
            hi,
            walk_sigma,
            mean_reversion,
        }
    }

    fn step(&mut self, rng: &mut fastrand::Rng, push: f64) -> f64 {
        let pull = self.mean_reversion * (self.center - self.value);
        let walk = gaussian(rng, 0.0, self.walk_sigma);
        self.value = (self.value + pull + walk + push).clamp(self.lo, self.hi);
        self.value
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing a full greenhouse record per tick.
pub struct GreenhouseSim {
    rng: fastrand::Rng,

    temperature: Channel,
    humidity: Channel,
    soil: Channel,
    co2: Channel,
    ph: Channel,
    nutrients: Channel,

    // Soil behaviour
    soil_drift: f64,
    soil_noise: f64,
    spike_prob: f64,
    spike_sigma: f64,

    // Diurnal cycle
    tick: u64,
    sample_every_s: f64,
    diurnal_period_s: f64,

    // Watering response
    watering_ticks: u32,
    wet_rate: f64,
}

impl GreenhouseSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real time.
    pub fn new(scenario: Scenario, sample_every_s: f64, diurnal_period_s: f64) -> Self {
        Self::with_rng(scenario, sample_every_s, diurnal_period_s, fastrand::Rng::new())
    }

    pub fn with_rng(
        scenario: Scenario,
        sample_every_s: f64,
        diurnal_period_s: f64,
        mut rng: fastrand::Rng,
    ) -> Self {
        // (start, drift per tick, walk sigma, noise sigma, spike prob, spike sigma)
        let (soil_start, drift, walk, noise, spike_prob, spike_sigma) = match scenario {
            Scenario::Drying => (0.5, -0.004, 0.005, 0.005, 0.03, 0.15),
            Scenario::Stable => (0.6, -0.0005, 0.002, 0.003, 0.005, 0.08),
            Scenario::Flaky => (0.5, -0.003, 0.01, 0.02, 0.10, 0.35),
            Scenario::Wet => (0.88, -0.001, 0.003, 0.004, 0.02, 0.10),
        };
        // Flaky boards also wander more on the air channels.
        let air = if scenario == Scenario::Flaky { 2.0 } else { 1.0 };

        let soil_start = (soil_start + gaussian(&mut rng, 0.0, 0.02)).clamp(0.0, 1.0);

        Self {
            temperature: Channel::new(23.0, 23.0, (-10.0, 50.0), 0.15 * air, 0.05),
            humidity: Channel::new(60.0, 60.0, (5.0, 100.0), 0.8 * air, 0.05),
            // no mean reversion: soil only recovers through watering
            soil: Channel::new(soil_start, soil_start, (0.0, 1.0), walk, 0.0),
            co2: Channel::new(800.0, 800.0, (300.0, 2500.0), 12.0 * air, 0.05),
            ph: Channel::new(6.5, 6.5, (4.0, 9.0), 0.02, 0.05),
            nutrients: Channel::new(0.6, 0.6, (0.0, 1.5), 0.01, 0.02),
            rng,
            soil_drift: drift,
            soil_noise: noise,
            spike_prob,
            spike_sigma,
            tick: 0,
            sample_every_s,
            diurnal_period_s,
            watering_ticks: 0,
            wet_rate: 0.03,
        }
    }

    /// Run the watering response for the next `ticks` samples.
    pub fn start_watering(&mut self, ticks: u32) {
        self.watering_ticks = self.watering_ticks.max(ticks);
    }

    pub fn is_watering(&self) -> bool {
        self.watering_ticks > 0
    }

    /// Produce the next record. Internal state evolves with each call.
    pub fn next_sample(&mut self) -> Sample {
        // Dawn at tick 0, warmest a quarter period later.
        let elapsed = self.tick as f64 * self.sample_every_s;
        let phase = 2.0 * PI * elapsed / self.diurnal_period_s;
        let day = phase.sin();
        self.tick += 1;

        let rng = &mut self.rng;

        // -- Air --------------------------------------------------------------
        let temp = self.temperature.step(rng, 0.0) + 4.0 * day + gaussian(rng, 0.0, 0.1);
        // Warm afternoons are drier.
        let humidity = (self.humidity.step(rng, 0.0) - 8.0 * day + gaussian(rng, 0.0, 0.5))
            .clamp(0.0, 100.0);
        let co2 = (self.co2.step(rng, 0.0) - 60.0 * day).max(300.0);
        let light = (day.max(0.0) * 800.0 + gaussian(rng, 0.0, 15.0)).max(0.0);

        // -- Soil -------------------------------------------------------------
        let wet = if self.watering_ticks > 0 {
            self.watering_ticks -= 1;
            self.wet_rate
        } else {
            0.0
        };
        let base = self.soil.step(rng, self.soil_drift + wet);
        let spike = if rng.f64() < self.spike_prob {
            gaussian(rng, 0.0, self.spike_sigma)
        } else {
            0.0
        };
        let soil = (base + gaussian(rng, 0.0, self.soil_noise)).clamp(0.0, 1.0) + spike;

        // -- Root zone --------------------------------------------------------
        let ph = self.ph.step(rng, 0.0);
        let nutrients = self.nutrients.step(rng, 0.0);

        Sample {
            temp: round_to(temp, 1),
            humidity: round_to(humidity, 1),
            soil: round_to(soil, 3),
            co2: co2.round(),
            light: round_to(light, 1),
            ph: round_to(ph, 2),
            nutrients: round_to(nutrients, 2),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
