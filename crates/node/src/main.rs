//! Greenhouse board emulator.
//!
//! Writes one JSON record per line on stdout and reads JSON commands, one per
//! line, on stdin. Bridge it to the hub with a pty pair, e.g.
//! `socat PTY,link=/tmp/greenhouse,raw EXEC:greenhouse-node`.

mod sim;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{GreenhouseSim, Sample, Scenario};

#[derive(Debug, Serialize)]
struct Record {
    #[serde(flatten)]
    sample: Sample,
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
}

/// Inbound command line, as the hub writes it.
#[derive(Debug, Deserialize)]
struct Command {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Map<String, Value>,
}

fn encode(sample: Sample, ts: OffsetDateTime) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(&Record { sample, ts })?;
    line.push('\n');
    Ok(line)
}

/// Number of ticks a `water` command runs for. `params.duration` is in
/// seconds; without it the default applies.
fn watering_ticks(cmd: &Command, sample_every_s: u64, default_ticks: u32) -> u32 {
    match cmd.params.get("duration").and_then(Value::as_u64) {
        Some(secs) => {
            let ticks = secs.div_ceil(sample_every_s.max(1)).max(1);
            u32::try_from(ticks).unwrap_or(u32::MAX)
        }
        None => default_ticks,
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout carries records, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("greenhouse_node=info")),
        )
        .init();

    // Env config
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 5).max(1);
    let diurnal_period_s: f64 = env_or("DIURNAL_PERIOD_S", 86_400.0);
    let default_ticks: u32 = env_or("WATERING_TICKS", 6);

    let mut sim = GreenhouseSim::new(scenario, sample_every_s as f64, diurnal_period_s);
    info!(%scenario, sample_every_s, diurnal_period_s, "node started");

    let mut ticker = tokio::time::interval(Duration::from_secs(sample_every_s));
    let mut stdout = tokio::io::stdout();
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sample = sim.next_sample();
                let line = encode(sample, OffsetDateTime::now_utc())?;
                stdout.write_all(line.as_bytes()).await.context("record write failed")?;
                stdout.flush().await.context("record write failed")?;
                debug!(soil = sample.soil, watering = sim.is_watering(), "record sent");
            }
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<Command>(line.trim()) {
                    Ok(cmd) if cmd.kind == "water" => {
                        let ticks = watering_ticks(&cmd, sample_every_s, default_ticks);
                        sim.start_watering(ticks);
                        info!(ticks, "watering started");
                    }
                    Ok(cmd) => warn!(command = %cmd.kind, "unsupported command ignored"),
                    Err(e) => warn!(error = %e, "bad command json"),
                },
                Ok(None) => {
                    info!("stdin closed, no further commands");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed, no further commands");
                    stdin_open = false;
                }
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
