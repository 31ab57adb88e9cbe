mod alerts;
mod config;
mod db;
mod device;
mod event;
mod forecast;
mod history;
mod hub;
mod pipeline;
mod protocol;
mod reading;
mod scheduler;
mod state;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use pipeline::ConnectionState;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("greenhouse_hub=info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "greenhouse.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:greenhouse.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    info!(url = %db_url, "database ready");

    // ── Services ────────────────────────────────────────────────────
    let source = cfg.device_source();
    if matches!(source, device::DeviceSource::Absent) {
        warn!("no device configured, running on synthetic data");
    }
    let app = Arc::new(AppState::build(&cfg, source, Some(db))?);
    app.start().await;

    // ── Link monitor ────────────────────────────────────────────────
    // The pipeline never reconnects on its own.
    let pipeline = app.pipeline().clone();
    let mut link_state = pipeline.watch_state();
    tokio::spawn(async move {
        while link_state.changed().await.is_ok() {
            let state = *link_state.borrow_and_update();
            if state == ConnectionState::Disconnected && pipeline.is_running() {
                warn!(device = %pipeline.device(), "device link lost, POST /api/system/restart to reconnect");
            }
        }
    });

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&app);
    let port = cfg.web.port;
    let mut server = tokio::spawn(async move { web::serve(web_state, port).await });

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
        }
        res = &mut server => {
            match res {
                Ok(Ok(())) => warn!("web server exited"),
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "web server failed"),
                Err(e) => error!(error = %e, "web server task aborted"),
            }
        }
    }

    app.shutdown();
    server.abort();
    Ok(())
}
