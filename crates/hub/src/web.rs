use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::alerts::{analyze, AlertError};
use crate::db::{StoredAlert, Transition};
use crate::event::Event;
use crate::forecast::{forecast, Forecast, ForecastHorizon};
use crate::hub::Subscription;
use crate::protocol::DeviceCommand;
use crate::reading::Reading;
use crate::state::SharedState;

/// Trailing history the forecast endpoint fits against.
const FORECAST_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_HISTORY_HOURS: i64 = 24;
const DEFAULT_FORECAST_HOURS: i64 = 24;
const DEFAULT_ALERT_LIMIT: i64 = 50;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/telemetry/latest", get(telemetry_latest))
        .route("/api/telemetry/history", get(telemetry_history))
        .route("/api/analysis/auto", get(analysis_auto))
        .route("/api/predictions/forecast", get(predictions_forecast))
        .route("/api/alerts/active", get(alerts_active))
        .route("/api/alerts/{id}/acknowledge", post(alert_acknowledge))
        .route("/api/alerts/{id}/resolve", post(alert_resolve))
        .route("/api/actuators/command", post(actuator_command))
        .route("/api/system/restart", post(system_restart))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An HTTP failure rendered as `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = %format!("{e:#}"), "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

async fn api_health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.to_health())
}

async fn telemetry_latest(State(state): State<SharedState>) -> ApiResult<Reading> {
    state
        .history()
        .latest()
        .map(|r| Json(Reading::clone(&r)))
        .ok_or_else(|| ApiError::not_found("No telemetry data available"))
}

#[derive(Deserialize)]
struct HistoryQuery {
    hours: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    hours: i64,
    count: usize,
    readings: Vec<Reading>,
}

async fn telemetry_history(
    State(state): State<SharedState>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<HistoryResponse> {
    let hours = q.hours.unwrap_or(DEFAULT_HISTORY_HOURS);
    let max = i64::from(state.limits().max_history_hours);
    if hours <= 0 || hours > max {
        return Err(ApiError::bad_request(format!(
            "hours must be between 1 and {max}, got {hours}"
        )));
    }

    let span = Duration::from_secs(hours.unsigned_abs() * 3600);
    let readings: Vec<Reading> = state.history().window(span).iter().cloned().collect();
    Ok(Json(HistoryResponse {
        hours,
        count: readings.len(),
        readings,
    }))
}

async fn analysis_auto(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let latest = state
        .history()
        .latest()
        .ok_or_else(|| ApiError::not_found("No telemetry data available for analysis"))?;
    Ok(Json(analyze(&latest, state.scorer())))
}

#[derive(Deserialize)]
struct ForecastQuery {
    hours_ahead: Option<i64>,
}

async fn predictions_forecast(
    State(state): State<SharedState>,
    Query(q): Query<ForecastQuery>,
) -> ApiResult<Forecast> {
    let hours = q.hours_ahead.unwrap_or(DEFAULT_FORECAST_HOURS);
    let max = i64::from(state.limits().max_forecast_hours);
    if hours > max {
        return Err(ApiError::bad_request(format!(
            "forecast horizon must be between 1 and {max} hours, got {hours}"
        )));
    }
    let horizon = ForecastHorizon::new(hours).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let window = state.history().window(FORECAST_WINDOW);
    Ok(Json(forecast(&window, horizon)))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AlertsQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct AlertsResponse {
    count: usize,
    alerts: Vec<StoredAlert>,
}

async fn alerts_active(
    State(state): State<SharedState>,
    Query(q): Query<AlertsQuery>,
) -> ApiResult<AlertsResponse> {
    let db = state
        .db()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Alert storage disabled"))?;
    let limit = q.limit.unwrap_or(DEFAULT_ALERT_LIMIT).clamp(1, 500);
    let alerts = db.active_alerts(limit).await?;
    Ok(Json(AlertsResponse {
        count: alerts.len(),
        alerts,
    }))
}

async fn alert_acknowledge(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let db = state
        .db()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Alert storage disabled"))?;
    let outcome = db.acknowledge_alert(id, OffsetDateTime::now_utc()).await?;
    settle(id, outcome, AlertError::AlreadyAcknowledged(id), "acknowledged")
}

async fn alert_resolve(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let db = state
        .db()
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Alert storage disabled"))?;
    let outcome = db.resolve_alert(id, OffsetDateTime::now_utc()).await?;
    settle(id, outcome, AlertError::AlreadyResolved(id), "resolved")
}

fn settle(id: i64, outcome: Transition, conflict: AlertError, verb: &str) -> ApiResult<Value> {
    match outcome {
        Transition::Applied => {
            info!(alert = id, "alert {verb}");
            Ok(Json(json!({ "status": verb, "alert_id": id })))
        }
        Transition::AlreadyDone => Err(ApiError::new(StatusCode::CONFLICT, conflict.to_string())),
        Transition::NotFound => Err(ApiError::not_found(format!("Alert {id} not found"))),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CommandRequest {
    action_type: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default = "default_trigger")]
    triggered_by: String,
}

fn default_trigger() -> String {
    "manual".to_string()
}

async fn actuator_command(
    State(state): State<SharedState>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<Value> {
    if req.action_type.trim().is_empty() {
        return Err(ApiError::bad_request("action_type must not be empty"));
    }

    let cmd = DeviceCommand::new(req.action_type.clone(), req.parameters.clone());
    if !state.pipeline().send_command(&cmd).await {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Device not connected or command failed",
        ));
    }

    state.hub().publish(&Event::ActuatorAction {
        action: req.action_type.clone(),
        parameters: req.parameters,
        triggered_by: req.triggered_by,
        success: true,
    });
    Ok(Json(json!({ "status": "success", "action": req.action_type })))
}

async fn system_restart(State(state): State<SharedState>) -> ApiResult<Value> {
    state.restart().await?;
    Ok(Json(json!({ "status": "restarted" })))
}

// ---------------------------------------------------------------------------
// WebSocket subscribers
// ---------------------------------------------------------------------------

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| subscriber_session(socket, state))
}

async fn subscriber_session(mut socket: WebSocket, state: SharedState) {
    let hub = state.hub().clone();
    let Subscription { id, mut outbox } = hub.register();

    loop {
        tokio::select! {
            queued = outbox.recv() => match queued {
                Some(payload) => {
                    if socket.send(Message::Text(payload.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                // dropped by the hub after a failed delivery
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => hub.handle_message(id, text.as_str()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(subscriber = id, "websocket closed");
    hub.unregister(id);
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
