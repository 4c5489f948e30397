use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use payflux_core::error::FlowError;
use payflux_core::flow::{FlowFilter, FlowStatus};
use payflux_engine::{BatchOperation, ListPage};

use crate::connection;
use crate::state::AppState;

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn api_err(e: FlowError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        FlowError::FlowNotFound(_) | FlowError::StepNotFound(_) => StatusCode::NOT_FOUND,
        FlowError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        FlowError::InvalidAllocation { .. } | FlowError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

/// Operation result plus the updated flow detail.
async fn operation_response(
    state: &AppState,
    id: &str,
    result: payflux_engine::OperationResult,
) -> ApiResult {
    let flow = state.control.detail(id).await.map_err(api_err)?;
    Ok(Json(serde_json::json!({ "result": result, "flow": flow })))
}

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub flow_type: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/flows
pub async fn list_flows(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult {
    let status = match &q.status {
        Some(s) => Some(s.parse::<FlowStatus>().map_err(|e| bad_request(e.to_string()))?),
        None => None,
    };
    let filter = FlowFilter {
        status,
        user_id: q.user_id,
        flow_type: q.flow_type,
        correlation_id: q.correlation_id,
        pause_reason: q.pause_reason,
        created_after: q.created_after,
        created_before: q.created_before,
    };
    let page = ListPage {
        limit: q.limit,
        offset: q.offset,
    };
    let listing = state.control.list(&filter, page).await.map_err(api_err)?;
    Ok(Json(serde_json::to_value(listing).map_err(|e| api_err(e.into()))?))
}

// GET /api/flows/:id
pub async fn flow_detail(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let flow = state.control.detail(&id).await.map_err(api_err)?;
    Ok(Json(serde_json::to_value(flow).map_err(|e| api_err(e.into()))?))
}

// GET /api/flows/:id/timeline
pub async fn flow_timeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let events = state.control.timeline(&id).await.map_err(api_err)?;
    Ok(Json(serde_json::json!({ "flow_id": id, "events": events })))
}

#[derive(Deserialize)]
pub struct StatisticsQuery {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

// GET /api/statistics
pub async fn statistics(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatisticsQuery>,
) -> ApiResult {
    let stats = state
        .control
        .statistics(q.start_date, q.end_date)
        .await
        .map_err(api_err)?;
    Ok(Json(serde_json::to_value(stats).map_err(|e| api_err(e.into()))?))
}

#[derive(Deserialize, Default)]
pub struct PauseBody {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// POST /api/flows/:id/pause
pub async fn pause_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<PauseBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let reason = body.reason.as_deref().unwrap_or("operator request");
    let result = state
        .control
        .pause(&id, reason, body.message.as_deref())
        .await
        .map_err(api_err)?;
    operation_response(&state, &id, result).await
}

#[derive(Deserialize, Default)]
pub struct ResumeBody {
    /// Entries merged into the flow's data bag before resuming.
    #[serde(default)]
    pub data: Option<std::collections::HashMap<String, serde_json::Value>>,
}

// POST /api/flows/:id/resume
pub async fn resume_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResumeBody>>,
) -> ApiResult {
    let data = body.and_then(|Json(b)| b.data);
    let result = state.control.resume(&id, data).await.map_err(api_err)?;
    operation_response(&state, &id, result).await
}

#[derive(Deserialize, Default)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

// POST /api/flows/:id/cancel
pub async fn cancel_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> ApiResult {
    let reason = body.and_then(|Json(b)| b.reason);
    let result = state
        .control
        .cancel(&id, reason.as_deref())
        .await
        .map_err(api_err)?;
    operation_response(&state, &id, result).await
}

#[derive(Deserialize, Default)]
pub struct ResolveBody {
    #[serde(default)]
    pub note: Option<String>,
}

// POST /api/flows/:id/resolve
pub async fn resolve_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResolveBody>>,
) -> ApiResult {
    let note = body
        .and_then(|Json(b)| b.note)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "resolved by operator".to_string());
    let result = state.control.resolve(&id, &note).await.map_err(api_err)?;
    operation_response(&state, &id, result).await
}

// POST /api/flows/:id/retry
pub async fn retry_flow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let result = state.control.retry(&id).await.map_err(api_err)?;
    operation_response(&state, &id, result).await
}

#[derive(Deserialize)]
pub struct BatchBody {
    pub flow_ids: Vec<String>,
    #[serde(default)]
    pub options: Option<BatchOptions>,
}

#[derive(Deserialize)]
pub struct BatchOptions {
    #[serde(default)]
    pub reason: Option<String>,
}

// POST /api/flows/batch/:operation
pub async fn batch(
    State(state): State<Arc<AppState>>,
    Path(operation): Path<String>,
    Json(body): Json<BatchBody>,
) -> ApiResult {
    let operation = match operation.as_str() {
        "pause" => BatchOperation::Pause,
        "resume" => BatchOperation::Resume,
        "cancel" => BatchOperation::Cancel,
        "retry" => BatchOperation::Retry,
        other => return Err(bad_request(format!("unknown batch operation: {other}"))),
    };
    if body.flow_ids.is_empty() {
        return Err(bad_request("flow_ids is required"));
    }
    info!(
        operation = operation.as_str(),
        count = body.flow_ids.len(),
        "Batch operation requested"
    );
    let reason = body.options.as_ref().and_then(|o| o.reason.as_deref());
    let report = state
        .control
        .batch(operation, &body.flow_ids, reason)
        .await
        .map_err(api_err)?;
    Ok(Json(serde_json::to_value(report).map_err(|e| api_err(e.into()))?))
}

// POST /api/recovery/crashed
pub async fn recover_crashed(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.recovery.recover_crashed().await.map_err(api_err)?;
    Ok(Json(serde_json::to_value(report).map_err(|e| api_err(e.into()))?))
}

// POST /api/recovery/restore-runtime
pub async fn restore_runtime(State(state): State<Arc<AppState>>) -> ApiResult {
    let restored = state.recovery.restore_runtime().await.map_err(api_err)?;
    Ok(Json(serde_json::json!({ "restored": restored })))
}

// GET /ws — WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    info!("WebSocket client connected");
    connection::handle_connection(socket, state.control.clone(), state.event_bus.clone()).await;
    debug!("WebSocket client disconnected");
}
