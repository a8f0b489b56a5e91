//! The HTTP engine: axum routes for step execution, confirmation,
//! outbox relay, heartbeat checks, and a small read-only API.
//!
//! Internal endpoints accept either the `x-internal-system-key` header or
//! a signed webhook (`hmac-signature` / `hmac-timestamp` over the raw
//! body, 5-minute window). Signature verification needs the raw bytes, so
//! handlers take `Bytes` and parse JSON themselves.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use ratchet_core::error::EngineError;
use ratchet_core::machine::{StepOutcome, WorkflowMachine};
use ratchet_core::outbox_relay::{OutboxRelay, RelayRequest};
use ratchet_core::signing::{SIGNATURE_HEADER, SigningKeys, TIMESTAMP_HEADER, verify};
use ratchet_core::trace::{
    CORRELATION_ID_HEADER, INTERNAL_KEY_HEADER, TRACE_ID_HEADER, TraceContext,
};
use ratchet_store::models::{Execution, Intent, Plan};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "AUTH",
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION",
            message: msg.into(),
        }
    }

    pub fn degraded(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "DEGRADED",
            message: msg.into(),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        let (status, code) = match &e {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            EngineError::Auth(_) => (StatusCode::UNAUTHORIZED, "AUTH"),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            EngineError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            EngineError::Expired(_) => (StatusCode::GONE, "EXPIRED"),
            EngineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_UNAVAILABLE"),
            EngineError::Queue(_) => (StatusCode::INTERNAL_SERVER_ERROR, "QUEUE_UNAVAILABLE"),
            EngineError::Bus(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BUS_UNAVAILABLE"),
            EngineError::IllegalTransition { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ILLEGAL_TRANSITION")
            }
            EngineError::Stalled(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STALLED"),
        };
        Self {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "success": false,
            "status": self.status.as_u16(),
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub machine: WorkflowMachine,
    pub relay: Option<Arc<OutboxRelay>>,
    pub keys: SigningKeys,
    pub internal_key: String,
}

impl AppState {
    /// Accept a request bearing either the internal system key or a valid
    /// body signature.
    fn authorize(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
        if !self.internal_key.is_empty() {
            if let Some(presented) = headers
                .get(INTERNAL_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                if presented == self.internal_key {
                    return Ok(());
                }
                return Err(AppError::unauthorized("invalid internal system key"));
            }
        }

        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing credentials"))?;
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing signature"))?;

        verify(&self.keys, timestamp, signature, body, Utc::now())
            .map_err(|e| AppError::unauthorized(e.to_string()))
    }
}

fn trace_from(headers: &HeaderMap) -> TraceContext {
    TraceContext::from_headers(
        headers.get(TRACE_ID_HEADER).and_then(|v| v.to_str().ok()),
        headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    )
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("invalid body: {e}")))
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AcceptRequest {
    execution_id: Uuid,
    intent: Intent,
    plan: Plan,
}

#[derive(Debug, Deserialize)]
struct ReplacePlanRequest {
    plan: Plan,
}

#[derive(Debug, Deserialize)]
struct ExecuteStepRequest {
    execution_id: Uuid,
    #[serde(default)]
    start_step_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ConfirmRequest {
    token: Uuid,
    #[serde(default)]
    metadata: Option<ConfirmMetadata>,
}

#[derive(Debug, Deserialize)]
struct ConfirmMetadata {
    #[serde(default)]
    actor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatCheckRequest {
    execution_id: Uuid,
    expected_next_index: usize,
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    #[serde(default = "default_dlq_limit")]
    limit: usize,
}

fn default_dlq_limit() -> usize {
    50
}

/// Build the step-execution response body from the outcome and the
/// post-invocation execution document.
fn outcome_response(execution: Option<&Execution>, outcome: &StepOutcome) -> Value {
    let status = execution.map(|e| e.status.to_string());
    let error = execution.and_then(|e| e.error.as_ref());
    match outcome {
        StepOutcome::StepCompleted {
            step_id,
            execution_finished,
            next_step_triggered,
        } => json!({
            "success": true,
            "status": status,
            "step_id": step_id,
            "step_status": "completed",
            "execution_finished": execution_finished,
            "next_step_triggered": next_step_triggered,
        }),
        StepOutcome::IdempotentSkip { step_id } => json!({
            "success": true,
            "status": status,
            "step_id": step_id,
            "step_status": "completed",
            "next_step_triggered": false,
            "idempotent": true,
        }),
        StepOutcome::AwaitingConfirmation { step_id, token } => json!({
            "success": true,
            "status": status,
            "step_id": step_id,
            "step_status": "awaiting_confirmation",
            "confirmation_token": token,
            "next_step_triggered": false,
        }),
        StepOutcome::RetryScheduled { step_id, attempts } => json!({
            "success": true,
            "status": status,
            "step_id": step_id,
            "step_status": "pending",
            "retry_scheduled": true,
            "attempts": attempts,
            "next_step_triggered": false,
        }),
        StepOutcome::ReplanRequested { step_id } => json!({
            "success": true,
            "status": status,
            "step_id": step_id,
            "replan_requested": true,
            "next_step_triggered": false,
        }),
        StepOutcome::CompensationFinished {
            compensated,
            partial,
        } => json!({
            "success": false,
            "status": status,
            "compensated": compensated,
            "partially_compensated": partial,
            "error": error,
        }),
        StepOutcome::Escalated { step_id } => json!({
            "success": false,
            "status": status,
            "step_id": step_id,
            "escalated": true,
            "error": error,
        }),
        StepOutcome::Stalled => json!({
            "success": false,
            "status": status,
            "error": { "code": "STALLED", "message": "no runnable step" },
        }),
        StepOutcome::Resumed { step_id } => json!({
            "success": true,
            "status": status,
            "step_id": step_id,
            "resumed": true,
        }),
        StepOutcome::Cancelled => json!({
            "success": true,
            "status": status,
            "cancelled": true,
        }),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/engine/executions", post(accept_execution))
        .route("/engine/executions/{id}/plan", post(replace_plan))
        .route("/engine/execute-step", post(execute_step))
        .route("/engine/confirm", post(confirm))
        .route("/engine/outbox-relay", post(outbox_relay))
        .route("/engine/heartbeat-check", post(heartbeat_check))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/dlq", get(list_dlq))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("ratchet engine listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("ratchet engine shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn accept_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    state.authorize(&headers, &body)?;
    let request: AcceptRequest = parse_body(&body)?;
    let trace = trace_from(&headers);

    let execution = state
        .machine
        .accept(request.execution_id, request.intent, request.plan, trace)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "execution_id": execution.execution_id,
            "status": execution.status,
        })),
    )
        .into_response())
}

async fn replace_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    state.authorize(&headers, &body)?;
    let request: ReplacePlanRequest = parse_body(&body)?;
    let trace = trace_from(&headers);

    let execution = state.machine.replace_plan(id, request.plan, trace).await?;
    Ok(Json(json!({
        "success": true,
        "execution_id": execution.execution_id,
        "status": execution.status,
        "steps": execution.plan.steps.len(),
    }))
    .into_response())
}

async fn execute_step(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    state.authorize(&headers, &body)?;
    let request: ExecuteStepRequest = parse_body(&body)?;
    let trace = trace_from(&headers);

    let outcome = state
        .machine
        .execute_step(request.execution_id, request.start_step_index, trace)
        .await?;
    let execution = state
        .machine
        .services()
        .repo
        .load(request.execution_id)
        .await
        .map_err(EngineError::from)?;

    Ok(Json(outcome_response(execution.as_ref(), &outcome)).into_response())
}

async fn confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    state.authorize(&headers, &body)?;
    let request: ConfirmRequest = parse_body(&body)?;
    let trace = trace_from(&headers);
    let actor_id = request.metadata.and_then(|m| m.actor_id);

    let outcome = state
        .machine
        .resume_confirmed(request.token, actor_id.as_deref(), trace)
        .await?;

    Ok(Json(json!({
        "success": true,
        "outcome": outcome,
    }))
    .into_response())
}

async fn outbox_relay(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    state.authorize(&headers, &body)?;
    let Some(relay) = &state.relay else {
        return Err(AppError::degraded("outbox relay is not configured"));
    };
    let request: RelayRequest = parse_body(&body)?;

    let newly_delivered = relay.process_delivery(&request).await?;
    Ok(Json(json!({
        "success": true,
        "outbox_id": request.outbox_id,
        "delivered": newly_delivered,
    }))
    .into_response())
}

async fn heartbeat_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    state.authorize(&headers, &body)?;
    let request: HeartbeatCheckRequest = parse_body(&body)?;
    let trace = trace_from(&headers);

    let verdict = state
        .machine
        .services()
        .heartbeats
        .check(request.execution_id, request.expected_next_index, trace)
        .await?;

    Ok(Json(json!({
        "success": true,
        "verdict": verdict,
    }))
    .into_response())
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let execution = state
        .machine
        .services()
        .repo
        .load(id)
        .await
        .map_err(EngineError::from)?
        .ok_or_else(|| AppError::from(EngineError::NotFound(format!("execution {id}"))))?;

    Ok(Json(execution).into_response())
}

async fn list_dlq(
    State(state): State<AppState>,
    Query(query): Query<DlqQuery>,
) -> Result<axum::response::Response, AppError> {
    let entries = state
        .machine
        .services()
        .repo
        .list_dlq(query.limit.min(1000))
        .await
        .map_err(EngineError::from)?;

    Ok(Json(entries).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
