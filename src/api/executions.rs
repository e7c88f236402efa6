/// Execution, queue, scheduler and dead-letter endpoints

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{api_error, caller_id, json_body, storage_error, ApiError, AppState};
use crate::error::EngineError;
use crate::resilience::dead_letter::ReplayOutcome;
use crate::runtime::queue::{CapacityStatus, QueueStats};
use crate::runtime::{QueueOutcome, SchedulerStatus};
use crate::workflow::types::{RunResult, TriggerKind, WorkflowDefinition, WorkflowRun};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub organization_id: Option<String>,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/execute", post(execute_workflow))
        .route("/api/workflows/{id}/enqueue", post(enqueue_workflow))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/queue/capacity", get(queue_capacity))
        .route("/api/scheduler/status", get(scheduler_status))
        .route("/api/dead-letters", get(list_dead_letters))
        .route("/api/dead-letters/{id}", delete(remove_dead_letter))
        .route("/api/dead-letters/{id}/retry", post(retry_dead_letter))
}

async fn load_definition(state: &AppState, id: &str) -> Result<WorkflowDefinition, ApiError> {
    state
        .repository
        .load_workflow(id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()).into())
}

/// POST /api/workflows/{id}/execute
///
/// Runs synchronously and returns the run result; failed runs answer 422 with the
/// same body.
async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<RunResult>), ApiError> {
    let payload = json_body(&body)?;
    let definition = load_definition(&state, &id).await?;
    let user_id = caller_id(&headers, definition.owner_id.as_deref());

    tracing::info!("🚀 Executing workflow {} for {}", id, user_id);
    let result = state
        .service
        .execute_workflow(&id, &user_id, TriggerKind::Manual, payload)
        .await?;

    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(result)))
}

/// POST /api/workflows/{id}/enqueue
///
/// 202 when queued; 200 when the queue was down and the run executed inline.
async fn enqueue_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<QueueOutcome>), ApiError> {
    let payload = json_body(&body)?;
    let definition = load_definition(&state, &id).await?;
    let user_id = caller_id(&headers, definition.owner_id.as_deref());

    let outcome = state
        .service
        .queue_workflow_execution(&id, &user_id, TriggerKind::Manual, payload, definition.organization_id)
        .await?;
    let status = match outcome {
        QueueOutcome::Queued { .. } => StatusCode::ACCEPTED,
        QueueOutcome::ExecutedInline(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// GET /api/runs/{id}
async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<WorkflowRun>, ApiError> {
    match state.repository.get_run(&id).await.map_err(storage_error)? {
        Some(run) => Ok(Json(run)),
        None => Err(EngineError::RunNotFound(id).into()),
    }
}

/// GET /api/queue/stats?organizationId=...
async fn queue_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<QueueStats>, ApiError> {
    let stats = state
        .service
        .get_workflow_queue_stats(query.organization_id.as_deref())
        .await?;
    Ok(Json(stats))
}

async fn queue_capacity(State(state): State<AppState>) -> Json<CapacityStatus> {
    Json(state.service.capacity_status().await)
}

async fn scheduler_status(State(state): State<AppState>) -> Result<Json<SchedulerStatus>, ApiError> {
    Ok(Json(state.scheduler.status().await?))
}

async fn list_dead_letters(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let items = state.service.list_dead_letters().await?;
    Ok(Json(json!({ "count": items.len(), "items": items })))
}

/// POST /api/dead-letters/{id}/retry
///
/// The item is removed only when the replay succeeds.
async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReplayOutcome>, ApiError> {
    let outcome = state.service.retry_dead_letter(&id).await?;
    if outcome.success {
        tracing::info!("♻️ Dead letter {} replayed", id);
    } else {
        tracing::warn!("⚠️ Dead letter {} replay failed, item kept", id);
    }
    Ok(Json(outcome))
}

async fn remove_dead_letter(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    if !state.service.remove_dead_letter(&id).await? {
        return Err(api_error(StatusCode::NOT_FOUND, format!("dead-letter item not found: {}", id)));
    }
    Ok(Json(json!({ "message": "Dead letter removed" })))
}
