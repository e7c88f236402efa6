/// Workflow management REST API endpoints
///
/// Definitions are compiled before they are stored: unknown module references, bad
/// aliases and invalid cron schedules are rejected with 422 and never reach storage.
/// Accepted definitions are hot-swapped into the registry.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::{api_error, storage_error, ApiError, AppState};
use crate::workflow::types::{WorkflowDefinition, WorkflowRun};

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub version: u32,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: WorkflowDefinition,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<u32>,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/runs", get(list_runs))
}

/// Compile, persist and hot-swap a definition
async fn store_definition(state: &AppState, workflow: WorkflowDefinition) -> Result<WorkflowDefinition, ApiError> {
    if workflow.id.is_empty() || workflow.name.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "workflow id and name are required"));
    }

    let compiled = state
        .registry
        .compile(workflow)
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e))?;

    state
        .repository
        .save_workflow(&compiled.definition)
        .await
        .map_err(storage_error)?;

    let definition = (*compiled.definition).clone();
    state.registry.upsert(compiled);
    Ok(definition)
}

/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "steps": [...], "trigger": {...} } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowResponse>), ApiError> {
    let workflow = payload.workflow;

    if state.repository.load_workflow(&workflow.id).await.map_err(storage_error)?.is_some() {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("workflow '{}' already exists", workflow.id),
        ));
    }

    let saved = store_definition(&state, workflow).await?;
    tracing::info!("🆕 Created workflow: {} ({})", saved.id, saved.name);

    Ok((
        StatusCode::CREATED,
        Json(WorkflowResponse {
            id: saved.id.clone(),
            version: saved.version,
            message: format!("Workflow '{}' created successfully", saved.name),
        }),
    ))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let workflows = state.repository.list_workflows().await.map_err(storage_error)?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    match state.repository.load_workflow(&id).await.map_err(storage_error)? {
        Some(workflow) => Ok(Json(workflow)),
        None => Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id))),
    }
}

/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let mut workflow = payload.workflow;
    workflow.id = id.clone();

    if state.repository.load_workflow(&id).await.map_err(storage_error)?.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id)));
    }

    let saved = store_definition(&state, workflow).await?;
    tracing::info!("🔥 Updated workflow: {} (version {})", saved.id, saved.version);

    Ok(Json(WorkflowResponse {
        id: saved.id.clone(),
        version: saved.version,
        message: format!("Workflow '{}' updated successfully", saved.name),
    }))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    if !state.repository.delete_workflow(&id).await.map_err(storage_error)? {
        return Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id)));
    }
    state.registry.remove(&id);
    tracing::info!("🗑️ Deleted workflow: {}", id);
    Ok(Json(json!({ "message": "Workflow deleted successfully" })))
}

/// GET /api/workflows/{id}/runs?limit=N
async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<WorkflowRun>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(state.repository.list_runs(&id, limit).await.map_err(storage_error)?))
}
