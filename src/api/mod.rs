/// HTTP API layer
///
/// - Workflow CRUD with save-time validation (`workflows`)
/// - Synchronous/queued execution, run lookup, queue, scheduler and dead-letter
///   operations (`executions`)
/// - Webhook and generic trigger ingress (`webhooks`)
///
/// Authentication happens upstream; the caller's user id arrives in `x-user-id`.

pub mod executions;
pub mod webhooks;
pub mod workflows;

use axum::{
    http::{HeaderMap, StatusCode},
    response::Json,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::EngineError;
use crate::runtime::{DistributedScheduler, WorkflowService};
use crate::workflow::{WorkflowRegistry, WorkflowRepository};

pub use executions::create_execution_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::create_workflow_routes;

/// Header carrying the authenticated caller
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn WorkflowRepository>,
    pub registry: Arc<WorkflowRegistry>,
    pub service: Arc<WorkflowService>,
    pub scheduler: Arc<DistributedScheduler>,
}

/// Error response: status plus `{ "error": message }`
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

impl From<EngineError> for (StatusCode, Json<Value>) {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::WorkflowNotFound(_) | EngineError::RunNotFound(_) | EngineError::DeadLetterNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::QueueUnavailable(_) | EngineError::LeaseUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Storage(e) => {
                tracing::error!("❌ Storage error while serving request: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, err)
    }
}

/// Repository failure as a 500
pub fn storage_error(err: anyhow::Error) -> ApiError {
    EngineError::Storage(err).into()
}

/// Caller id from the header, else the given fallback
pub fn caller_id(headers: &HeaderMap, fallback: Option<&str>) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .or(fallback)
        .unwrap_or("anonymous")
        .to_string()
}

/// Request body as JSON; an empty body is `{}`
pub fn json_body(bytes: &[u8]) -> Result<Value, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes).map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {}", e)))
}

/// All API routes bound to `state`
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .merge(create_workflow_routes())
        .merge(create_execution_routes())
        .merge(create_webhook_routes())
        .with_state(state)
}
