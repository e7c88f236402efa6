/// Trigger ingress endpoints
///
/// Webhooks and other event sources dispatch through the queue; the caller gets the
/// job and run ids back immediately and polls `/api/runs/{id}` for the outcome.
/// Workflows are looked up in the hot-reload registry, so a definition saved a moment
/// ago is reachable without a restart.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{any, post},
    Router,
};

use crate::api::{api_error, caller_id, json_body, ApiError, AppState};
use crate::runtime::QueueOutcome;
use crate::workflow::registry::CompiledWorkflow;
use crate::workflow::types::{TriggerKind, WorkflowStatus};

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new()
        // Format: /webhook/{workflow_id}/{webhook_path}
        .route("/webhook/{workflow_id}/{*path}", any(receive_webhook))
        .route("/trigger/{kind}/{workflow_id}", post(receive_trigger))
}

/// Active workflow from the registry, or 404
fn active_workflow(state: &AppState, workflow_id: &str) -> Result<CompiledWorkflow, ApiError> {
    let Some(compiled) = state.registry.get(workflow_id) else {
        tracing::warn!("❌ Trigger for unknown workflow: {}", workflow_id);
        return Err(api_error(StatusCode::NOT_FOUND, format!("workflow not found: {}", workflow_id)));
    };
    if compiled.definition.status != WorkflowStatus::Active {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("workflow {} is not active", workflow_id),
        ));
    }
    Ok(compiled)
}

async fn dispatch(
    state: &AppState,
    compiled: &CompiledWorkflow,
    headers: &HeaderMap,
    kind: TriggerKind,
    payload: serde_json::Value,
) -> Result<(StatusCode, Json<QueueOutcome>), ApiError> {
    let definition = &compiled.definition;
    let user_id = caller_id(headers, definition.owner_id.as_deref());
    let outcome = state
        .service
        .queue_workflow_execution(&definition.id, &user_id, kind, payload, definition.organization_id.clone())
        .await?;
    let status = match outcome {
        QueueOutcome::Queued { .. } => StatusCode::ACCEPTED,
        QueueOutcome::ExecutedInline(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// ANY /webhook/{workflow_id}/{path}
///
/// The body becomes the trigger payload; an empty body is `{}`.
async fn receive_webhook(
    State(state): State<AppState>,
    Path((workflow_id, webhook_path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<QueueOutcome>), ApiError> {
    tracing::info!("📥 Webhook request received: {}/{}", workflow_id, webhook_path);

    let payload = json_body(&body).inspect_err(|_| {
        tracing::warn!("❌ Invalid JSON payload for webhook: {}/{}", workflow_id, webhook_path);
    })?;

    let compiled = active_workflow(&state, &workflow_id)?;
    if compiled.definition.trigger.kind != TriggerKind::Webhook {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("workflow {} has no webhook trigger", workflow_id),
        ));
    }

    let requested = format!("/{}", webhook_path.trim_start_matches('/'));
    if let Some(declared) = compiled.definition.webhook_path() {
        if declared != requested {
            tracing::warn!("❌ Webhook path {} does not match declared {}", requested, declared);
            return Err(api_error(StatusCode::NOT_FOUND, format!("no webhook at {}", requested)));
        }
    }

    dispatch(&state, &compiled, &headers, TriggerKind::Webhook, payload).await
}

/// POST /trigger/{kind}/{workflow_id}
///
/// Generic ingress for chat and messaging integrations; the kind must match the
/// workflow's declared trigger.
async fn receive_trigger(
    State(state): State<AppState>,
    Path((kind, workflow_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<QueueOutcome>), ApiError> {
    let kind: TriggerKind = kind
        .parse()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let payload = json_body(&body)?;

    let compiled = active_workflow(&state, &workflow_id)?;
    if compiled.definition.trigger.kind != kind {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!(
                "workflow {} is triggered by {}, not {}",
                workflow_id, compiled.definition.trigger.kind, kind
            ),
        ));
    }

    tracing::info!("📨 {} trigger received for {}", kind, workflow_id);
    dispatch(&state, &compiled, &headers, kind, payload).await
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{send, test_app, TestApp};
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    async fn create(app: &TestApp, trigger: Value, status: &str) {
        let (code, _) = send(
            &app.router,
            "POST",
            "/api/workflows",
            Some(json!({
                "workflow": {
                    "id": "wf-hook",
                    "name": "Hook",
                    "organizationId": "org-3",
                    "steps": [
                        { "id": "s1", "moduleRef": "utility.core.echo", "inputTemplate": { "order": "{{trigger.order}}" }, "outputAlias": "echo" }
                    ],
                    "trigger": trigger,
                    "status": status
                }
            })),
        )
        .await;
        assert_eq!(code, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn webhook_enqueues_for_the_workflow_organization() {
        let app = test_app();
        create(&app, json!({ "kind": "webhook", "config": { "path": "orders" } }), "active").await;

        let (status, body) = send(&app.router, "POST", "/webhook/wf-hook/orders", Some(json!({ "order": 42 }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["mode"], json!("queued"));

        let (_, stats) = send(&app.router, "GET", "/api/queue/stats?organizationId=org-3", None).await;
        assert_eq!(stats["waiting"], json!(1));

        let (_, run) = send(&app.router, "GET", &format!("/api/runs/{}", body["runId"].as_str().unwrap()), None).await;
        assert_eq!(run["triggerKind"], json!("webhook"));
        assert_eq!(run["triggerPayload"], json!({ "order": 42 }));
    }

    #[tokio::test]
    async fn webhook_rejects_wrong_path_and_inactive_workflows() {
        let app = test_app();
        create(&app, json!({ "kind": "webhook", "config": { "path": "/orders" } }), "draft").await;

        let (status, _) = send(&app.router, "POST", "/webhook/wf-hook/orders", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app.router, "POST", "/webhook/unknown/orders", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_path_must_match_declaration() {
        let app = test_app();
        create(&app, json!({ "kind": "webhook", "config": { "path": "/orders" } }), "active").await;

        let (status, _) = send(&app.router, "POST", "/webhook/wf-hook/refunds", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn generic_trigger_checks_kind() {
        let app = test_app();
        create(&app, json!({ "kind": "chat" }), "active").await;

        let (status, _) = send(&app.router, "POST", "/trigger/bogus/wf-hook", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app.router, "POST", "/trigger/messaging-platform/wf-hook", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app.router, "POST", "/trigger/chat/wf-hook", Some(json!({ "text": "hi" }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["jobId"].is_string());
    }
}
