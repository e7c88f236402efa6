//! End-to-end flows over in-memory stores: trigger to queue to dispatcher to engine,
//! step retry timing, and a dead-letter replay.

use conveyor::error::ErrorKind;
use conveyor::modules::{FnModule, ModuleDescriptor, ModuleError, ModuleRegistry};
use conveyor::resilience::{DeadLetterQueue, ResilienceLayer, RetryPolicy};
use conveyor::runtime::queue::{JobHandler, MemoryQueueBackend};
use conveyor::runtime::{QueueConfig, QueueOutcome, RunEngine, RunRequest, StepExecutor, WorkflowQueue, WorkflowService};
use conveyor::tenant::MemoryCredentialStore;
use conveyor::workflow::{
    MemoryWorkflowStore, RunStatus, Step, Trigger, TriggerKind, WorkflowDefinition, WorkflowRepository, WorkflowStatus,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything a test needs, with one module `crm.acme.push` that records its inputs
/// and fails with 503 while `upstream_up` is false
struct Stack {
    store: Arc<MemoryWorkflowStore>,
    engine: Arc<RunEngine>,
    queue: Arc<WorkflowQueue>,
    service: Arc<WorkflowService>,
    dead_letters: DeadLetterQueue,
    upstream_up: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<(Instant, Value)>>>,
}

async fn stack() -> Stack {
    let upstream_up = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (up, log) = (Arc::clone(&upstream_up), Arc::clone(&calls));
    let modules = ModuleRegistry::with_builtins().with(FnModule::new(
        ModuleDescriptor::new("crm.acme.push"),
        move |inputs: Value| {
            log.lock().unwrap().push((Instant::now(), inputs.clone()));
            let up = up.load(Ordering::SeqCst);
            async move {
                if up {
                    Ok(json!({ "pushed": inputs["msg"] }))
                } else {
                    Err(ModuleError::Http { status: 503, message: "maintenance".into() })
                }
            }
        },
    ));

    let credentials = MemoryCredentialStore::new();
    credentials.set(Some("org-1"), "acme", "acme-secret").await;

    let store = Arc::new(MemoryWorkflowStore::new());
    let dead_letters = DeadLetterQueue::in_memory();
    let executor = Arc::new(StepExecutor::new(
        Arc::new(modules),
        Arc::new(ResilienceLayer::default()),
        Arc::new(credentials),
        dead_letters.clone(),
    ));
    let engine = Arc::new(RunEngine::new(store.clone(), executor));
    let queue = Arc::new(WorkflowQueue::new(
        Arc::new(MemoryQueueBackend::new()),
        store.clone(),
        dead_letters.clone(),
        QueueConfig {
            poll_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        },
    ));
    let service = Arc::new(WorkflowService::new(
        store.clone(),
        Arc::clone(&engine),
        Arc::clone(&queue),
        dead_letters.clone(),
    ));
    Stack {
        store,
        engine,
        queue,
        service,
        dead_letters,
        upstream_up,
        calls,
    }
}

/// echo the trigger message, then push it to the CRM
fn push_workflow(retry: Option<RetryPolicy>, dead_letter: bool) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "wf-push".into(),
        name: "Push to CRM".into(),
        version: 1,
        organization_id: Some("org-1".into()),
        owner_id: Some("owner-1".into()),
        steps: vec![
            Step {
                id: "s1".into(),
                module_ref: "utility.core.echo".into(),
                input_template: json!({ "message": "{{trigger.message}}" }),
                output_alias: "echo".into(),
                continue_on_error: false,
                retry: None,
                dead_letter: false,
            },
            Step {
                id: "s2".into(),
                module_ref: "crm.acme.push".into(),
                input_template: json!({ "msg": "{{echo.message}}" }),
                output_alias: "push".into(),
                continue_on_error: false,
                retry,
                dead_letter,
            },
        ],
        trigger: Trigger { kind: TriggerKind::Webhook, config: json!({}) },
        status: WorkflowStatus::Active,
        return_value: Some("{{push.pushed}}".into()),
    }
}

#[tokio::test]
async fn queued_trigger_runs_through_the_dispatcher() {
    let s = stack().await;
    s.store.save_workflow(&push_workflow(None, false)).await.unwrap();

    let shutdown = CancellationToken::new();
    let handler: Arc<dyn JobHandler> = s.engine.clone();
    let dispatcher = tokio::spawn(Arc::clone(&s.queue).run(handler, shutdown.clone()));

    let outcome = s
        .service
        .queue_workflow_execution("wf-push", "user-1", TriggerKind::Webhook, json!({ "message": "hi" }), Some("org-1".into()))
        .await
        .unwrap();
    let QueueOutcome::Queued { run_id, .. } = outcome else {
        panic!("expected a queued dispatch, got {:?}", outcome);
    };

    let mut run = None;
    for _ in 0..500 {
        let current = s.store.get_run(&run_id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            run = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let run = run.expect("run did not finish");
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.output, Some(json!("hi")));
    assert_eq!(run.user_id, "user-1");
    assert_eq!(run.organization_id.as_deref(), Some("org-1"));

    let calls = s.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["apiKey"], json!("acme-secret"));

    shutdown.cancel();
    dispatcher.await.unwrap();

    let stats = s.service.get_workflow_queue_stats(Some("org-1")).await.unwrap();
    assert_eq!(stats.total, 0);
}

#[tokio::test(start_paused = true)]
async fn step_retries_back_off_exponentially() {
    let s = stack().await;
    s.upstream_up.store(false, Ordering::SeqCst);
    s.store
        .save_workflow(&push_workflow(Some(RetryPolicy::new(3, 100, 2.0)), true))
        .await
        .unwrap();

    let result = s
        .engine
        .run(RunRequest::new("wf-push", "user-1", TriggerKind::Manual, json!({ "message": "hi" })))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error_step.as_deref(), Some("s2"));
    assert_eq!(result.error_kind, Some(ErrorKind::TransientUpstream));

    let times: Vec<Instant> = s.calls.lock().unwrap().iter().map(|(at, _)| *at).collect();
    assert_eq!(times.len(), 4);
    let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
    assert_eq!(gaps, vec![100, 200, 400]);

    let items = s.dead_letters.get_dead_letter_queue().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attempts, 4);
    assert_eq!(items[0].workflow_run_id.as_deref(), Some(result.run_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn dead_letter_replays_once_upstream_recovers() {
    let s = stack().await;
    s.upstream_up.store(false, Ordering::SeqCst);
    s.store
        .save_workflow(&push_workflow(Some(RetryPolicy::new(1, 50, 2.0)), true))
        .await
        .unwrap();

    let failed = s
        .service
        .execute_workflow("wf-push", "user-1", TriggerKind::Manual, json!({ "message": "order-7" }))
        .await
        .unwrap();
    assert!(!failed.success);

    let items = s.service.list_dead_letters().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].operation, "crm.acme.push");
    assert_eq!(items[0].payload, json!({ "msg": "order-7" }));

    // still down: the item stays with a bumped attempt count
    let outcome = s.service.retry_dead_letter(&items[0].id).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.item.as_ref().map(|i| i.attempts), Some(items[0].attempts + 1));

    s.upstream_up.store(true, Ordering::SeqCst);
    let outcome = s.service.retry_dead_letter(&items[0].id).await.unwrap();
    assert!(outcome.success);
    assert!(s.service.list_dead_letters().await.unwrap().is_empty());

    let last = s.calls.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.1["msg"], json!("order-7"));
    assert_eq!(last.1["apiKey"], json!("acme-secret"));
}
