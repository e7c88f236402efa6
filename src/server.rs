/// Server setup and initialization
///
/// Wires together storage, the workflow registry, the step executor and run engine,
/// the tenant queue and its dispatcher, the leader-elected scheduler, and the HTTP
/// routes.

use crate::{
    api::{create_api_router, AppState},
    config::Config,
    modules::ModuleRegistry,
    resilience::{dead_letter::SqliteDeadLetterStore, DeadLetterQueue, ResilienceConfig, ResilienceLayer},
    runtime::{
        queue::{JobHandler, SqliteQueueBackend},
        DistributedScheduler, RunEngine, SchedulerService, SqliteLockStore, StepExecutor, WorkflowQueue,
        WorkflowService,
    },
    tenant::SqliteCredentialStore,
    workflow::{SqliteWorkflowStore, WorkflowRegistry},
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// A wired application: the router plus the background services it relies on
pub struct App {
    pub router: Router,
    pub scheduler: Arc<SchedulerService>,
    pub shutdown: CancellationToken,
    pub dispatcher: JoinHandle<()>,
}

/// Open (creating if needed) the SQLite database behind `url`
async fn open_pool(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| anyhow::anyhow!("Invalid database URL '{}': {}", url, e))?
        .create_if_missing(true);

    if let Some(dir) = options.get_filename().parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", dir.display(), e))?;
    }

    tracing::info!("🗄️ Opening database: {}", options.get_filename().display());
    // each in-memory connection would otherwise see its own empty database
    let max_connections = if url.contains(":memory:") { 1 } else { 8 };
    Ok(SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?)
}

/// Create the application with all routes and background services
pub async fn create_app(config: Config) -> Result<App> {
    let pool = open_pool(&config.database.url).await?;

    tracing::info!("📋 Initializing storage schemas");
    let workflow_store = Arc::new(SqliteWorkflowStore::new(pool.clone()));
    workflow_store.init_schema().await?;
    let queue_backend = Arc::new(SqliteQueueBackend::new(pool.clone()));
    queue_backend.init_schema().await?;
    let lock_store = Arc::new(SqliteLockStore::new(pool.clone()));
    lock_store.init_schema().await?;
    let dead_letter_store = Arc::new(SqliteDeadLetterStore::new(pool.clone()));
    dead_letter_store.init_schema().await?;
    let credentials = Arc::new(SqliteCredentialStore::new(pool));
    credentials.init_schema().await?;

    let modules = Arc::new(ModuleRegistry::with_builtins());
    tracing::info!("🧩 {} modules registered", modules.len());

    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&modules)));
    registry
        .init_from_storage(workflow_store.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    let dead_letters = DeadLetterQueue::new(dead_letter_store);
    let executor = Arc::new(StepExecutor::new(
        modules,
        Arc::new(ResilienceLayer::new(ResilienceConfig::default())),
        credentials,
        dead_letters.clone(),
    ));
    let engine = Arc::new(RunEngine::new(workflow_store.clone(), executor));

    let queue = Arc::new(WorkflowQueue::new(
        queue_backend,
        workflow_store.clone(),
        dead_letters.clone(),
        config.queue_config(),
    ));
    let service = Arc::new(WorkflowService::new(
        workflow_store.clone(),
        Arc::clone(&engine),
        Arc::clone(&queue),
        dead_letters,
    ));

    let shutdown = CancellationToken::new();
    tracing::info!("🚚 Starting queue dispatcher");
    let handler: Arc<dyn JobHandler> = engine;
    let dispatcher = tokio::spawn(Arc::clone(&queue).run(handler, shutdown.clone()));

    let cron = Arc::new(DistributedScheduler::new(
        config.scheduler_config(),
        lock_store,
        workflow_store.clone(),
        Arc::clone(&registry),
        Arc::clone(&service),
    ));
    let scheduler = Arc::new(SchedulerService::new(Arc::clone(&cron)).await?);
    tracing::info!("⏰ Starting scheduler instance {}", cron.instance_id());
    scheduler.start().await?;

    let state = AppState {
        repository: workflow_store,
        registry,
        service,
        scheduler: cron,
    };

    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_router(state))
        .layer(TraceLayer::new_for_http());

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        router,
        scheduler,
        shutdown,
        dispatcher,
    })
}

/// Start the HTTP server and run until ctrl-c
///
/// Shutdown stops accepting requests, releases the scheduler lease and lets the
/// dispatcher drain in-flight jobs.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Conveyor server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("🛑 Shutdown signal received");
        })
        .await?;

    if let Err(e) = app.scheduler.stop().await {
        tracing::warn!("⚠️ Scheduler did not stop cleanly: {}", e);
    }
    app.shutdown.cancel();
    if let Err(e) = app.dispatcher.await {
        tracing::warn!("⚠️ Queue dispatcher ended abnormally: {}", e);
    }

    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::send;
    use axum::http::StatusCode;

    #[tokio::test(flavor = "multi_thread")]
    async fn app_boots_against_a_fresh_database() {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".into();
        config.scheduler.instance_id = "boot-test".into();

        let app = create_app(config).await.unwrap();

        let (status, body) = send(&app.router, "GET", "/api/scheduler/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instanceId"], serde_json::json!("boot-test"));

        let (status, _) = send(&app.router, "GET", "/api/workflows", None).await;
        assert_eq!(status, StatusCode::OK);

        app.scheduler.stop().await.unwrap();
        app.shutdown.cancel();
        app.dispatcher.await.unwrap();
    }
}
