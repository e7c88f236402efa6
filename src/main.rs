/// Conveyor server entry point
///
/// Serves:
/// - Workflow management API at /api/workflows/*
/// - Queue, scheduler and dead-letter operations at /api/*
/// - Webhook and trigger ingress at /webhook/{workflow_id}/* and /trigger/{kind}/{workflow_id}
/// - Health check at /healthz

use conveyor::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults can be overridden with CONVEYOR_* environment variables
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
