/// Conveyor: workflow execution and scheduling engine
///
/// Runs user-authored workflows (ordered steps calling third-party modules) for many
/// tenants at once: per-step resilience, a fair per-organization queue, leader-elected
/// cron dispatch and a replayable dead-letter store.

// Core configuration and error types
pub mod config;
pub mod error;

// Module catalogue and per-tenant credentials
pub mod modules;
pub mod tenant;

// Circuit breakers, rate limiters, retry and dead letters
pub mod resilience;

// Workflow definitions, run records, storage and the hot-reload registry
pub mod workflow;

// Step executor, run engine, queue, scheduler
pub mod runtime;

// HTTP API layer
pub mod api;

pub mod server;

pub use error::{EngineError, ErrorKind, StepError};
pub use runtime::{QueueOutcome, RunEngine, WorkflowService};
pub use server::start_server;
pub use workflow::{RunResult, WorkflowDefinition, WorkflowRun};
