/// Workflow Management Layer
///
/// Workflow definitions, their persistence and the hot-reload registry:
/// - Type definitions (WorkflowDefinition, Step, Trigger, WorkflowRun)
/// - Repository trait with SQLite and in-memory stores
/// - Cron schedule parsing
/// - Lock-free registry of compiled workflows using ArcSwap

pub mod types;

pub mod storage;

pub mod memory;

pub mod cron;

pub mod registry;

pub use memory::MemoryWorkflowStore;
pub use registry::{CompileError, CompiledWorkflow, WorkflowRegistry};
pub use storage::{SqliteWorkflowStore, WorkflowRepository};
pub use types::{
    RunResult, RunStatus, RunUpdate, Step, Trigger, TriggerKind, WorkflowDefinition, WorkflowRun,
    WorkflowStatus, WorkflowSummary,
};
