/// Runtime execution engine
///
/// - `executor`: one step through resilience, retry and dead-lettering
/// - `engine`: one run, steps in order, persisted state machine
/// - `queue`: per-tenant fair queue and worker dispatcher
/// - `scheduler` + `lease`: leader-elected cron dispatch
/// - `service`: the facade triggers and the HTTP layer call

pub mod context;
pub mod engine;
pub mod executor;
pub mod lease;
pub mod queue;
pub mod scheduler;
pub mod service;

pub use engine::{RunEngine, RunRequest};
pub use executor::{RunScope, StepExecutor, StepOutput};
pub use lease::{Lease, LockStore, MemoryLockStore, SqliteLockStore};
pub use queue::{QueueConfig, WorkflowQueue};
pub use scheduler::{DistributedScheduler, SchedulerConfig, SchedulerService, SchedulerStatus, TickOutcome};
pub use service::{QueueOutcome, WorkflowService};
