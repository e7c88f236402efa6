/// Hot-reload workflow registry using ArcSwap
///
/// Holds the compiled form of every stored workflow: the definition plus its parsed
/// cron schedule. Saves swap the whole map atomically so runs and scheduler ticks in
/// flight keep reading a consistent snapshot.

use crate::modules::ModuleRegistry;
use crate::workflow::cron::CronSchedule;
use crate::workflow::storage::WorkflowRepository;
use crate::workflow::types::{TriggerKind, WorkflowDefinition};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Reasons a definition is refused at save time
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("unknown module references: {}", .0.join(", "))]
    UnknownModules(Vec<String>),

    #[error("cron trigger requires a 'schedule' string")]
    MissingSchedule,

    #[error(transparent)]
    InvalidSchedule(#[from] crate::workflow::cron::ScheduleError),

    #[error("duplicate output alias '{0}'")]
    DuplicateAlias(String),

    #[error("output alias '{0}' is reserved")]
    ReservedAlias(String),
}

/// Workflow definition with its parsed trigger metadata
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub definition: Arc<WorkflowDefinition>,
    /// Parsed schedule for cron-triggered workflows
    pub schedule: Option<CronSchedule>,
}

/// Lock-free registry of compiled workflows
#[derive(Debug)]
pub struct WorkflowRegistry {
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    modules: Arc<ModuleRegistry>,
}

impl WorkflowRegistry {
    pub fn new(modules: Arc<ModuleRegistry>) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            modules,
        }
    }

    /// Validate a definition against the module registry and trigger rules
    pub fn compile(&self, definition: WorkflowDefinition) -> Result<CompiledWorkflow, CompileError> {
        let unknown = self.modules.unknown_references(&definition);
        if !unknown.is_empty() {
            return Err(CompileError::UnknownModules(unknown));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &definition.steps {
            if step.output_alias == "trigger" || step.output_alias.starts_with('$') {
                return Err(CompileError::ReservedAlias(step.output_alias.clone()));
            }
            if !seen.insert(step.output_alias.as_str()) {
                return Err(CompileError::DuplicateAlias(step.output_alias.clone()));
            }
        }

        let schedule = if definition.trigger.kind == TriggerKind::Cron {
            let raw = definition.cron_schedule().ok_or(CompileError::MissingSchedule)?;
            Some(CronSchedule::parse(raw)?)
        } else {
            None
        };

        Ok(CompiledWorkflow {
            definition: Arc::new(definition),
            schedule,
        })
    }

    /// Load every stored workflow; definitions that no longer compile are skipped
    pub async fn init_from_storage(&self, storage: &dyn WorkflowRepository) -> anyhow::Result<()> {
        let mut compiled = HashMap::new();
        for definition in storage.load_all_workflows().await? {
            let id = definition.id.clone();
            match self.compile(definition) {
                Ok(workflow) => {
                    compiled.insert(id, workflow);
                }
                Err(e) => tracing::warn!("⚠️ Skipping workflow {} at startup: {}", id, e),
            }
        }

        self.workflows.store(Arc::new(compiled));
        tracing::info!("📚 Initialized workflow registry with {} workflows", self.workflows.load().len());
        Ok(())
    }

    /// Insert or replace one compiled workflow
    pub fn upsert(&self, workflow: CompiledWorkflow) {
        let id = workflow.definition.id.clone();
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(id.clone(), workflow.clone());
            next
        });
        tracing::info!("🔥 Hot-reloaded workflow: {}", id);
    }

    pub fn remove(&self, workflow_id: &str) {
        let mut removed = false;
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(workflow_id).is_some();
            next
        });
        if removed {
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
    }

    /// Compiled form of a stored definition, reusing the cached entry for the same version
    pub fn compiled_for(&self, definition: WorkflowDefinition) -> Result<CompiledWorkflow, CompileError> {
        if let Some(cached) = self.get(&definition.id) {
            if cached.definition.version == definition.version {
                return Ok(cached);
            }
        }
        let compiled = self.compile(definition)?;
        self.upsert(compiled.clone());
        Ok(compiled)
    }

    pub fn get(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workflows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.load().is_empty()
    }
}
