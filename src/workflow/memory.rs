/// In-memory workflow repository
///
/// Single-process stand-in for `SqliteWorkflowStore`, used by tests and by embedders
/// that do not need durability.

use crate::workflow::storage::WorkflowRepository;
use crate::workflow::types::{
    RunUpdate, TriggerKind, WorkflowDefinition, WorkflowRun, WorkflowStatus, WorkflowSummary,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<String, (WorkflowDefinition, DateTime<Utc>)>>,
    runs: RwLock<HashMap<String, WorkflowRun>>,
    cron_state: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored run, oldest first (test helper)
    pub async fn all_runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runs
    }
}

#[async_trait]
impl WorkflowRepository for MemoryWorkflowStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), (workflow.clone(), Utc::now()));
        Ok(())
    }

    async fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.get(id).map(|(w, _)| w.clone()))
    }

    async fn load_all_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self.workflows.read().await.values().map(|(w, _)| w.clone()).collect())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let workflows = self.workflows.read().await;
        let mut summaries: Vec<(DateTime<Utc>, WorkflowSummary)> = workflows
            .values()
            .map(|(w, updated_at)| {
                (
                    *updated_at,
                    WorkflowSummary {
                        id: w.id.clone(),
                        name: w.name.clone(),
                        version: w.version,
                        organization_id: w.organization_id.clone(),
                        trigger_kind: w.trigger.kind,
                        status: w.status,
                        updated_at: updated_at.to_rfc3339(),
                    },
                )
            })
            .collect();
        summaries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(summaries.into_iter().map(|(_, s)| s).collect())
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        self.cron_state.write().await.remove(id);
        Ok(self.workflows.write().await.remove(id).is_some())
    }

    async fn list_cron_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self
            .workflows
            .read()
            .await
            .values()
            .filter(|(w, _)| w.trigger.kind == TriggerKind::Cron && w.status == WorkflowStatus::Active)
            .map(|(w, _)| w.clone())
            .collect())
    }

    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<bool> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(run) if run.completed_at.is_none() => {
                run.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self, workflow_id: &str, limit: u32) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn next_fire_at(&self, workflow_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.cron_state.read().await.get(workflow_id).copied())
    }

    async fn advance_next_fire(
        &self,
        workflow_id: &str,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.cron_state.write().await;
        if state.get(workflow_id).copied() != expected {
            return Ok(false);
        }
        state.insert(workflow_id.to_string(), next);
        Ok(true)
    }
}
