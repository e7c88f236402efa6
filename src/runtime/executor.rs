/// Step executor
///
/// Runs one declared step: resolve its input template against the run context, inject
/// the platform credential, invoke the module through the resilience layer under the
/// step's retry policy, and dead-letter the invocation if it asked for that and the
/// retry budget ran out. Run state is not persisted here.

use serde_json::Value;
use std::sync::Arc;

use crate::error::StepError;
use crate::modules::{ModuleDescriptor, ModuleRegistry};
use crate::resilience::{retry_with_backoff, DeadLetterContext, DeadLetterQueue, ResilienceLayer, RetryPolicy};
use crate::runtime::context::{resolve_template, RunContext};
use crate::tenant::CredentialStore;
use crate::workflow::types::Step;

/// Identity of the run a step belongs to
#[derive(Debug, Clone, Default)]
pub struct RunScope {
    pub workflow_id: String,
    pub run_id: String,
    pub organization_id: Option<String>,
}

/// Successful step result, stored in the context under `alias`
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub alias: String,
    pub value: Value,
}

pub struct StepExecutor {
    modules: Arc<ModuleRegistry>,
    resilience: Arc<ResilienceLayer>,
    credentials: Arc<dyn CredentialStore>,
    dead_letters: DeadLetterQueue,
}

impl StepExecutor {
    pub fn new(
        modules: Arc<ModuleRegistry>,
        resilience: Arc<ResilienceLayer>,
        credentials: Arc<dyn CredentialStore>,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        Self {
            modules,
            resilience,
            credentials,
            dead_letters,
        }
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    pub async fn execute_step(
        &self,
        step: &Step,
        context: &RunContext,
        scope: &RunScope,
    ) -> Result<StepOutput, StepError> {
        let module = self
            .modules
            .resolve(&step.module_ref)
            .ok_or_else(|| StepError::module_not_found(&step.module_ref))?;
        let descriptor = module.descriptor().clone();

        let resolved = resolve_template(&step.input_template, context);
        let inputs = self.inject_credential(resolved.clone(), &descriptor.credential_field, &descriptor.platform, scope).await;

        check_required(&descriptor, &inputs).map_err(|name| {
            StepError::validation(format!("step '{}': required input '{}' is missing", step.id, name))
        })?;

        tracing::debug!("⚙️ Executing step {} ({})", step.id, step.module_ref);
        let policy = step.retry.clone().unwrap_or_else(RetryPolicy::none);
        let resilience = &self.resilience;
        let result = retry_with_backoff(
            &policy,
            |_attempt| {
                let module = Arc::clone(&module);
                let inputs = inputs.clone();
                let operation = step.module_ref.as_str();
                let platform = descriptor.platform.as_str();
                async move { resilience.call(operation, platform, || module.invoke(inputs)).await }
            },
            StepError::is_retryable,
        )
        .await;

        match result {
            Ok(value) => Ok(StepOutput {
                alias: step.output_alias.clone(),
                value,
            }),
            Err(exhausted) => {
                if step.dead_letter && exhausted.error.is_retryable() {
                    let context = DeadLetterContext {
                        workflow_id: Some(scope.workflow_id.clone()),
                        workflow_run_id: Some(scope.run_id.clone()),
                        attempts: exhausted.attempts,
                    };
                    // The payload is the template output before credential injection
                    if let Err(e) = self
                        .dead_letters
                        .add_to_dead_letter_queue(&step.module_ref, resolved, &exhausted.error.to_string(), context)
                        .await
                    {
                        tracing::error!("❌ Failed to dead-letter step {}: {}", step.id, e);
                    }
                }
                Err(exhausted.error)
            }
        }
    }

    /// Single invocation with already-resolved inputs, used to replay dead letters
    pub async fn invoke_resolved(&self, module_ref: &str, inputs: Value, scope: &RunScope) -> Result<Value, StepError> {
        let module = self
            .modules
            .resolve(module_ref)
            .ok_or_else(|| StepError::module_not_found(module_ref))?;
        let descriptor = module.descriptor().clone();
        let inputs = self
            .inject_credential(inputs, &descriptor.credential_field, &descriptor.platform, scope)
            .await;
        check_required(&descriptor, &inputs).map_err(|name| {
            StepError::validation(format!("{}: required input '{}' is missing", module_ref, name))
        })?;

        self.resilience
            .call(module_ref, &descriptor.platform, || module.invoke(inputs))
            .await
    }

    async fn inject_credential(&self, mut inputs: Value, field: &str, platform: &str, scope: &RunScope) -> Value {
        let Value::Object(map) = &mut inputs else {
            return inputs;
        };
        if map.get(field).is_some_and(|v| !v.is_null()) {
            return inputs;
        }

        match self
            .credentials
            .get_decrypted_credential(scope.organization_id.as_deref(), platform)
            .await
        {
            Ok(Some(secret)) => {
                map.insert(field.to_string(), Value::String(secret));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("⚠️ Credential lookup failed for platform {}: {}", platform, e),
        }
        inputs
    }
}

/// First required input that is absent or null
fn check_required<'a>(descriptor: &'a ModuleDescriptor, inputs: &Value) -> Result<(), &'a str> {
    match descriptor
        .required_inputs
        .iter()
        .find(|name| inputs.get(name.as_str()).map_or(true, Value::is_null))
    {
        Some(name) => Err(name.as_str()),
        None => Ok(()),
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor").field("modules", &self.modules).finish_non_exhaustive()
    }
}
