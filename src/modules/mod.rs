/// Module Registry
///
/// Closed map from `category.module.function` references to module implementations.
/// Built once at startup and read-only afterwards; workflows are validated against it
/// when they are saved so unknown references never reach the executor.

pub mod builtin;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::workflow::types::WorkflowDefinition;

/// Raw failure reported by a module, before classification
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModuleError {
    #[error("upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("upstream rate limited the call")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

/// What the executor needs to know about a module without calling it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    /// Full reference, e.g. "crm.hubspot.createContact"
    pub reference: String,
    /// Platform key used for rate limiting and credential lookup
    pub platform: String,
    /// Inputs that must resolve to a non-null value
    pub required_inputs: Vec<String>,
    /// Input field the platform credential is injected into
    pub credential_field: String,
}

impl ModuleDescriptor {
    /// Descriptor whose platform is the middle segment of the reference
    pub fn new(reference: &str) -> Self {
        let platform = ModuleRef::parse(reference)
            .map(|r| r.module)
            .unwrap_or_else(|| reference.to_string());
        Self {
            reference: reference.to_string(),
            platform,
            required_inputs: Vec::new(),
            credential_field: "apiKey".to_string(),
        }
    }

    pub fn platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }

    pub fn required(mut self, inputs: &[&str]) -> Self {
        self.required_inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn credential_field(mut self, field: &str) -> Self {
        self.credential_field = field.to_string();
        self
    }
}

/// Parsed `category.module.function` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub category: String,
    pub module: String,
    pub function: String,
}

impl ModuleRef {
    pub fn parse(reference: &str) -> Option<Self> {
        let mut parts = reference.split('.');
        let (category, module, function) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || [category, module, function].iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self {
            category: category.to_string(),
            module: module.to_string(),
            function: function.to_string(),
        })
    }
}

/// A callable integration
#[async_trait]
pub trait Module: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError>;
}

type BoxedInvoke =
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, ModuleError>> + Send>> + Send + Sync;

/// Module backed by an async closure
pub struct FnModule {
    descriptor: ModuleDescriptor,
    handler: Box<BoxedInvoke>,
}

impl FnModule {
    pub fn new<F, Fut>(descriptor: ModuleDescriptor, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ModuleError>> + Send + 'static,
    {
        Self {
            descriptor,
            handler: Box::new(move |inputs| Box::pin(handler(inputs))),
        }
    }
}

#[async_trait]
impl Module for FnModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError> {
        (self.handler)(inputs).await
    }
}

/// Read-only lookup from module reference to implementation
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in utility modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, module: Arc<dyn Module>) {
        let reference = module.descriptor().reference.clone();
        tracing::debug!("🧩 Registered module: {}", reference);
        self.modules.insert(reference, module);
    }

    /// Builder-style registration, used when assembling the registry at startup
    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.register(Arc::new(module));
        self
    }

    pub fn resolve(&self, reference: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(reference).cloned()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.modules.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Sorted list of registered references
    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.modules.keys().cloned().collect();
        refs.sort();
        refs
    }

    /// Step module references in `workflow` that are not registered
    pub fn unknown_references(&self, workflow: &WorkflowDefinition) -> Vec<String> {
        workflow
            .steps
            .iter()
            .filter(|step| !self.contains(&step.module_ref))
            .map(|step| step.module_ref.clone())
            .collect()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.references())
            .finish()
    }
}
