// ABOUTME: Capability registry: named, schema-described operations with uniform execution.
// ABOUTME: Lookup is by exact name; agent recursion is bounded by the context depth.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use handbox_core::{ExecutionContext, HandboxError, ToolSpec};

/// JSON object used for capability inputs, configs and outputs.
pub type CapabilityMap = Map<String, Value>;

pub const DEFAULT_MAX_DEPTH: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    Llm,
    Embedding,
    Memory,
    Agent,
    Tool,
}

/// JSON schemas describing a capability's input, config and output maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySchema {
    pub input: Value,
    pub config: Value,
    pub output: Value,
}

#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(
        &self,
        input: &CapabilityMap,
        config: &CapabilityMap,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError>;
}

/// Adapts an async closure into a `CapabilityExecutor`.
pub struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> CapabilityExecutor for FnExecutor<F>
where
    F: Fn(CapabilityMap, CapabilityMap, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CapabilityMap, HandboxError>> + Send + 'static,
{
    async fn execute(
        &self,
        input: &CapabilityMap,
        config: &CapabilityMap,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError> {
        (self.0)(input.clone(), config.clone(), ctx.clone()).await
    }
}

pub struct CapabilityDefinition {
    pub name: String,
    pub category: CapabilityCategory,
    pub description: String,
    pub schema: CapabilitySchema,
    pub executor: Arc<dyn CapabilityExecutor>,
}

impl CapabilityDefinition {
    pub fn new(
        name: impl Into<String>,
        category: CapabilityCategory,
        executor: Arc<dyn CapabilityExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            description: String::new(),
            schema: CapabilitySchema::default(),
            executor,
        }
    }

    /// Build a definition around an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, category: CapabilityCategory, f: F) -> Self
    where
        F: Fn(CapabilityMap, CapabilityMap, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CapabilityMap, HandboxError>> + Send + 'static,
    {
        Self::new(name, category, Arc::new(FnExecutor(f)))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, input: Value, config: Value, output: Value) -> Self {
        self.schema = CapabilitySchema {
            input,
            config,
            output,
        };
        self
    }

    /// Describe this capability as a tool a model may call.
    pub fn tool_spec(&self) -> ToolSpec {
        let parameters = if self.schema.input.is_null() {
            json!({"type": "object"})
        } else {
            self.schema.input.clone()
        };
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters,
        }
    }
}

impl std::fmt::Debug for CapabilityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDefinition")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

/// Serializable summary returned by `CapabilityRegistry::invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CapabilityMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct CapabilityRegistry {
    definitions: RwLock<HashMap<String, Arc<CapabilityDefinition>>>,
    max_depth: u32,
}

impl CapabilityRegistry {
    pub fn new(max_depth: u32) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Add a definition. A second registration under the same name replaces
    /// the first and returns it.
    pub fn register(&self, definition: CapabilityDefinition) -> Option<Arc<CapabilityDefinition>> {
        let name = definition.name.clone();
        let replaced = self
            .definitions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.clone(), Arc::new(definition));
        if replaced.is_some() {
            tracing::warn!(capability = %name, "capability re-registered, previous definition replaced");
        } else {
            tracing::debug!(capability = %name, "capability registered");
        }
        replaced
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.definitions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Result<Arc<CapabilityDefinition>, HandboxError> {
        self.definitions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| HandboxError::CapabilityNotFound(name.to_string()))
    }

    /// Sorted names, optionally restricted to one category.
    pub fn names(&self, category: Option<CapabilityCategory>) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|d| category.is_none_or(|c| d.category == c))
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Tool descriptions for the named capabilities, or for all of them
    /// when `names` is empty. Unknown names are skipped.
    pub fn tool_specs(&self, names: &[String]) -> Vec<ToolSpec> {
        let wanted = if names.is_empty() {
            self.names(None)
        } else {
            names.to_vec()
        };
        wanted
            .iter()
            .filter_map(|name| self.get(name).ok())
            .map(|d| d.tool_spec())
            .collect()
    }

    /// Run a capability. Executor errors propagate unchanged.
    pub async fn execute(
        &self,
        name: &str,
        input: &CapabilityMap,
        config: &CapabilityMap,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityMap, HandboxError> {
        if ctx.depth > self.max_depth {
            tracing::warn!(capability = name, depth = ctx.depth, trace_id = %ctx.trace_id, "agent call depth exceeded");
            return Err(HandboxError::RecursionLimit { depth: ctx.depth });
        }
        let definition = self.get(name)?;
        tracing::debug!(capability = name, depth = ctx.depth, trace_id = %ctx.trace_id, "executing capability");
        definition.executor.execute(input, config, ctx).await
    }

    /// Like `execute`, but folds the result into a serializable outcome.
    pub async fn invoke(
        &self,
        name: &str,
        input: &CapabilityMap,
        config: &CapabilityMap,
        ctx: &ExecutionContext,
    ) -> CapabilityOutcome {
        match self.execute(name, input, config, ctx).await {
            Ok(output) => CapabilityOutcome {
                success: true,
                output: Some(output),
                error: None,
            },
            Err(e) => {
                tracing::warn!(capability = name, error = %e, trace_id = %ctx.trace_id, "capability failed");
                CapabilityOutcome {
                    success: false,
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(name: &str) -> CapabilityDefinition {
        CapabilityDefinition::from_fn(name, CapabilityCategory::Tool, |input, _config, _ctx| async move {
            Ok(input)
        })
        .with_description("Echo the input back")
    }

    fn input(pairs: Value) -> CapabilityMap {
        pairs.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn execute_runs_registered_executor() {
        let registry = CapabilityRegistry::default();
        assert!(registry.register(echo("tool.echo")).is_none());

        let out = registry
            .execute(
                "tool.echo",
                &input(json!({"x": 1})),
                &CapabilityMap::new(),
                &ExecutionContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["x"], 1);
    }

    #[tokio::test]
    async fn unknown_capability_is_not_found() {
        let registry = CapabilityRegistry::default();
        let err = registry
            .execute(
                "tool.missing",
                &CapabilityMap::new(),
                &CapabilityMap::new(),
                &ExecutionContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandboxError::CapabilityNotFound(name) if name == "tool.missing"));
    }

    #[test]
    fn reregistration_replaces_and_returns_previous() {
        let registry = CapabilityRegistry::default();
        registry.register(echo("tool.echo"));
        let previous = registry
            .register(echo("tool.echo").with_description("second"))
            .unwrap();
        assert_eq!(previous.description, "Echo the input back");
        assert_eq!(registry.get("tool.echo").unwrap().description, "second");
        assert_eq!(registry.names(None), vec!["tool.echo"]);
    }

    #[tokio::test]
    async fn executor_errors_propagate_unchanged() {
        let registry = CapabilityRegistry::default();
        registry.register(CapabilityDefinition::from_fn(
            "tool.fail",
            CapabilityCategory::Tool,
            |_input, _config, _ctx| async move {
                Err(HandboxError::InvalidInput("bad value".to_string()))
            },
        ));

        let ctx = ExecutionContext::new();
        let err = registry
            .execute("tool.fail", &CapabilityMap::new(), &CapabilityMap::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, HandboxError::InvalidInput(_)));

        let outcome = registry
            .invoke("tool.fail", &CapabilityMap::new(), &CapabilityMap::new(), &ctx)
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("invalid input: bad value"));
    }

    #[tokio::test]
    async fn depth_beyond_limit_is_rejected() {
        let registry = CapabilityRegistry::new(1);
        registry.register(echo("tool.echo"));
        let root = ExecutionContext::new();

        let ok = registry
            .execute("tool.echo", &CapabilityMap::new(), &CapabilityMap::new(), &root.child())
            .await;
        assert!(ok.is_ok());

        let err = registry
            .execute(
                "tool.echo",
                &CapabilityMap::new(),
                &CapabilityMap::new(),
                &root.child().child(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandboxError::RecursionLimit { depth: 2 }));
    }

    #[test]
    fn names_filter_by_category_and_tool_specs_skip_unknown() {
        let registry = CapabilityRegistry::default();
        registry.register(echo("tool.b"));
        registry.register(echo("tool.a"));
        registry.register(CapabilityDefinition::from_fn(
            "memory.noop",
            CapabilityCategory::Memory,
            |_i, _c, _ctx| async move { Ok(CapabilityMap::new()) },
        ));

        assert_eq!(
            registry.names(Some(CapabilityCategory::Tool)),
            vec!["tool.a", "tool.b"]
        );
        let specs = registry.tool_specs(&["tool.a".to_string(), "ghost".to_string()]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].parameters["type"], "object");
        assert_eq!(registry.tool_specs(&[]).len(), 3);
    }
}
