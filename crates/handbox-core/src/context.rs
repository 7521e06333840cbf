// ABOUTME: Request-scoped ExecutionContext passed immutably down every strategy and capability call.
// ABOUTME: Carries the trace id, per-category default provider ids, and the agent call depth.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::provider::ProviderCategory;

/// Ambient values for one request. Never mutated mid-request: derived
/// contexts are produced with `child()` and the `with_*` builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub trace_id: Ulid,
    pub default_providers: HashMap<ProviderCategory, String>,
    /// Number of nested agent capability calls above this one.
    pub depth: u32,
}

impl ExecutionContext {
    /// Create a root context with a fresh trace id and no provider defaults.
    pub fn new() -> Self {
        Self {
            trace_id: Ulid::new(),
            default_providers: HashMap::new(),
            depth: 0,
        }
    }

    /// Set the default provider id for a category.
    pub fn with_default_provider(
        mut self,
        category: ProviderCategory,
        provider_id: impl Into<String>,
    ) -> Self {
        self.default_providers.insert(category, provider_id.into());
        self
    }

    pub fn default_provider(&self, category: ProviderCategory) -> Option<&str> {
        self.default_providers.get(&category).map(String::as_str)
    }

    /// Context for a nested call: same trace and defaults, one level deeper.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            default_providers: self.default_providers.clone(),
            depth: self.depth + 1,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
