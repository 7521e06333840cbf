// ABOUTME: The provider contract every backend adapter implements: connect, invoke, and embed.
// ABOUTME: Also defines the request/response shapes and the category/connection-state enums.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

/// The kind of backend a provider represents. At most one provider per
/// category is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCategory {
    Generative,
    Embedding,
    Cloud,
}

impl ProviderCategory {
    /// Return a human-readable label for this category.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderCategory::Generative => "generative",
            ProviderCategory::Embedding => "embedding",
            ProviderCategory::Cloud => "cloud",
        }
    }
}

impl fmt::Display for ProviderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle of a provider's connection to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Opaque credential bag handed to `connect`. Keys are provider specific
/// (`api_key`, `endpoint`, `access_key_id`, ...).
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common single-API-key case.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::new().with("api_key", key)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Look up a credential value; empty strings count as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

// Never print secret values.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("Credentials").field("keys", &keys).finish()
    }
}

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A base64 image attached to a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInput {
    pub media_type: String,
    pub data: String,
}

/// A single generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub model: Option<String>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub images: Vec<ImageInput>,
}

impl InvokeRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A structured tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub text: String,
    pub usage: Option<Usage>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl InvokeResponse {
    /// A response carrying only text, with no usage or tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub texts: Vec<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub dimension: usize,
}

/// Registry-facing snapshot of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub category: ProviderCategory,
    pub connection_state: ConnectionState,
}

/// Trait that all backend adapters must implement. Each provider translates
/// the neutral request shapes into its own API and back.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used for registry lookup (e.g. "anthropic").
    fn id(&self) -> &str;

    fn category(&self) -> ProviderCategory;

    fn connection_state(&self) -> ConnectionState;

    /// Authenticate against the backend. Never fails loudly: any auth or
    /// network problem is reported as `false`.
    async fn connect(&self, credentials: &Credentials) -> bool;

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError>;

    async fn embed(&self, _request: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.id().to_string(),
            operation: "embed".to_string(),
        })
    }

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: self.id().to_string(),
            category: self.category(),
            connection_state: self.connection_state(),
        }
    }
}
