// ABOUTME: Error taxonomy for handbox: provider failures, malformed model output, and engine errors.
// ABOUTME: Every fallible operation in the workspace returns one of these thiserror enums.

use thiserror::Error;

/// Errors raised by a provider adapter while talking to its backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Rate limited")]
    RateLimited,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider '{0}' is not connected")]
    NotConnected(String),

    #[error("provider '{provider}' does not support {operation}")]
    Unsupported { provider: String, operation: String },

    /// Produced inside adapters during `connect`; collapsed to `false` at the
    /// `Provider::connect` boundary and never returned from it.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

/// A model response that did not contain the structured content a strategy
/// asked for. Carries the raw text so callers can degrade to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model output contained no structured content")]
pub struct MalformedModelOutput {
    pub raw: String,
}

/// Raised when a task's terminal status would be set a second time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {task_id} already reached a terminal status")]
pub struct TaskStateError {
    pub task_id: String,
}

/// Top-level error for registries, strategies and capability execution.
#[derive(Debug, Error)]
pub enum HandboxError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    MalformedModelOutput(#[from] MalformedModelOutput),

    #[error("task {task_id} failed: {reason}")]
    TaskExecutionFailed { task_id: String, reason: String },

    #[error(transparent)]
    TaskState(#[from] TaskStateError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("agent call depth {depth} exceeds the configured limit")]
    RecursionLimit { depth: u32 },

    #[error("capability failed: {0}")]
    Capability(String),
}
