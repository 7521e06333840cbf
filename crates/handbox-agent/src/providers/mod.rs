// ABOUTME: Provider module aggregating all backend adapters behind the Provider contract.
// ABOUTME: Also holds the shared HTTP status mapping and per-adapter connection bookkeeping.

pub mod anthropic;
pub mod aws;
pub mod bedrock;
pub mod gemini;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use aws::AwsCloudProvider;
pub use bedrock::BedrockProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use std::sync::RwLock;

use serde_json::Value;

use handbox_core::{ConnectionState, ProviderError};

/// Connection state plus the secret an adapter authenticates with.
/// Guards are only held for the duration of a field read or write.
pub(crate) struct ConnectionSlot {
    secret: RwLock<Option<String>>,
    state: RwLock<ConnectionState>,
}

impl ConnectionSlot {
    pub(crate) fn new(secret: Option<String>) -> Self {
        Self {
            secret: RwLock::new(secret.filter(|s| !s.is_empty())),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    pub(crate) fn secret(&self) -> Option<String> {
        self.secret
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_secret(&self, secret: String) {
        *self
            .secret
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(secret);
    }

    /// The secret, or `NotConnected` when none has been supplied yet.
    pub(crate) fn require_secret(&self, provider: &str) -> Result<String, ProviderError> {
        self.secret()
            .ok_or_else(|| ProviderError::NotConnected(provider.to_string()))
    }
}

/// Send a request and decode a JSON body, mapping HTTP failures onto
/// `ProviderError` the same way for every backend.
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    provider: &str,
) -> Result<Value, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Http(e.to_string()))?;

    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProviderError::Unauthorized(format!(
            "check {} credentials",
            provider
        )));
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse JSON: {}", e)))
}

/// Run a connection probe, recording `Connecting` then `Connected`/`Failed`.
/// Returns whether the probe succeeded; failures are logged, never raised.
pub(crate) async fn probe(
    slot: &ConnectionSlot,
    provider: &str,
    request: reqwest::RequestBuilder,
) -> bool {
    slot.set_state(ConnectionState::Connecting);
    match send_json(request, provider).await {
        Ok(_) => {
            slot.set_state(ConnectionState::Connected);
            tracing::info!(provider, "provider connected");
            true
        }
        Err(e) => {
            slot.set_state(ConnectionState::Failed);
            let reason = ProviderError::ConnectionFailed(e.to_string());
            tracing::warn!(provider, error = %reason, "provider connect failed");
            false
        }
    }
}

/// Mark a connect attempt as failed before any request was made.
pub(crate) fn reject(slot: &ConnectionSlot, provider: &str, reason: &str) -> bool {
    slot.set_state(ConnectionState::Failed);
    tracing::warn!(provider, reason, "provider connect rejected");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_slot_starts_disconnected() {
        let slot = ConnectionSlot::new(Some(String::new()));
        assert_eq!(slot.state(), ConnectionState::Disconnected);
        assert!(slot.secret().is_none(), "empty secret counts as absent");
        assert!(matches!(
            slot.require_secret("openai"),
            Err(ProviderError::NotConnected(_))
        ));

        slot.set_secret("sk-test".to_string());
        assert_eq!(slot.require_secret("openai").unwrap(), "sk-test");
    }

    #[test]
    fn reject_marks_failed() {
        let slot = ConnectionSlot::new(None);
        assert!(!reject(&slot, "anthropic", "missing api_key"));
        assert_eq!(slot.state(), ConnectionState::Failed);
    }
}
