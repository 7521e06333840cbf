// ABOUTME: Shared model-call helper used by every strategy: resolve a provider, build and send a request.
// ABOUTME: ModelSettings is the provider/model/temperature block flattened into strategy configs.

use serde::{Deserialize, Serialize};

use handbox_core::{ExecutionContext, HandboxError, InvokeRequest, InvokeResponse, ProviderCategory};

use crate::registry::ProviderRegistry;

/// Per-call model selection. All fields are optional; unset values fall
/// back to the resolved provider's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelSettings {
    pub fn request(&self, system: Option<String>, prompt: impl Into<String>) -> InvokeRequest {
        InvokeRequest {
            model: self.model.clone(),
            prompt: prompt.into(),
            system_prompt: system,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..InvokeRequest::default()
        }
    }
}

/// Send one generation request through the provider chosen by
/// `settings.provider`, the context default, or the active provider.
pub async fn invoke_model(
    providers: &ProviderRegistry,
    ctx: &ExecutionContext,
    settings: &ModelSettings,
    request: InvokeRequest,
) -> Result<InvokeResponse, HandboxError> {
    let provider = providers.resolve(ctx, ProviderCategory::Generative, settings.provider.as_deref())?;
    tracing::debug!(
        trace_id = %ctx.trace_id,
        provider = provider.id(),
        prompt_len = request.prompt.len(),
        "invoking model"
    );
    let response = provider.invoke(&request).await.inspect_err(|e| {
        tracing::warn!(trace_id = %ctx.trace_id, provider = provider.id(), error = %e, "model call failed");
    })?;
    Ok(response)
}
