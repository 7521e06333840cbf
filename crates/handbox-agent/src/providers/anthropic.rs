// ABOUTME: Anthropic Claude adapter implementing the Provider contract over the Messages API.
// ABOUTME: Builds request bodies with system prompt, images and tools; parses text, tool_use and usage.

use async_trait::async_trait;
use serde_json::{Value, json};

use handbox_core::{
    ConnectionState, Credentials, InvokeRequest, InvokeResponse, Provider, ProviderCategory,
    ProviderError, ToolCall, Usage,
};

use super::{ConnectionSlot, probe, reject, send_json};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// Anthropic generative provider. Calls the Messages API and maps content
/// blocks back into an `InvokeResponse`.
pub struct AnthropicProvider {
    id: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    connection: ConnectionSlot,
}

impl AnthropicProvider {
    /// Create a provider reading configuration from environment variables.
    /// Optional: `ANTHROPIC_API_KEY` (can also be supplied via `connect`)
    /// Optional: `ANTHROPIC_BASE_URL` (defaults to https://api.anthropic.com)
    /// Optional: `ANTHROPIC_MODEL` (defaults to claude-sonnet-4-5-20250929)
    pub fn from_env() -> Self {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_key, base_url, model)
    }

    /// Create a provider with explicit configuration.
    pub fn new(api_key: Option<String>, base_url: String, model: String) -> Self {
        Self {
            id: "anthropic".to_string(),
            client: reqwest::Client::new(),
            base_url,
            model,
            connection: ConnectionSlot::new(api_key),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Build the JSON request body for the Messages API.
    pub fn build_request_body(&self, request: &InvokeRequest) -> Value {
        let mut content: Vec<Value> = request
            .images
            .iter()
            .map(|image| {
                json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": image.media_type,
                        "data": image.data
                    }
                })
            })
            .collect();
        content.push(json!({"type": "text", "text": request.prompt}));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens.unwrap_or(MAX_TOKENS),
            "messages": [{"role": "user", "content": content}]
        });

        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters
                    })
                })
                .collect();
        }

        body
    }

    /// Parse a Messages API response body.
    pub fn parse_response(response_body: &Value) -> Result<InvokeResponse, ProviderError> {
        let content = response_body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing content array in response".to_string())
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| {
                            ProviderError::InvalidResponse(
                                "tool_use block missing name".to_string(),
                            )
                        })?;
                    tool_calls.push(ToolCall {
                        id: block.get("id").and_then(|i| i.as_str()).map(String::from),
                        name: name.to_string(),
                        arguments: block.get("input").cloned().unwrap_or(json!({})),
                    });
                }
                _ => {}
            }
        }

        let usage = response_body.get("usage").map(|u| Usage {
            input_tokens: token_count(u, "input_tokens"),
            output_tokens: token_count(u, "output_tokens"),
        });

        Ok(InvokeResponse {
            text,
            usage,
            tool_calls,
        })
    }
}

fn token_count(usage: &Value, field: &str) -> u32 {
    usage
        .get(field)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> ProviderCategory {
        ProviderCategory::Generative
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    async fn connect(&self, credentials: &Credentials) -> bool {
        let Some(api_key) = credentials
            .get("api_key")
            .map(String::from)
            .or_else(|| self.connection.secret())
        else {
            return reject(&self.connection, &self.id, "missing api_key");
        };

        let request = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", &api_key)
            .header("anthropic-version", API_VERSION);

        let connected = probe(&self.connection, &self.id, request).await;
        if connected {
            self.connection.set_secret(api_key);
        }
        connected
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let api_key = self.connection.require_secret(&self.id)?;
        let body = self.build_request_body(request);

        let http = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let response_body = send_json(http, &self.id).await?;
        Self::parse_response(&response_body)
    }
}
