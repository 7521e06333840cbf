// ABOUTME: Google Gemini adapter implementing the Provider contract over generateContent.
// ABOUTME: Maps prompts, inline images and function declarations into the Gemini request shape.

use async_trait::async_trait;
use serde_json::{Value, json};

use handbox_core::{
    ConnectionState, Credentials, InvokeRequest, InvokeResponse, Provider, ProviderCategory,
    ProviderError, ToolCall, Usage,
};

use super::{ConnectionSlot, probe, reject, send_json};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const MAX_TOKENS: u32 = 4096;

pub struct GeminiProvider {
    id: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    connection: ConnectionSlot,
}

impl GeminiProvider {
    /// Optional: `GEMINI_API_KEY`, `GEMINI_BASE_URL`, `GEMINI_MODEL` (defaults to gemini-2.0-flash).
    pub fn from_env() -> Self {
        let api_key = std::env::var("GEMINI_API_KEY").ok();
        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_key, base_url, model)
    }

    pub fn new(api_key: Option<String>, base_url: String, model: String) -> Self {
        Self {
            id: "gemini".to_string(),
            client: reqwest::Client::new(),
            base_url,
            model,
            connection: ConnectionSlot::new(api_key),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn build_request_body(&self, request: &InvokeRequest) -> Value {
        let mut parts = vec![json!({"text": request.prompt})];
        parts.extend(request.images.iter().map(|image| {
            json!({
                "inline_data": {"mime_type": image.media_type, "data": image.data}
            })
        }));

        let mut generation_config = json!({
            "maxOutputTokens": request.max_tokens.unwrap_or(MAX_TOKENS)
        });
        if let Some(temperature) = request.temperature {
            generation_config["temperature"] = json!(temperature);
        }

        let mut body = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": generation_config
        });

        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        body
    }

    pub fn parse_response(response_body: &Value) -> Result<InvokeResponse, ProviderError> {
        let parts = response_body
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| {
                ProviderError::InvalidResponse(
                    "missing candidates[0].content.parts in response".to_string(),
                )
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall")
                && let Some(name) = call.get("name").and_then(|n| n.as_str())
            {
                tool_calls.push(ToolCall {
                    id: None,
                    name: name.to_string(),
                    arguments: call.get("args").cloned().unwrap_or(json!({})),
                });
            }
        }

        let usage = response_body.get("usageMetadata").map(|u| Usage {
            input_tokens: token_count(u, "promptTokenCount"),
            output_tokens: token_count(u, "candidatesTokenCount"),
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
impl Provider for GeminiProvider {
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
            .get(format!("{}/v1beta/models", self.base_url))
            .header("x-goog-api-key", &api_key);

        let connected = probe(&self.connection, &self.id, request).await;
        if connected {
            self.connection.set_secret(api_key);
        }
        connected
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let api_key = self.connection.require_secret(&self.id)?;
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = self.build_request_body(request);

        let http = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, model
            ))
            .header("x-goog-api-key", &api_key)
            .json(&body);

        let response_body = send_json(http, &self.id).await?;
        Self::parse_response(&response_body)
    }
}
