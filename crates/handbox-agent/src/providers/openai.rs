// ABOUTME: OpenAI adapter implementing the Provider contract over Chat Completions and Embeddings.
// ABOUTME: One type serves both the generative and the embedding category, chosen at construction.

use async_trait::async_trait;
use serde_json::{Value, json};

use handbox_core::{
    ConnectionState, Credentials, EmbedRequest, EmbedResponse, InvokeRequest, InvokeResponse,
    Provider, ProviderCategory, ProviderError, ToolCall, Usage,
};

use super::{ConnectionSlot, probe, reject, send_json};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const MAX_TOKENS: u32 = 4096;

/// OpenAI provider. The generative flavour calls `/v1/chat/completions`,
/// the embedding flavour calls `/v1/embeddings`.
pub struct OpenAiProvider {
    id: String,
    category: ProviderCategory,
    client: reqwest::Client,
    base_url: String,
    model: String,
    connection: ConnectionSlot,
}

impl OpenAiProvider {
    /// Generative provider configured from the environment.
    /// Optional: `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_MODEL` (defaults to gpt-4o).
    pub fn from_env() -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_key, base_url, model)
    }

    /// Generative provider with explicit configuration.
    pub fn new(api_key: Option<String>, base_url: String, model: String) -> Self {
        Self {
            id: "openai".to_string(),
            category: ProviderCategory::Generative,
            client: reqwest::Client::new(),
            base_url,
            model,
            connection: ConnectionSlot::new(api_key),
        }
    }

    /// Embedding provider; `model` defaults to text-embedding-3-small.
    pub fn embedding(api_key: Option<String>, base_url: String, model: Option<String>) -> Self {
        Self {
            id: "openai-embedding".to_string(),
            category: ProviderCategory::Embedding,
            client: reqwest::Client::new(),
            base_url,
            model: model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
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

    /// Build the JSON request body for Chat Completions.
    pub fn build_request_body(&self, request: &InvokeRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }

        if request.images.is_empty() {
            messages.push(json!({"role": "user", "content": request.prompt}));
        } else {
            let mut parts = vec![json!({"type": "text", "text": request.prompt})];
            parts.extend(request.images.iter().map(|image| {
                json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.media_type, image.data)
                    }
                })
            }));
            messages.push(json!({"role": "user", "content": parts}));
        }

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens.unwrap_or(MAX_TOKENS),
            "messages": messages
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters
                        }
                    })
                })
                .collect();
        }

        body
    }

    /// Parse a Chat Completions response body.
    pub fn parse_response(response_body: &Value) -> Result<InvokeResponse, ProviderError> {
        let message = response_body
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing choices[0].message in response".to_string())
            })?;

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
            for call in calls {
                let function = call.get("function").ok_or_else(|| {
                    ProviderError::InvalidResponse("tool call missing function".to_string())
                })?;
                let name = function
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| {
                        ProviderError::InvalidResponse("tool call missing name".to_string())
                    })?;
                // Arguments arrive as a JSON-encoded string.
                let arguments = match function.get("arguments") {
                    Some(Value::String(raw)) => {
                        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                    }
                    Some(other) => other.clone(),
                    None => json!({}),
                };
                tool_calls.push(ToolCall {
                    id: call.get("id").and_then(|i| i.as_str()).map(String::from),
                    name: name.to_string(),
                    arguments,
                });
            }
        }

        let usage = response_body.get("usage").map(|u| Usage {
            input_tokens: token_count(u, "prompt_tokens"),
            output_tokens: token_count(u, "completion_tokens"),
        });

        Ok(InvokeResponse {
            text,
            usage,
            tool_calls,
        })
    }

    pub fn build_embedding_body(&self, request: &EmbedRequest) -> Value {
        json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "input": request.texts
        })
    }

    /// Parse an Embeddings response, ordering vectors by their `index`.
    pub fn parse_embedding_response(response_body: &Value) -> Result<EmbedResponse, ProviderError> {
        let data = response_body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing data array in response".to_string())
            })?;

        let mut indexed: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
        for (position, item) in data.iter().enumerate() {
            let vector = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    ProviderError::InvalidResponse("embedding item missing vector".to_string())
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or_default() as f32)
                .collect();
            let index = item
                .get("index")
                .and_then(|i| i.as_u64())
                .unwrap_or(position as u64);
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(index, _)| *index);

        let embeddings: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();
        let dimension = embeddings.first().map(Vec::len).unwrap_or(0);
        Ok(EmbedResponse {
            embeddings,
            dimension,
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
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> ProviderCategory {
        self.category
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
            .bearer_auth(&api_key);

        let connected = probe(&self.connection, &self.id, request).await;
        if connected {
            self.connection.set_secret(api_key);
        }
        connected
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        if self.category != ProviderCategory::Generative {
            return Err(ProviderError::Unsupported {
                provider: self.id.clone(),
                operation: "invoke".to_string(),
            });
        }
        let api_key = self.connection.require_secret(&self.id)?;
        let body = self.build_request_body(request);

        let http = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&api_key)
            .json(&body);

        let response_body = send_json(http, &self.id).await?;
        Self::parse_response(&response_body)
    }

    async fn embed(&self, request: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let api_key = self.connection.require_secret(&self.id)?;
        let body = self.build_embedding_body(request);

        let http = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&api_key)
            .json(&body);

        let response_body = send_json(http, &self.id).await?;
        Self::parse_embedding_response(&response_body)
    }
}
