// ABOUTME: Local model adapter for an Ollama-compatible server (generate, embed, tags probe).
// ABOUTME: Needs no API key; connect only checks that the endpoint answers.

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Value, json};

use handbox_core::{
    ConnectionState, Credentials, EmbedRequest, EmbedResponse, InvokeRequest, InvokeResponse,
    Provider, ProviderCategory, ProviderError, Usage,
};

use super::{ConnectionSlot, probe, send_json};

const DEFAULT_ENDPOINT: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
const MAX_TOKENS: u32 = 2048;

pub struct OllamaProvider {
    id: String,
    category: ProviderCategory,
    client: reqwest::Client,
    endpoint: RwLock<String>,
    model: String,
    connection: ConnectionSlot,
}

impl OllamaProvider {
    /// Optional: `LOCAL_LLM_ENDPOINT` (defaults to http://localhost:11434),
    /// `LOCAL_LLM_MODEL` (defaults to llama3.2).
    pub fn from_env() -> Self {
        let endpoint =
            std::env::var("LOCAL_LLM_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let model = std::env::var("LOCAL_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(endpoint, model)
    }

    pub fn new(endpoint: String, model: String) -> Self {
        Self {
            id: "local".to_string(),
            category: ProviderCategory::Generative,
            client: reqwest::Client::new(),
            endpoint: RwLock::new(trim_endpoint(&endpoint)),
            model,
            connection: ConnectionSlot::new(None),
        }
    }

    pub fn embedding(endpoint: String, model: Option<String>) -> Self {
        Self {
            id: "local-embedding".to_string(),
            category: ProviderCategory::Embedding,
            client: reqwest::Client::new(),
            endpoint: RwLock::new(trim_endpoint(&endpoint)),
            model: model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            connection: ConnectionSlot::new(None),
        }
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn build_request_body(&self, request: &InvokeRequest) -> Value {
        let mut options = json!({"num_predict": request.max_tokens.unwrap_or(MAX_TOKENS)});
        if let Some(temperature) = request.temperature {
            options["temperature"] = json!(temperature);
        }

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "prompt": request.prompt,
            "stream": false,
            "options": options
        });

        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if !request.images.is_empty() {
            body["images"] = request.images.iter().map(|i| json!(i.data)).collect();
        }
        body
    }

    pub fn parse_response(response_body: &Value) -> Result<InvokeResponse, ProviderError> {
        let text = response_body
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing response field".to_string())
            })?;

        let count = |field: &str| {
            response_body
                .get(field)
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
        };
        let usage = match (count("prompt_eval_count"), count("eval_count")) {
            (None, None) => None,
            (input, output) => Some(Usage {
                input_tokens: input.unwrap_or(0),
                output_tokens: output.unwrap_or(0),
            }),
        };

        Ok(InvokeResponse {
            text: text.to_string(),
            usage,
            tool_calls: Vec::new(),
        })
    }

    pub fn parse_embedding_response(response_body: &Value) -> Result<EmbedResponse, ProviderError> {
        let rows = response_body
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing embeddings array".to_string())
            })?;

        let embeddings: Vec<Vec<f32>> = rows
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| v.as_f64().unwrap_or_default() as f32)
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();
        let dimension = embeddings.first().map(Vec::len).unwrap_or(0);
        Ok(EmbedResponse {
            embeddings,
            dimension,
        })
    }
}

fn trim_endpoint(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}

#[async_trait]
impl Provider for OllamaProvider {
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
        if let Some(endpoint) = credentials.get("endpoint") {
            *self
                .endpoint
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = trim_endpoint(endpoint);
        }

        let request = self.client.get(format!("{}/api/tags", self.endpoint()));
        probe(&self.connection, &self.id, request).await
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        if self.category != ProviderCategory::Generative {
            return Err(ProviderError::Unsupported {
                provider: self.id.clone(),
                operation: "invoke".to_string(),
            });
        }
        let body = self.build_request_body(request);
        let http = self
            .client
            .post(format!("{}/api/generate", self.endpoint()))
            .json(&body);

        let response_body = send_json(http, &self.id).await?;
        Self::parse_response(&response_body)
    }

    async fn embed(&self, request: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "input": request.texts
        });
        let http = self
            .client
            .post(format!("{}/api/embed", self.endpoint()))
            .json(&body);

        let response_body = send_json(http, &self.id).await?;
        Self::parse_embedding_response(&response_body)
    }
}
