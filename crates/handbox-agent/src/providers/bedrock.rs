// ABOUTME: AWS Bedrock adapter over the runtime InvokeModel endpoint, authenticated with a Bedrock API key.
// ABOUTME: The generative flavour speaks the Anthropic messages format; the embedding flavour calls Titan.

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Value, json};

use handbox_core::{
    ConnectionState, Credentials, EmbedRequest, EmbedResponse, InvokeRequest, InvokeResponse,
    Provider, ProviderCategory, ProviderError,
};

use super::{AnthropicProvider, ConnectionSlot, reject, send_json};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_MODEL: &str = "anthropic.claude-3-5-sonnet-20240620-v1:0";
const DEFAULT_EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v1";
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const MAX_TOKENS: u32 = 4096;
/// Regions tried after the configured one when a model call fails there.
const FALLBACK_REGIONS: [&str; 2] = ["us-east-1", "us-west-2"];

/// Bedrock provider. Connects with a Bedrock API key taken from
/// `bedrock_api_key` (or `api_key`) in the credentials, so it can be a
/// cascade target of the `aws` cloud provider. IAM access keys alone are
/// not enough: requests are sent with `Authorization: Bearer`, unsigned.
pub struct BedrockProvider {
    id: String,
    category: ProviderCategory,
    client: reqwest::Client,
    region: RwLock<String>,
    /// Fixed runtime endpoint; disables the region fallback when set.
    endpoint: Option<String>,
    model: String,
    connection: ConnectionSlot,
}

impl BedrockProvider {
    /// Generative provider; `model` defaults to Claude 3.5 Sonnet on Bedrock.
    pub fn new(api_key: Option<String>, region: Option<String>, model: Option<String>) -> Self {
        Self {
            id: "bedrock".to_string(),
            category: ProviderCategory::Generative,
            client: reqwest::Client::new(),
            region: RwLock::new(region.unwrap_or_else(|| DEFAULT_REGION.to_string())),
            endpoint: None,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            connection: ConnectionSlot::new(api_key),
        }
    }

    /// Embedding provider; `model` defaults to amazon.titan-embed-text-v1.
    pub fn embedding(api_key: Option<String>, region: Option<String>, model: Option<String>) -> Self {
        Self {
            id: "bedrock-embedding".to_string(),
            category: ProviderCategory::Embedding,
            model: model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            ..Self::new(api_key, region, None)
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn region(&self) -> String {
        self.region
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Runtime endpoints to try, in order, without duplicates.
    pub fn endpoints(&self) -> Vec<String> {
        if let Some(endpoint) = &self.endpoint {
            return vec![endpoint.clone()];
        }
        let region = self.region();
        let mut regions = vec![region.as_str()];
        for fallback in FALLBACK_REGIONS {
            if !regions.contains(&fallback) {
                regions.push(fallback);
            }
        }
        regions
            .into_iter()
            .map(|r| format!("https://bedrock-runtime.{}.amazonaws.com", r))
            .collect()
    }

    /// Build an Anthropic-on-Bedrock InvokeModel body. The model id goes in
    /// the URL, not the body.
    pub fn build_request_body(request: &InvokeRequest) -> Value {
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
            "anthropic_version": ANTHROPIC_VERSION,
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

    /// Titan embeds one text per call.
    pub fn build_embedding_body(text: &str) -> Value {
        json!({"inputText": text})
    }

    pub fn parse_embedding_response(response_body: &Value) -> Result<Vec<f32>, ProviderError> {
        let vector = response_body
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing embedding in response".to_string())
            })?;
        Ok(vector
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect())
    }

    async fn invoke_model(
        &self,
        api_key: &str,
        model: &str,
        body: &Value,
    ) -> Result<Value, ProviderError> {
        let mut last_error = ProviderError::NotConnected(self.id.clone());
        for endpoint in self.endpoints() {
            let http = self
                .client
                .post(format!("{}/model/{}/invoke", endpoint, model))
                .bearer_auth(api_key)
                .header("accept", "application/json")
                .json(body);

            match send_json(http, &self.id).await {
                Ok(response_body) => return Ok(response_body),
                Err(e @ (ProviderError::Unauthorized(_) | ProviderError::RateLimited)) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(provider = %self.id, endpoint = %endpoint, error = %e, "bedrock call failed, trying next region");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

fn valid_api_key(key: &str) -> bool {
    !key.chars().any(char::is_whitespace)
}

#[async_trait]
impl Provider for BedrockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> ProviderCategory {
        self.category
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Stores the key and region. Bedrock has no cheap unauthenticated
    /// endpoint to probe, so a bad key surfaces as `Unauthorized` on first use.
    async fn connect(&self, credentials: &Credentials) -> bool {
        let Some(api_key) = credentials
            .get("bedrock_api_key")
            .or_else(|| credentials.get("api_key"))
            .map(String::from)
            .or_else(|| self.connection.secret())
        else {
            return reject(&self.connection, &self.id, "missing bedrock_api_key");
        };
        if !valid_api_key(&api_key) {
            return reject(&self.connection, &self.id, "malformed bedrock_api_key");
        }

        if let Some(region) = credentials.get("region") {
            *self
                .region
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = region.to_string();
        }
        self.connection.set_secret(api_key);
        self.connection.set_state(ConnectionState::Connected);
        tracing::info!(provider = %self.id, region = %self.region(), "bedrock api key accepted");
        true
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        if self.category != ProviderCategory::Generative {
            return Err(ProviderError::Unsupported {
                provider: self.id.clone(),
                operation: "invoke".to_string(),
            });
        }
        let api_key = self.connection.require_secret(&self.id)?;
        let model = request.model.as_deref().unwrap_or(&self.model);
        if !model.contains("anthropic.") {
            return Err(ProviderError::Unsupported {
                provider: self.id.clone(),
                operation: format!("invoke with model {}", model),
            });
        }

        let body = Self::build_request_body(request);
        let response_body = self.invoke_model(&api_key, model, &body).await?;
        AnthropicProvider::parse_response(&response_body)
    }

    async fn embed(&self, request: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if self.category != ProviderCategory::Embedding {
            return Err(ProviderError::Unsupported {
                provider: self.id.clone(),
                operation: "embed".to_string(),
            });
        }
        let api_key = self.connection.require_secret(&self.id)?;
        let model = request.model.as_deref().unwrap_or(&self.model);

        let mut embeddings = Vec::with_capacity(request.texts.len());
        for text in &request.texts {
            let body = Self::build_embedding_body(text);
            let response_body = self.invoke_model(&api_key, model, &body).await?;
            embeddings.push(Self::parse_embedding_response(&response_body)?);
        }
        let dimension = embeddings.first().map(Vec::len).unwrap_or(0);
        Ok(EmbedResponse {
            embeddings,
            dimension,
        })
    }
}
