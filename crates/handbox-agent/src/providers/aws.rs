// ABOUTME: Cloud-category provider holding AWS credentials for other providers to cascade from.
// ABOUTME: Validates credential shape on connect; the Bedrock adapters connect through its cascade.

use std::sync::RwLock;

use async_trait::async_trait;

use handbox_core::{
    ConnectionState, Credentials, InvokeRequest, InvokeResponse, Provider, ProviderCategory,
    ProviderError,
};

use super::{ConnectionSlot, reject};

const DEFAULT_REGION: &str = "us-east-1";

pub struct AwsCloudProvider {
    region: RwLock<String>,
    connection: ConnectionSlot,
}

impl AwsCloudProvider {
    pub fn new(region: Option<String>) -> Self {
        Self {
            region: RwLock::new(region.unwrap_or_else(|| DEFAULT_REGION.to_string())),
            connection: ConnectionSlot::new(None),
        }
    }

    pub fn region(&self) -> String {
        self.region
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn access_key_id(&self) -> Option<String> {
        self.connection.secret()
    }
}

impl Default for AwsCloudProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Access key ids are 16 to 128 uppercase alphanumerics (AKIA..., ASIA...).
fn valid_access_key_id(id: &str) -> bool {
    (16..=128).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn valid_secret_key(secret: &str) -> bool {
    secret.len() >= 16 && !secret.chars().any(char::is_whitespace)
}

#[async_trait]
impl Provider for AwsCloudProvider {
    fn id(&self) -> &str {
        "aws"
    }

    fn category(&self) -> ProviderCategory {
        ProviderCategory::Cloud
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    async fn connect(&self, credentials: &Credentials) -> bool {
        let (Some(access_key_id), Some(secret)) = (
            credentials.get("access_key_id"),
            credentials.get("secret_access_key"),
        ) else {
            return reject(&self.connection, "aws", "missing access_key_id or secret_access_key");
        };

        if !valid_access_key_id(access_key_id) || !valid_secret_key(secret) {
            return reject(&self.connection, "aws", "malformed credentials");
        }

        if let Some(region) = credentials.get("region") {
            *self
                .region
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = region.to_string();
        }
        self.connection.set_secret(access_key_id.to_string());
        self.connection.set_state(ConnectionState::Connected);
        tracing::info!(provider = "aws", region = %self.region(), "cloud credentials accepted");
        true
    }

    async fn invoke(&self, _request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: "aws".to_string(),
            operation: "invoke".to_string(),
        })
    }
}
