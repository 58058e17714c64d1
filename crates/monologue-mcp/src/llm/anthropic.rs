//! Anthropic Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{LlmError, MessageClient, MessageRequest, MessageResponse};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Calls `POST {base_url}/v1/messages`.
///
/// A client without a key still constructs; every call then fails with
/// [`LlmError::MissingApiKey`].
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, LlmError> {
        Self::build(Some(api_key.into()), String::new(), base_url.into())
    }

    /// Build a client reading the key from the environment variable `env_var`.
    pub fn from_env(env_var: &str, base_url: Option<&str>) -> Result<Self, LlmError> {
        let api_key = std::env::var(env_var)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            tracing::warn!("{env_var} is not set; monologue generation will fail");
        }
        Self::build(
            api_key,
            env_var.to_string(),
            base_url.unwrap_or(DEFAULT_BASE_URL).to_string(),
        )
    }

    fn build(
        api_key: Option<String>,
        api_key_env: String,
        base_url: String,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_key_env,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl MessageClient for AnthropicClient {
    async fn create_message(&self, request: MessageRequest) -> Result<MessageResponse, LlmError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::MissingApiKey(self.api_key_env.clone()))?;
        tracing::debug!(
            "Requesting completion from {} (max_tokens {})",
            request.model,
            request.max_tokens
        );
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let message = match serde_json::from_slice::<ErrorEnvelope>(&bytes) {
                Ok(envelope) => envelope.error.message,
                Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
            };
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| LlmError::Decode(e.to_string()))
    }
}
