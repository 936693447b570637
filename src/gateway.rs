//! Completion Gateway: forwards an assembled message list to the cloud
//! provider and hands back the streamed body untouched

use crate::types::ChatMessage;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_COMPLETION_URL: &str = "https://routellm.abacus.ai/v1/chat/completions";
pub const DEFAULT_CLOUD_MODEL: &str = "gpt-5.2";
pub const DEFAULT_TEMPERATURE: f32 = 0.8;

/// Raw upstream byte stream
pub type CompletionStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// No credential configured for the provider
    #[error("API key not configured")]
    MissingApiKey,

    /// Provider answered with a non-success status
    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The request never reached the provider
    #[error("Request to completion provider failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GatewayError {
    /// Text safe to show to the user; provider details stay in the logs
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::MissingApiKey => "API key not configured",
            GatewayError::Upstream { .. } | GatewayError::Transport(_) => {
                "Failed to get response from OpenAI"
            }
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_COMPLETION_URL.to_string(),
            api_key: None,
        }
    }
}

/// Body of a streamed completion request
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_tokens: i64,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            max_tokens: crate::context::DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletionGateway {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl CompletionGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Whether a credential is available
    pub fn is_configured(&self) -> bool {
        self.api_key().is_some()
    }

    fn api_key(&self) -> Option<&str> {
        self.config.api_key.as_deref().filter(|key| !key.is_empty())
    }

    /// Issue the request and return the provider's body as a byte stream.
    /// No retry and no deadline: the stream lasts as long as the provider
    /// keeps sending.
    pub async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, GatewayError> {
        let api_key = self.api_key().ok_or(GatewayError::MissingApiKey)?;

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            "sending completion request"
        );

        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "completion provider error: {body}");
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.bytes_stream().boxed())
    }
}
