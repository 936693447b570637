//! Client for the local/alternate model endpoint (Ollama, optionally behind a bridge)
//!
//! The local model never answers the user directly; it only condenses
//! context for the cloud model. Failures are classified so callers can tell
//! "model missing" apart from "service down".

use crate::types::ChatMessage;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_LOCAL_MODEL: &str = "llama3.2";

/// Deadline for the direct availability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for the bridge health check
pub const BRIDGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the local model endpoint
#[derive(Error, Debug)]
pub enum LocalModelError {
    /// The endpoint answered but does not know the model
    #[error("Local model not found: {0}")]
    ModelNotFound(String),

    /// Connection refused, DNS failure or timeout
    #[error("Local model service unreachable: {0}")]
    Unreachable(String),

    /// Any other non-success status
    #[error("Local model returned status {0}")]
    Status(u16),

    /// Response body was not the expected JSON
    #[error("Invalid response from local model: {0}")]
    Decode(String),
}

impl LocalModelError {
    /// HTTP status to propagate to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            LocalModelError::ModelNotFound(_) => 404,
            LocalModelError::Unreachable(_) => 502,
            LocalModelError::Status(code) => *code,
            LocalModelError::Decode(_) => 502,
        }
    }

    /// User-facing hint for fixing the problem
    pub fn guidance(&self) -> String {
        match self {
            LocalModelError::ModelNotFound(model) => {
                format!("El modelo '{model}' no está instalado. Ejecuta: ollama pull {model}")
            }
            LocalModelError::Unreachable(_) => {
                "No se pudo conectar con Ollama. Asegúrate de que esté corriendo: ollama serve"
                    .to_string()
            }
            LocalModelError::Status(code) => format!("Ollama respondió con un error ({code})"),
            LocalModelError::Decode(_) => "Ollama devolvió una respuesta inválida".to_string(),
        }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            LocalModelError::Unreachable(err.to_string())
        } else if err.is_decode() {
            LocalModelError::Decode(err.to_string())
        } else {
            LocalModelError::Unreachable(err.to_string())
        }
    }

    fn from_status(status: reqwest::StatusCode, model: &str) -> Self {
        if status == reqwest::StatusCode::NOT_FOUND {
            LocalModelError::ModelNotFound(model.to_string())
        } else {
            LocalModelError::Status(status.as_u16())
        }
    }
}

/// A model able to produce a single non-streamed completion
#[async_trait]
pub trait LocalModel: Send + Sync {
    /// Returns `Ok(None)` when the reply carried no content
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<Option<String>, LocalModelError>;

    /// Whether the model can take a request right now
    async fn is_available(&self) -> bool;
}

/// Local model configuration
#[derive(Debug, Clone)]
pub struct LocalModelConfig {
    pub ollama_url: String,
    pub model: String,
    /// When set, completions and health checks go through the bridge
    pub bridge_url: Option<String>,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_LOCAL_MODEL.to_string(),
            bridge_url: None,
        }
    }
}

/// Outcome of an availability probe
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Probe {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The endpoint answered with a success status
    #[serde(skip)]
    pub reachable: bool,
}

/// HTTP client for Ollama's OpenAI-compatible API
#[derive(Debug, Clone)]
pub struct LocalModelClient {
    http: reqwest::Client,
    config: LocalModelConfig,
}

impl LocalModelClient {
    pub fn new(config: LocalModelConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &LocalModelConfig {
        &self.config
    }

    fn base_url(&self) -> &str {
        self.config.ollama_url.trim_end_matches('/')
    }

    fn bridge_url(&self) -> Option<&str> {
        self.config
            .bridge_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
    }

    /// Completion endpoint used for compression
    pub fn completions_url(&self) -> String {
        match self.bridge_url() {
            Some(bridge) => format!("{bridge}/v1/chat/completions"),
            None => format!("{}/v1/chat/completions", self.base_url()),
        }
    }

    /// Hit the Ollama root with a short deadline; Ollama answers with a
    /// banner containing its name
    pub async fn probe(&self) -> Probe {
        let response = self
            .http
            .get(self.base_url())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let text = resp.text().await.unwrap_or_default();
                Probe {
                    available: text.contains("Ollama"),
                    message: Some(text),
                    error: None,
                    reachable: true,
                }
            }
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), "local model probe rejected");
                Probe {
                    available: false,
                    message: None,
                    error: None,
                    reachable: false,
                }
            }
            Err(e) => {
                tracing::debug!("local model probe failed: {e}");
                Probe {
                    available: false,
                    message: None,
                    error: Some("Ollama no disponible".to_string()),
                    reachable: false,
                }
            }
        }
    }

    /// Availability as seen by the hybrid path: the bridge's health report
    /// when a bridge is configured, the direct probe otherwise
    pub async fn check_available(&self) -> bool {
        let Some(bridge) = self.bridge_url() else {
            return self.probe().await.available;
        };

        let response = self
            .http
            .get(format!("{bridge}/health"))
            .header("ngrok-skip-browser-warning", "true")
            .timeout(BRIDGE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => {
                    body.get("available") == Some(&Value::Bool(true))
                        || body.get("ollama") == Some(&Value::Bool(true))
                }
                Err(_) => false,
            },
            Ok(_) => false,
            Err(e) => {
                tracing::debug!("bridge health check failed: {e}");
                false
            }
        }
    }

    /// Relay an arbitrary chat-completions body to Ollama and return its JSON
    pub async fn proxy(&self, body: Value) -> Result<Value, LocalModelError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.model)
            .to_string();

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url()))
            .json(&body)
            .send()
            .await
            .map_err(LocalModelError::from_transport)?;

        if !response.status().is_success() {
            return Err(LocalModelError::from_status(response.status(), &model));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| LocalModelError::Decode(e.to_string()))
    }
}

#[async_trait]
impl LocalModel for LocalModelClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<Option<String>, LocalModelError> {
        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": false,
            "temperature": temperature,
        });

        let response = self
            .http
            .post(self.completions_url())
            .header("ngrok-skip-browser-warning", "true")
            .json(&body)
            .send()
            .await
            .map_err(LocalModelError::from_transport)?;

        if !response.status().is_success() {
            return Err(LocalModelError::from_status(response.status(), &self.config.model));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LocalModelError::Decode(e.to_string()))?;

        Ok(data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn is_available(&self) -> bool {
        self.check_available().await
    }
}
