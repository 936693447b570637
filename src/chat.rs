//! One assistant turn: context building, the cloud call, and what gets
//! written back to the conversation buffer.

use crate::compression::{build_narrative, Compression, CompressionInput, ContextCompressor};
use crate::context::{hybrid_messages, ContextAssembler, UserTurn, DEFAULT_MAX_TOKENS};
use crate::error::{KaedeError, Result};
use crate::gateway::{
    CompletionGateway, CompletionRequest, CompletionStream, GatewayError, DEFAULT_CLOUD_MODEL,
    DEFAULT_TEMPERATURE,
};
use crate::local_model::LocalModel;
use crate::settings::RoutingMode;
use crate::store::ConversationStore;
use crate::stream::DeltaParser;
use crate::types::{Memory, Message, Role};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Marker appended to the stored user turn when a file was attached
pub const ATTACHMENT_MARKER: &str = "\n\n📎 Archivo adjunto";

/// Appended to apologies on hybrid turns whose local model was not detected
pub const OLLAMA_TIP: &str =
    "\n\n💡 Tip: Ollama no está detectado. Verifica que esté corriendo con: OLLAMA_ORIGINS=* ollama serve";

/// Inbound chat request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
    pub file_content: Option<String>,
    /// Context already condensed by the caller
    pub compressed_context: Option<String>,
    pub mode: Option<RoutingMode>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    fn file(&self) -> Option<&str> {
        self.file_content.as_deref().filter(|f| !f.is_empty())
    }
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Kaede(#[from] KaedeError),

    #[error("{source}")]
    Gateway {
        source: GatewayError,
        /// Assistant turn stored for this failure
        apology: String,
    },
}

/// A turn whose context has been built and whose user message is stored
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub completion: CompletionRequest,
    pub mode: RoutingMode,
    /// `None` when the user turn could not be stored
    pub user_message: Option<Message>,
    /// Buffered turns kept by the assembler; `None` on the hybrid path
    pub included_turns: Option<usize>,
    pub tokens_saved: usize,
    /// Local model check on a hybrid turn; `None` when no check ran
    pub local_available: Option<bool>,
}

impl PreparedTurn {
    /// Hybrid turn that went out without local compression
    pub fn local_missing(&self) -> bool {
        self.local_available == Some(false)
    }
}

/// A prepared turn with its upstream body attached
pub struct ChatTurn {
    pub prepared: PreparedTurn,
    pub stream: CompletionStream,
}

/// How a relayed stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream finished; the parsed reply text
    Completed(String),
    /// The receiving side went away before the end
    Abandoned,
    /// Upstream broke mid-stream
    Failed,
}

/// User-visible text of a stored user turn
pub fn display_text(message: &str, has_attachment: bool) -> String {
    if has_attachment {
        format!("{message}{ATTACHMENT_MARKER}")
    } else {
        message.to_string()
    }
}

/// Assistant-voiced text stored in place of a reply when a turn fails
pub fn apology_for(error: &str, local_missing: bool) -> String {
    let mut text = format!("Lo siento, hubo un error: {error} 😔");
    if local_missing {
        text.push_str(OLLAMA_TIP);
    }
    text
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<ConversationStore>,
    gateway: Arc<CompletionGateway>,
    local: Option<Arc<dyn LocalModel>>,
}

impl ChatService {
    pub fn new(store: Arc<ConversationStore>, gateway: Arc<CompletionGateway>) -> Self {
        Self {
            store,
            gateway,
            local: None,
        }
    }

    /// Enable server-side compression for hybrid turns
    pub fn with_local_model(mut self, model: Arc<dyn LocalModel>) -> Self {
        self.local = Some(model);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<CompletionGateway> {
        &self.gateway
    }

    /// Memories and in-buffer turns. Storage failures degrade to empty lists.
    async fn load_inputs(&self) -> (Vec<Memory>, Vec<Message>) {
        let memories = self.store.list_memories().await.unwrap_or_else(|e| {
            warn!("loading memories failed, continuing without: {e}");
            Vec::new()
        });
        let buffer = self.store.buffer_messages().await.unwrap_or_else(|e| {
            warn!("loading buffer failed, continuing without: {e}");
            Vec::new()
        });
        (memories, buffer)
    }

    /// Condense stored context plus the new message with the local model.
    /// Without a local model the raw narrative is returned.
    pub async fn compress(&self, message: &str, file_content: Option<&str>) -> Compression {
        let (memories, buffer) = self.load_inputs().await;
        let input = CompressionInput {
            memories: &memories,
            recent_messages: &buffer,
            current_message: message,
            file_content,
        };

        match &self.local {
            Some(model) => ContextCompressor::new(model.as_ref()).compress(&input).await,
            None => Compression {
                context: build_narrative(&input),
                tokens_saved: 0,
                compressed: false,
            },
        }
    }

    /// Build the message list for a turn and store the user message.
    ///
    /// The user message is stored only after the buffer has been read, so
    /// it is never sent twice.
    pub async fn prepare(&self, request: &ChatRequest) -> Result<PreparedTurn> {
        let message = request
            .message
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| KaedeError::Validation("Message is required".to_string()))?;

        let mode = request.mode.unwrap_or_default();
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let temperature = request.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_CLOUD_MODEL);

        let mut included_turns = None;
        let mut tokens_saved = 0;

        let precompressed = request.compressed_context.as_deref().filter(|c| !c.is_empty());
        let local_available = match (&self.local, mode) {
            _ if precompressed.is_some() => None,
            (_, RoutingMode::Cloud) => None,
            (Some(local), RoutingMode::Hybrid) => Some(local.is_available().await),
            (None, RoutingMode::Hybrid) => Some(false),
        };
        if local_available == Some(false) {
            warn!("local model not available, sending full context");
        }

        let messages = match precompressed {
            Some(compressed) => hybrid_messages(compressed, message),
            None if local_available == Some(true) => {
                let compression = self.compress(message, request.file()).await;
                tokens_saved = compression.tokens_saved;
                hybrid_messages(&compression.context, message)
            }
            None => {
                let (memories, buffer) = self.load_inputs().await;
                let mut turn = UserTurn::new(message);
                if let Some(file) = request.file() {
                    turn = turn.with_attachment(file);
                }
                let assembled = ContextAssembler::new(max_tokens).assemble(&memories, &buffer, &turn);
                included_turns = Some(assembled.included_turns);
                assembled.into_messages()
            }
        };

        let display = display_text(message, request.file().is_some());
        let user_message = match self.store.add_message(Role::User, &display).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!("failed to store user turn: {e}");
                None
            }
        };

        debug!(
            %mode,
            model,
            messages = messages.len(),
            tokens_saved,
            "prepared chat turn"
        );

        let completion = CompletionRequest::streaming(model, messages)
            .with_max_tokens(max_tokens)
            .with_temperature(temperature);

        Ok(PreparedTurn {
            completion,
            mode,
            user_message,
            included_turns,
            tokens_saved,
            local_available,
        })
    }

    /// Prepare a turn and open the upstream stream. A gateway failure is
    /// recorded as an apology turn before being returned.
    pub async fn start(&self, request: &ChatRequest) -> std::result::Result<ChatTurn, ChatError> {
        let prepared = self.prepare(request).await?;
        match self.gateway.stream(&prepared.completion).await {
            Ok(stream) => Ok(ChatTurn { prepared, stream }),
            Err(source) => {
                let apology = self
                    .record_apology(source.public_message(), prepared.local_missing())
                    .await;
                Err(ChatError::Gateway { source, apology })
            }
        }
    }

    /// Store the final assistant reply; empty replies are skipped
    pub async fn record_reply(&self, text: &str) -> Result<Option<Message>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.store.add_message(Role::Assistant, text).await.map(Some)
    }

    /// Store an apology turn and return its text; storage failures are
    /// only logged
    pub async fn record_apology(&self, error: &str, local_missing: bool) -> String {
        let apology = apology_for(error, local_missing);
        if let Err(e) = self.store.add_message(Role::Assistant, &apology).await {
            warn!("failed to store apology turn: {e}");
        }
        apology
    }

    /// Forward upstream chunks unchanged to `sink` while parsing the reply,
    /// then store the reply. Nothing is stored when the receiver goes away.
    pub async fn relay(
        &self,
        mut upstream: CompletionStream,
        mut sink: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
        local_missing: bool,
    ) -> RelayOutcome {
        let mut parser = DeltaParser::new();

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    parser.push(&bytes);
                    if sink.send(Ok(bytes)).await.is_err() {
                        debug!("client disconnected, dropping reply");
                        return RelayOutcome::Abandoned;
                    }
                }
                Err(e) => {
                    error!("completion stream failed: {e}");
                    let _ = sink.send(Err(std::io::Error::other(e.to_string()))).await;
                    self.record_apology(GatewayError::Transport(e).public_message(), local_missing)
                        .await;
                    return RelayOutcome::Failed;
                }
            }
        }

        let text = parser.finish();
        if let Err(e) = self.record_reply(&text).await {
            warn!("failed to store assistant reply: {e}");
        }
        RelayOutcome::Completed(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::local_model::{LocalModelClient, LocalModelConfig, LocalModelError};
    use crate::types::{ChatMessage, ChatRole, MemoryType};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use futures::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Summarizer;

    #[async_trait]
    impl LocalModel for Summarizer {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> std::result::Result<Option<String>, LocalModelError> {
            Ok(Some("Resumen: charla larga sobre gatos".to_string()))
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn unreachable_local() -> Arc<LocalModelClient> {
        Arc::new(LocalModelClient::new(LocalModelConfig {
            ollama_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        }))
    }

    async fn fill_buffer(chat: &ChatService, turns: i64) {
        let start = Utc::now() - Duration::minutes(30);
        for i in 0..turns {
            let message = Message::new(Role::User, format!("mensaje {i} {}", "miau ".repeat(30)))
                .with_created_at(start + Duration::seconds(i));
            chat.store().insert_message(&message).await.unwrap();
        }
    }

    async fn service(gateway: GatewayConfig) -> ChatService {
        let store = ConversationStore::connect_in_memory().await.unwrap();
        ChatService::new(store, Arc::new(CompletionGateway::new(gateway)))
    }

    fn offline() -> GatewayConfig {
        GatewayConfig {
            endpoint: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            api_key: None,
        }
    }

    fn sse(parts: &[&str]) -> String {
        let mut body = String::new();
        for part in parts {
            body.push_str(&format!(
                "data: {}\n\n",
                serde_json::json!({"choices": [{"delta": {"content": part}}]})
            ));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn empty_message_is_rejected_without_side_effects() {
        let chat = service(offline()).await;
        for request in [ChatRequest::default(), ChatRequest::new("")] {
            assert!(matches!(
                chat.prepare(&request).await,
                Err(KaedeError::Validation(m)) if m == "Message is required"
            ));
        }
        assert!(chat.store().buffer_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cloud_turn_uses_memories_and_buffer_once() {
        let chat = service(offline()).await;
        let store = chat.store();
        store
            .save_memory(&Memory::new("Odia el cilantro", MemoryType::Core))
            .await
            .unwrap();
        store.add_message(Role::User, "¿Te acuerdas de mí?").await.unwrap();
        store.add_message(Role::Assistant, "¡Claro que sí!").await.unwrap();

        let prepared = chat.prepare(&ChatRequest::new("Hola")).await.unwrap();
        let messages = &prepared.completion.messages;

        assert_eq!(prepared.completion.model, "gpt-5.2");
        assert_eq!(prepared.completion.max_tokens, 2000);
        assert_eq!(prepared.completion.temperature, 0.8);
        assert_eq!(prepared.included_turns, Some(2));
        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.contains("Odia el cilantro"));
        assert_eq!(messages[3], ChatMessage::user("Hola"));
        assert_eq!(messages.iter().filter(|m| m.content == "Hola").count(), 1);

        let buffer = store.buffer_messages().await.unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer[2].content, "Hola");
        assert_eq!(prepared.user_message.unwrap().content, "Hola");
    }

    #[tokio::test]
    async fn attachment_is_wrapped_for_model_and_marked_for_display() {
        let chat = service(offline()).await;
        let request = ChatRequest {
            file_content: Some("linea 1\nlinea 2".to_string()),
            ..ChatRequest::new("¿Qué opinas?")
        };

        let prepared = chat.prepare(&request).await.unwrap();
        let last = prepared.completion.messages.last().unwrap();
        assert!(last.content.starts_with("[Archivo adjunto]"));
        assert!(last.content.ends_with("Mensaje del usuario: ¿Qué opinas?"));

        let buffer = chat.store().buffer_messages().await.unwrap();
        assert_eq!(buffer[0].content, "¿Qué opinas?\n\n📎 Archivo adjunto");
    }

    #[tokio::test]
    async fn caller_compressed_context_takes_hybrid_path() {
        let chat = service(offline()).await;
        let request = ChatRequest {
            compressed_context: Some("Le gustan los gatos".to_string()),
            max_tokens: Some(800),
            model: Some(String::new()),
            ..ChatRequest::new("¿Y ahora?")
        };

        let prepared = chat.prepare(&request).await.unwrap();
        assert_eq!(prepared.included_turns, None);
        assert_eq!(prepared.completion.model, DEFAULT_CLOUD_MODEL);
        assert_eq!(prepared.completion.max_tokens, 800);
        assert_eq!(
            prepared.completion.messages,
            hybrid_messages("Le gustan los gatos", "¿Y ahora?")
        );
    }

    #[tokio::test]
    async fn hybrid_mode_compresses_server_side() {
        let chat = service(offline()).await.with_local_model(Arc::new(Summarizer));
        fill_buffer(&chat, 12).await;

        let request = ChatRequest {
            mode: Some(RoutingMode::Hybrid),
            ..ChatRequest::new("Cuéntame algo")
        };
        let prepared = chat.prepare(&request).await.unwrap();

        assert_eq!(prepared.completion.messages.len(), 2);
        let system = &prepared.completion.messages[0];
        assert_eq!(system.role, ChatRole::System);
        assert!(system.content.contains("Resumen: charla larga sobre gatos"));
        assert!(system.content.contains("[Mensaje actual: Cuéntame algo]"));
        assert!(prepared.tokens_saved > 0);
        assert_eq!(prepared.local_available, Some(true));
    }

    #[tokio::test]
    async fn hybrid_mode_with_local_model_down_keeps_full_history() {
        let chat = service(offline()).await.with_local_model(unreachable_local());
        fill_buffer(&chat, 12).await;

        let request = ChatRequest {
            mode: Some(RoutingMode::Hybrid),
            ..ChatRequest::new("Hola")
        };
        let prepared = chat.prepare(&request).await.unwrap();

        let messages = &prepared.completion.messages;
        assert_eq!(prepared.local_available, Some(false));
        assert!(prepared.local_missing());
        assert_eq!(prepared.included_turns, Some(12));
        assert_eq!(messages.len(), 14);
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(!messages[0].content.contains("## Conversación reciente:"));
        assert!(messages[1].content.starts_with("mensaje 0 "));
        assert_eq!(messages[13], ChatMessage::user("Hola"));
        assert_eq!(prepared.tokens_saved, 0);
    }

    #[tokio::test]
    async fn cloud_mode_never_checks_the_local_model() {
        let chat = service(offline()).await.with_local_model(unreachable_local());
        let prepared = chat.prepare(&ChatRequest::new("Hola")).await.unwrap();
        assert_eq!(prepared.local_available, None);
        assert!(!prepared.local_missing());
    }

    #[tokio::test]
    async fn missing_key_records_apology() {
        let chat = service(offline()).await;
        let result = chat.start(&ChatRequest::new("Hola")).await;
        let Err(ChatError::Gateway { source, apology }) = result else {
            panic!("expected a gateway error");
        };
        assert!(matches!(source, GatewayError::MissingApiKey));
        assert_eq!(apology, "Lo siento, hubo un error: API key not configured 😔");

        let buffer = chat.store().buffer_messages().await.unwrap();
        let contents: Vec<_> = buffer.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hola", apology.as_str()]);
    }

    #[tokio::test]
    async fn apology_in_hybrid_mode_without_local_model_adds_tip() {
        let chat = service(offline()).await.with_local_model(unreachable_local());
        let request = ChatRequest {
            mode: Some(RoutingMode::Hybrid),
            ..ChatRequest::new("Hola")
        };

        let Err(ChatError::Gateway { apology, .. }) = chat.start(&request).await else {
            panic!("expected a gateway error");
        };
        assert!(apology.starts_with("Lo siento, hubo un error: API key not configured 😔"));
        assert!(apology.ends_with(OLLAMA_TIP));

        let buffer = chat.store().buffer_messages().await.unwrap();
        assert_eq!(buffer[1].content, apology);
    }

    #[tokio::test]
    async fn validation_error_is_not_an_apology() {
        let chat = service(offline()).await;
        let result = chat.start(&ChatRequest::new("")).await;
        assert!(matches!(
            result,
            Err(ChatError::Kaede(KaedeError::Validation(_)))
        ));
        assert!(chat.store().buffer_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn streamed_reply_is_relayed_and_stored() {
        let server = MockServer::start().await;
        let body = sse(&["¡Hola! ", "¿Cómo estás?"]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body.clone()),
            )
            .mount(&server)
            .await;

        let chat = service(GatewayConfig {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            api_key: Some("sk-test".to_string()),
        })
        .await;

        let turn = chat.start(&ChatRequest::new("Hola")).await.unwrap();
        let (tx, rx) = mpsc::channel(64);
        let outcome = chat.relay(turn.stream, tx, turn.prepared.local_missing()).await;
        assert_eq!(outcome, RelayOutcome::Completed("¡Hola! ¿Cómo estás?".to_string()));

        let relayed: Vec<u8> = rx
            .map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await;
        assert_eq!(relayed, body.as_bytes());

        let buffer = chat.store().buffer_messages().await.unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[1].role, Role::Assistant);
        assert_eq!(buffer[1].content, "¡Hola! ¿Cómo estás?");
    }

    #[tokio::test]
    async fn abandoned_relay_stores_nothing() {
        let chat = service(offline()).await;
        let upstream: CompletionStream = stream::iter(vec![Ok(Bytes::from(sse(&["hola"])))]).boxed();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let outcome = chat.relay(upstream, tx, false).await;
        assert_eq!(outcome, RelayOutcome::Abandoned);
        assert!(chat.store().buffer_messages().await.unwrap().is_empty());
    }

    #[test]
    fn apology_wording() {
        assert_eq!(
            apology_for("Failed to get response from OpenAI", false),
            "Lo siento, hubo un error: Failed to get response from OpenAI 😔"
        );
        assert_eq!(
            apology_for("Failed to get response from OpenAI", true),
            format!("Lo siento, hubo un error: Failed to get response from OpenAI 😔{OLLAMA_TIP}")
        );
    }

    #[test]
    fn request_accepts_wire_names() {
        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "message": "hola",
            "maxTokens": 1500,
            "fileContent": "x",
            "compressedContext": null,
            "mode": "pc"
        }))
        .unwrap();
        assert_eq!(request.max_tokens, Some(1500));
        assert_eq!(request.mode, Some(RoutingMode::Hybrid));
        assert_eq!(request.file(), Some("x"));
    }
}
