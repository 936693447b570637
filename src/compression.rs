//! # Context Compression (hybrid mode)
//!
//! Flattens memories, recent turns and the current message into a single
//! narrative and asks the local model to condense it. The condensed text then
//! stands in for the whole assembled history of that turn.
//!
//! Compression is best effort: small inputs are returned untouched and any
//! failure of the local model falls back to the raw narrative.

use crate::local_model::LocalModel;
use crate::types::{ChatMessage, Memory, MemoryType, Message, Role};

/// Below this many characters compression would not pay for itself
pub const MIN_COMPRESS_CHARS: usize = 1000;
/// Most recent turns included in the narrative
pub const RECENT_TURNS: usize = 20;
/// Per-turn character cap inside the narrative
pub const TURN_CHAR_LIMIT: usize = 500;
/// Attachment character cap inside the narrative
pub const FILE_CHAR_LIMIT: usize = 2000;
/// Low temperature keeps the summary faithful
pub const COMPRESSION_TEMPERATURE: f32 = 0.3;

const IDENTITY_SLICE: usize = 10;
const EXPERIENCE_SLICE: usize = 5;

pub const COMPRESSION_INSTRUCTIONS: &str = "Eres un asistente de compresión de contexto. \
Tu tarea es condensar conversaciones y memorias para ahorrar tokens.

INSTRUCCIONES:
1. Conserva nombres, fechas, decisiones y emociones clave
2. Conserva la información personal del usuario (gustos, datos, contexto importante)
3. Quita redundancias y fórmulas de cortesía
4. Mantén el tono y el contexto emocional
5. Sé conciso sin perder nada importante

Responde SOLO con el resumen, sin explicaciones.";

/// Inputs of a compression pass
#[derive(Debug, Clone, Copy)]
pub struct CompressionInput<'a> {
    pub memories: &'a [Memory],
    pub recent_messages: &'a [Message],
    pub current_message: &'a str,
    pub file_content: Option<&'a str>,
}

/// What a compression pass produced
#[derive(Debug, Clone, PartialEq)]
pub struct Compression {
    /// Text to place in the system block
    pub context: String,
    /// Estimated tokens saved; zero when skipped or failed
    pub tokens_saved: usize,
    /// Whether the local model actually condensed the narrative
    pub compressed: bool,
}

impl Compression {
    fn passthrough(narrative: String) -> Self {
        Self {
            context: narrative,
            tokens_saved: 0,
            compressed: false,
        }
    }
}

/// Build the flat narrative handed to the local model
pub fn build_narrative(input: &CompressionInput<'_>) -> String {
    let mut out = String::new();

    let core: Vec<&Memory> = input
        .memories
        .iter()
        .filter(|m| m.memory_type == MemoryType::Core)
        .collect();
    let identity: Vec<&Memory> = input
        .memories
        .iter()
        .filter(|m| m.memory_type == MemoryType::Identity)
        .take(IDENTITY_SLICE)
        .collect();
    let experience: Vec<&Memory> = input
        .memories
        .iter()
        .filter(|m| m.memory_type == MemoryType::Experience)
        .take(EXPERIENCE_SLICE)
        .collect();

    if !core.is_empty() {
        out.push_str("## Memorias críticas:\n");
        push_lines(&mut out, &core);
    }
    if !identity.is_empty() {
        out.push_str("\n## Sobre el usuario:\n");
        push_lines(&mut out, &identity);
    }
    if !experience.is_empty() {
        out.push_str("\n## Experiencias recientes:\n");
        push_lines(&mut out, &experience);
    }

    let mut turns: Vec<&Message> = input.recent_messages.iter().collect();
    turns.sort_by_key(|m| m.created_at);
    let skip = turns.len().saturating_sub(RECENT_TURNS);
    let turns = &turns[skip..];

    if !turns.is_empty() {
        out.push_str("\n## Conversación reciente:\n");
        for turn in turns {
            let speaker = match turn.role {
                Role::User => "Usuario",
                Role::Assistant => "Kaede",
            };
            out.push_str(speaker);
            out.push_str(": ");
            out.push_str(&truncate(&turn.content, TURN_CHAR_LIMIT, "..."));
            out.push('\n');
        }
    }

    if let Some(file) = input.file_content.filter(|f| !f.is_empty()) {
        out.push_str("\n## Archivo adjunto:\n");
        out.push_str(&truncate(file, FILE_CHAR_LIMIT, "...[truncado]"));
        out.push('\n');
    }

    out.push_str("\n## Mensaje actual del usuario:\n");
    out.push_str(input.current_message);
    out
}

/// Savings estimate: a quarter of the characters removed, never negative
pub fn estimate_savings(original_chars: usize, compressed_chars: usize) -> usize {
    let removed = original_chars as f64 - compressed_chars as f64;
    (removed / 4.0).round().max(0.0) as usize
}

/// Condense context with a local model
pub struct ContextCompressor<'m> {
    model: &'m dyn LocalModel,
}

impl<'m> ContextCompressor<'m> {
    pub fn new(model: &'m dyn LocalModel) -> Self {
        Self { model }
    }

    /// Never fails: skip or failure both return the raw narrative
    pub async fn compress(&self, input: &CompressionInput<'_>) -> Compression {
        let narrative = build_narrative(input);
        let original_chars = narrative.chars().count();

        if original_chars < MIN_COMPRESS_CHARS {
            tracing::debug!(original_chars, "narrative too small, skipping compression");
            return Compression::passthrough(narrative);
        }

        let request = [
            ChatMessage::system(COMPRESSION_INSTRUCTIONS),
            ChatMessage::user(format!(
                "Resume este contexto de conversación:\n\n{narrative}"
            )),
        ];

        match self.model.complete(&request, COMPRESSION_TEMPERATURE).await {
            Ok(reply) => {
                let compressed = reply.is_some();
                let summary = reply.unwrap_or_else(|| narrative.clone());
                let tokens_saved = estimate_savings(original_chars, summary.chars().count());
                tracing::debug!(original_chars, tokens_saved, compressed, "context compressed");
                Compression {
                    context: format!("{summary}\n\n[Mensaje actual: {}]", input.current_message),
                    tokens_saved,
                    compressed,
                }
            }
            Err(e) => {
                tracing::warn!("context compression failed, sending raw narrative: {e}");
                Compression::passthrough(narrative)
            }
        }
    }
}

fn push_lines(out: &mut String, memories: &[&Memory]) {
    for memory in memories {
        out.push_str("- ");
        out.push_str(&memory.content);
        out.push('\n');
    }
}

fn truncate(text: &str, limit: usize, marker: &str) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{marker}", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_model::{LocalModelClient, LocalModelConfig, LocalModelError};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    struct FixedModel {
        reply: std::result::Result<Option<String>, ()>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl FixedModel {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(Some(text.to_string())),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LocalModel for FixedModel {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            temperature: f32,
        ) -> Result<Option<String>, LocalModelError> {
            assert_eq!(temperature, COMPRESSION_TEMPERATURE);
            self.seen.lock().unwrap().push(messages.to_vec());
            self.reply
                .clone()
                .map_err(|_| LocalModelError::Unreachable("down".to_string()))
        }

        async fn is_available(&self) -> bool {
            self.reply.is_ok()
        }
    }

    fn long_history(count: usize) -> Vec<Message> {
        let start = Utc::now() - Duration::hours(1);
        (0..count)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Message::new(role, format!("turno {i:02} {}", "bla ".repeat(30)))
                    .with_created_at(start + Duration::seconds(i as i64))
            })
            .collect()
    }

    #[test]
    fn narrative_sections_follow_fixed_order() {
        let memories = vec![
            Memory::new("id", MemoryType::Identity),
            Memory::new("core", MemoryType::Core),
            Memory::new("exp", MemoryType::Experience),
        ];
        let messages = vec![Message::new(Role::User, "hola")];
        let narrative = build_narrative(&CompressionInput {
            memories: &memories,
            recent_messages: &messages,
            current_message: "¿Qué tal?",
            file_content: Some("datos"),
        });

        assert_eq!(
            narrative,
            "## Memorias críticas:\n- core\n\
             \n## Sobre el usuario:\n- id\n\
             \n## Experiencias recientes:\n- exp\n\
             \n## Conversación reciente:\nUsuario: hola\n\
             \n## Archivo adjunto:\ndatos\n\
             \n## Mensaje actual del usuario:\n¿Qué tal?"
        );
    }

    #[test]
    fn narrative_truncates_and_slices() {
        let memories: Vec<Memory> = (0..12)
            .map(|i| Memory::new(format!("identity {i}"), MemoryType::Identity))
            .collect();
        let mut messages = long_history(25);
        messages.push(Message::new(Role::Assistant, "x".repeat(600)).with_created_at(Utc::now()));
        let file = "f".repeat(2500);

        let narrative = build_narrative(&CompressionInput {
            memories: &memories,
            recent_messages: &messages,
            current_message: "hola",
            file_content: Some(&file),
        });

        assert!(narrative.contains("- identity 9\n"));
        assert!(!narrative.contains("- identity 10\n"));
        assert!(!narrative.contains("turno 05"));
        assert!(narrative.contains("turno 06"));
        assert!(narrative.contains(&format!("Kaede: {}...\n", "x".repeat(500))));
        assert!(narrative.contains(&format!("{}...[truncado]\n", "f".repeat(2000))));
    }

    #[test]
    fn savings_are_rounded_and_clamped() {
        assert_eq!(estimate_savings(1000, 200), 200);
        assert_eq!(estimate_savings(1002, 1000), 1);
        assert_eq!(estimate_savings(100, 500), 0);
    }

    #[tokio::test]
    async fn small_input_skips_the_model() {
        let model = FixedModel::replying("never used");
        let compressor = ContextCompressor::new(&model);
        let input = CompressionInput {
            memories: &[],
            recent_messages: &[],
            current_message: "Hola",
            file_content: None,
        };

        let result = compressor.compress(&input).await;
        assert_eq!(result.context, build_narrative(&input));
        assert_eq!(result.tokens_saved, 0);
        assert!(!result.compressed);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn successful_compression_reports_savings() {
        let model = FixedModel::replying("Resumen breve");
        let history = long_history(20);
        let input = CompressionInput {
            memories: &[],
            recent_messages: &history,
            current_message: "Hola",
            file_content: None,
        };
        let original = build_narrative(&input).chars().count();
        assert!(original >= MIN_COMPRESS_CHARS);

        let result = ContextCompressor::new(&model).compress(&input).await;
        assert!(result.compressed);
        assert_eq!(result.context, "Resumen breve\n\n[Mensaje actual: Hola]");
        assert_eq!(result.tokens_saved, estimate_savings(original, "Resumen breve".len()));

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0][0].content, COMPRESSION_INSTRUCTIONS);
        assert!(seen[0][1].content.starts_with("Resume este contexto de conversación:\n\n"));
    }

    #[tokio::test]
    async fn empty_reply_is_not_reported_as_compressed() {
        let model = FixedModel {
            reply: Ok(None),
            seen: Mutex::new(Vec::new()),
        };
        let history = long_history(20);
        let input = CompressionInput {
            memories: &[],
            recent_messages: &history,
            current_message: "Hola",
            file_content: None,
        };
        let narrative = build_narrative(&input);

        let result = ContextCompressor::new(&model).compress(&input).await;
        assert!(!result.compressed);
        assert_eq!(result.context, format!("{narrative}\n\n[Mensaje actual: Hola]"));
        assert_eq!(result.tokens_saved, 0);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn failure_falls_back_to_raw_narrative() {
        let model = FixedModel::failing();
        let history = long_history(20);
        let input = CompressionInput {
            memories: &[],
            recent_messages: &history,
            current_message: "Hola",
            file_content: None,
        };

        let result = ContextCompressor::new(&model).compress(&input).await;
        assert_eq!(result.context, build_narrative(&input));
        assert_eq!(result.tokens_saved, 0);
        assert!(!result.compressed);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn network_failure_never_propagates() {
        let client = LocalModelClient::new(LocalModelConfig {
            ollama_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        });
        let history = long_history(20);
        let input = CompressionInput {
            memories: &[],
            recent_messages: &history,
            current_message: "Hola",
            file_content: None,
        };

        let result = ContextCompressor::new(&client).compress(&input).await;
        assert_eq!(result.context, build_narrative(&input));
        assert_eq!(result.tokens_saved, 0);
    }
}
