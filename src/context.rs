//! # Context Assembly
//!
//! Builds the message list sent to the cloud model from the memory tiers and
//! the conversation buffer, keeping the estimated token count under budget.
//!
//! Layout of the result:
//! - one `system` entry: persona preamble, then the core, identity and
//!   experience sections (each omitted when empty)
//! - the newest buffered turns that fit, in chronological order
//! - the new user turn

use crate::types::{ChatMessage, Memory, MemoryType, Message};

/// Fixed persona preamble that opens every system block
pub const PERSONA_PREAMBLE: &str = "Eres Kaede, la compañera de conversación de {{user}}. \
Tu carácter está inspirado en Ukyo Kuonji de Ranma 1/2: leal, directa, cálida y algo \
competitiva, con ese mismo trato cercano reservado solo para {{user}}. Usa emojis de vez \
en cuando para expresar emociones. Recuerdas lo que habéis hablado y lo mencionas cuando \
viene al caso.";

pub const CORE_HEADER: &str = "## Recuerdos Críticos (Nunca olvidar):";
pub const IDENTITY_HEADER: &str = "## Identidad y conocimientos sobre el usuario:";
pub const EXPERIENCE_HEADER: &str = "## Experiencias recientes:";
pub const COMPRESSED_HEADER: &str = "## Contexto de la conversación (resumido):";

/// Identity memories included per prompt
pub const IDENTITY_LIMIT: usize = 10;
/// Experience memories included per prompt
pub const EXPERIENCE_LIMIT: usize = 5;
/// Tokens held back for the model's reply
pub const REPLY_RESERVE_TOKENS: i64 = 500;
/// Budget used when the caller does not send one
pub const DEFAULT_MAX_TOKENS: i64 = 2000;

/// Estimate tokens as one per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// The new user turn, optionally carrying the text of an attached file
#[derive(Debug, Clone, PartialEq)]
pub struct UserTurn {
    pub message: String,
    pub attachment: Option<String>,
}

impl UserTurn {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, file_content: impl Into<String>) -> Self {
        self.attachment = Some(file_content.into());
        self
    }

    /// Text submitted to the model for this turn
    pub fn render(&self) -> String {
        match self.attachment.as_deref() {
            Some(file) if !file.is_empty() => format!(
                "[Archivo adjunto]\n\nContenido del archivo:\n{file}\n\n---\n\nMensaje del usuario: {}",
                self.message
            ),
            _ => self.message.clone(),
        }
    }
}

/// Result of an assembly pass
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub system_tokens: usize,
    pub history_tokens: usize,
    /// Number of buffered turns that made it into the prompt
    pub included_turns: usize,
}

impl AssembledContext {
    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }
}

/// Token-budgeted prompt builder
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    /// Total budget, reply reserve included
    pub max_tokens: i64,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl ContextAssembler {
    pub fn new(max_tokens: i64) -> Self {
        Self { max_tokens }
    }

    /// Render the system block from the memory tiers
    pub fn system_block(memories: &[Memory]) -> String {
        let mut system = String::from(PERSONA_PREAMBLE);

        let core: Vec<&Memory> = of_type(memories, MemoryType::Core).collect();
        push_section(&mut system, CORE_HEADER, &core);

        let identity = most_recent(memories, MemoryType::Identity, IDENTITY_LIMIT);
        push_section(&mut system, IDENTITY_HEADER, &identity);

        let experience = most_recent(memories, MemoryType::Experience, EXPERIENCE_LIMIT);
        push_section(&mut system, EXPERIENCE_HEADER, &experience);

        system
    }

    /// Assemble the full message list. Never fails; a tight budget only
    /// drops history.
    pub fn assemble(&self, memories: &[Memory], buffer: &[Message], turn: &UserTurn) -> AssembledContext {
        let system = Self::system_block(memories);
        let system_tokens = estimate_tokens(&system);
        let remaining = self.max_tokens - system_tokens as i64 - REPLY_RESERVE_TOKENS;

        let mut chronological: Vec<&Message> = buffer.iter().collect();
        chronological.sort_by_key(|m| m.created_at);

        let mut history_tokens = 0usize;
        let mut first_included = chronological.len();
        for (idx, message) in chronological.iter().enumerate().rev() {
            let cost = estimate_tokens(&message.content);
            if (history_tokens + cost) as i64 > remaining {
                break;
            }
            history_tokens += cost;
            first_included = idx;
        }
        let history = &chronological[first_included..];

        tracing::debug!(
            max_tokens = self.max_tokens,
            system_tokens,
            remaining,
            history_tokens,
            included = history.len(),
            buffered = chronological.len(),
            "assembled context"
        );

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(history.iter().map(|m| ChatMessage {
            role: m.role.into(),
            content: m.content.clone(),
        }));
        messages.push(ChatMessage::user(turn.render()));

        AssembledContext {
            messages,
            system_tokens,
            history_tokens,
            included_turns: history.len(),
        }
    }
}

/// Message list for hybrid mode: the condensed narrative replaces both the
/// memory sections and the role-separated history
pub fn hybrid_messages(compressed_context: &str, message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!(
            "{PERSONA_PREAMBLE}\n\n{COMPRESSED_HEADER}\n{compressed_context}"
        )),
        ChatMessage::user(message),
    ]
}

fn of_type(memories: &[Memory], memory_type: MemoryType) -> impl Iterator<Item = &Memory> {
    memories.iter().filter(move |m| m.memory_type == memory_type)
}

fn most_recent(memories: &[Memory], memory_type: MemoryType, limit: usize) -> Vec<&Memory> {
    let mut selected: Vec<&Memory> = of_type(memories, memory_type).collect();
    // Stable sort keeps input order on ties
    selected.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
    selected.truncate(limit);
    selected
}

fn push_section(system: &mut String, header: &str, memories: &[&Memory]) {
    if memories.is_empty() {
        return;
    }
    system.push_str("\n\n");
    system.push_str(header);
    system.push('\n');
    for memory in memories {
        system.push_str("- ");
        system.push_str(&memory.content);
        system.push('\n');
    }
}
