//! Memory, message and note types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for memories
pub type MemoryId = String;

/// Unique identifier for conversation turns
pub type MessageId = String;

/// Highest importance a memory can carry
pub const MAX_IMPORTANCE: i64 = 5;

/// Importance given to memories created without an explicit value
pub const DEFAULT_IMPORTANCE: i64 = 3;

/// A durable fact the assistant should recall
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    /// Unique identifier
    pub id: MemoryId,
    /// Memory tier
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    /// The memory content
    pub content: String,
    /// Importance (0 - 5)
    pub importance: i64,
    /// When the memory was created
    pub created_at: DateTime<Utc>,
    /// When the memory was last used; drives recency ordering within a tier
    pub last_used_at: DateTime<Utc>,
    /// Number of times accessed (informational)
    pub access_count: i64,
}

impl Memory {
    /// Create a new memory with the tier's default importance
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            memory_type,
            content: content.into(),
            importance: memory_type.default_importance(),
            created_at: now,
            last_used_at: now,
            access_count: 0,
        }
    }

    /// Set custom importance
    pub fn with_importance(mut self, importance: i64) -> Self {
        self.importance = importance.clamp(0, MAX_IMPORTANCE);
        self
    }

    /// Set the last-used timestamp
    pub fn with_last_used_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_used_at = at;
        self
    }
}

/// Memory tiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Always included in every assembled context
    Core,
    /// Stable facts about the user
    Identity,
    /// Episodic, recency-ranked
    Experience,
}

impl MemoryType {
    /// Get default importance for this type
    pub fn default_importance(&self) -> i64 {
        match self {
            MemoryType::Core => MAX_IMPORTANCE,
            MemoryType::Identity | MemoryType::Experience => DEFAULT_IMPORTANCE,
        }
    }

    /// Parse from the stored/wire representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "core" => Some(MemoryType::Core),
            "identity" => Some(MemoryType::Identity),
            "experience" => Some(MemoryType::Experience),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Core => "core",
            MemoryType::Identity => "identity",
            MemoryType::Experience => "experience",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of a stored conversation turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of dialogue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Cleared in bulk when the buffer is archived
    pub is_in_buffer: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            is_in_buffer: true,
        }
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// A user-curated excerpt of a past assistant message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedNote {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl SavedNote {
    pub fn new(content: impl Into<String>, message_id: Option<MessageId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_id,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Role tag of a prompt entry sent to a completion provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<Role> for ChatRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        }
    }
}

/// A role-tagged text block ready for a completion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

/// Input for creating a memory
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMemoryInput {
    pub content: String,
    #[serde(rename = "type", default = "default_memory_type")]
    pub memory_type: MemoryType,
    pub importance: Option<i64>,
}

fn default_memory_type() -> MemoryType {
    MemoryType::Identity
}

impl CreateMemoryInput {
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            content: content.into(),
            memory_type,
            importance: None,
        }
    }

    pub fn with_importance(mut self, importance: i64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn into_memory(self) -> Memory {
        let memory = Memory::new(self.content, self.memory_type);
        match self.importance {
            Some(importance) => memory.with_importance(importance),
            None => memory,
        }
    }
}

/// Partial update for a memory; absent fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateMemoryInput {
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: Option<MemoryType>,
    pub importance: Option<i64>,
}

impl UpdateMemoryInput {
    pub fn apply(self, memory: &mut Memory) {
        if let Some(content) = self.content {
            memory.content = content;
        }
        if let Some(memory_type) = self.memory_type {
            memory.memory_type = memory_type;
        }
        if let Some(importance) = self.importance {
            memory.importance = importance.clamp(0, MAX_IMPORTANCE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_memories_default_to_max_importance() {
        assert_eq!(Memory::new("x", MemoryType::Core).importance, 5);
        assert_eq!(Memory::new("x", MemoryType::Identity).importance, 3);
        assert_eq!(Memory::new("x", MemoryType::Experience).with_importance(9).importance, 5);
    }

    #[test]
    fn memory_serializes_type_field() {
        let memory = Memory::new("Odia el cilantro", MemoryType::Core);
        let value = serde_json::to_value(&memory).unwrap();
        assert_eq!(value["type"], "core");
        assert!(value.get("memory_type").is_none());
    }

    #[test]
    fn update_input_only_touches_present_fields() {
        let mut memory = Memory::new("old", MemoryType::Identity);
        UpdateMemoryInput {
            importance: Some(-2),
            ..Default::default()
        }
        .apply(&mut memory);
        assert_eq!(memory.content, "old");
        assert_eq!(memory.importance, 0);
    }
}
