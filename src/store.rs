//! Memory, conversation-buffer and saved-note storage using SQLite

use crate::capability::CapabilityCache;
use crate::error::{KaedeError, Result};
use crate::types::{Memory, MemoryType, Message, Role, SavedNote};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

const MEMORY_COLUMNS: &str =
    "id, memory_type, content, importance, created_at, last_used_at, access_count";
const MESSAGE_COLUMNS: &str = "id, role, content, created_at, is_in_buffer";
const NOTE_COLUMNS: &str = "id, message_id, content, created_at";

/// Store for memories, buffered turns and saved notes
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
    capabilities: Arc<CapabilityCache>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl ConversationStore {
    /// Create a store over an existing pool with an injected capability cache
    pub fn new(pool: SqlitePool, capabilities: Arc<CapabilityCache>) -> Arc<Self> {
        Arc::new(Self { pool, capabilities })
    }

    /// Get a reference to the SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn capabilities(&self) -> &Arc<CapabilityCache> {
        &self.capabilities
    }

    /// Whether the expected tables exist (probed once, then cached)
    pub async fn tables_ready(&self) -> bool {
        let pool = self.pool.clone();
        self.capabilities
            .check_once(|| async move {
                sqlx::query("SELECT id FROM messages LIMIT 0")
                    .fetch_all(&pool)
                    .await
                    .is_ok()
            })
            .await
    }

    /// Fail with `NotConfigured` when the tables are absent
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.tables_ready().await {
            Ok(())
        } else {
            Err(KaedeError::NotConfigured)
        }
    }

    /// Create an in-memory store with migrations applied
    pub async fn connect_in_memory() -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .create_if_missing(true);

        let pool = sqlx::pool::PoolOptions::<sqlx::Sqlite>::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::new(pool, Arc::new(CapabilityCache::new())))
    }

    async fn classify(&self, err: sqlx::Error) -> KaedeError {
        if is_missing_table(&err) {
            tracing::warn!("storage tables missing: {err}");
            self.capabilities.mark_missing().await;
            KaedeError::NotConfigured
        } else {
            KaedeError::Database(err)
        }
    }

    // ─── Memories ──────────────────────────────────────────────────────────

    /// Save a new memory
    pub async fn save_memory(&self, memory: &Memory) -> Result<()> {
        self.ensure_ready().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO memories (
                id, memory_type, content, importance, created_at, last_used_at, access_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&memory.id)
        .bind(memory.memory_type.as_str())
        .bind(&memory.content)
        .bind(memory.importance)
        .bind(memory.created_at)
        .bind(memory.last_used_at)
        .bind(memory.access_count)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Load a memory by ID
    pub async fn load_memory(&self, id: &str) -> Result<Option<Memory>> {
        self.ensure_ready().await?;

        let query = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?");
        let row = match sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            Err(e) => return Err(self.classify(e).await),
        };

        row.as_ref().map(row_to_memory).transpose()
    }

    /// Update an existing memory
    pub async fn update_memory(&self, memory: &Memory) -> Result<bool> {
        self.ensure_ready().await?;

        let result = sqlx::query(
            r#"
            UPDATE memories
            SET memory_type = ?, content = ?, importance = ?, last_used_at = ?, access_count = ?
            WHERE id = ?
            "#,
        )
        .bind(memory.memory_type.as_str())
        .bind(&memory.content)
        .bind(memory.importance)
        .bind(memory.last_used_at)
        .bind(memory.access_count)
        .bind(&memory.id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Delete a memory permanently
    pub async fn delete_memory(&self, id: &str) -> Result<bool> {
        self.ensure_ready().await?;

        match sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
        {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// All memories, most important first, then most recently used
    pub async fn list_memories(&self) -> Result<Vec<Memory>> {
        self.ensure_ready().await?;

        let query = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories ORDER BY importance DESC, last_used_at DESC"
        );
        match sqlx::query(&query).fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().map(row_to_memory).collect(),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Memories of one tier, most recently used first
    pub async fn get_by_type(&self, memory_type: MemoryType, limit: i64) -> Result<Vec<Memory>> {
        self.ensure_ready().await?;

        let query = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE memory_type = ? \
             ORDER BY last_used_at DESC LIMIT ?"
        );
        match sqlx::query(&query)
            .bind(memory_type.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows.iter().map(row_to_memory).collect(),
            Err(e) => Err(self.classify(e).await),
        }
    }

    // ─── Conversation buffer ───────────────────────────────────────────────

    /// Append a turn to the buffer
    pub async fn add_message(&self, role: Role, content: &str) -> Result<Message> {
        self.ensure_ready().await?;

        let message = Message::new(role, content);
        self.insert_message(&message).await?;
        Ok(message)
    }

    /// Insert a fully-formed turn (used by tests and imports of history)
    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, role, content, created_at, is_in_buffer)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .bind(message.is_in_buffer)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Turns currently in the buffer, oldest first
    pub async fn buffer_messages(&self) -> Result<Vec<Message>> {
        self.ensure_ready().await?;

        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE is_in_buffer = 1 ORDER BY created_at ASC"
        );
        match sqlx::query(&query).fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().map(row_to_message).collect(),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Archive every buffered turn; returns how many were archived
    pub async fn clear_buffer(&self) -> Result<u64> {
        self.ensure_ready().await?;

        match sqlx::query("UPDATE messages SET is_in_buffer = 0 WHERE is_in_buffer = 1")
            .execute(&self.pool)
            .await
        {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Every stored turn, buffered or archived, newest first
    pub async fn history(&self, limit: i64, offset: i64) -> Result<Vec<Message>> {
        self.ensure_ready().await?;

        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        match sqlx::query(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows.iter().map(row_to_message).collect(),
            Err(e) => Err(self.classify(e).await),
        }
    }

    // ─── Saved notes ───────────────────────────────────────────────────────

    /// Save a note
    pub async fn save_note(&self, note: &SavedNote) -> Result<()> {
        self.ensure_ready().await?;

        let result = sqlx::query(
            "INSERT INTO saved_notes (id, message_id, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&note.id)
        .bind(note.message_id.as_ref())
        .bind(&note.content)
        .bind(note.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// All notes, newest first
    pub async fn list_notes(&self) -> Result<Vec<SavedNote>> {
        self.ensure_ready().await?;

        let query = format!("SELECT {NOTE_COLUMNS} FROM saved_notes ORDER BY created_at DESC");
        match sqlx::query(&query).fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().map(row_to_note).collect(),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Delete a note
    pub async fn delete_note(&self, id: &str) -> Result<bool> {
        self.ensure_ready().await?;

        match sqlx::query("DELETE FROM saved_notes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
        {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) => Err(self.classify(e).await),
        }
    }
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("no such table"),
        _ => false,
    }
}

/// Helper: Convert database row to Memory
fn row_to_memory(row: &SqliteRow) -> Result<Memory> {
    let type_str: String = row.try_get("memory_type")?;
    let memory_type = MemoryType::parse(&type_str)
        .ok_or_else(|| KaedeError::Serialization(format!("unknown memory type: {type_str}")))?;

    Ok(Memory {
        id: row.try_get("id")?,
        memory_type,
        content: row.try_get("content")?,
        importance: row.try_get("importance")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
        access_count: row.try_get("access_count")?,
    })
}

/// Helper: Convert database row to Message
fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let role_str: String = row.try_get("role")?;
    let role = Role::parse(&role_str)
        .ok_or_else(|| KaedeError::Serialization(format!("unknown role: {role_str}")))?;

    Ok(Message {
        id: row.try_get("id")?,
        role,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        is_in_buffer: row.try_get("is_in_buffer")?,
    })
}

/// Helper: Convert database row to SavedNote
fn row_to_note(row: &SqliteRow) -> Result<SavedNote> {
    Ok(SavedNote {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn memory_crud_round_trip() {
        let store = ConversationStore::connect_in_memory().await.unwrap();

        let mut memory = Memory::new("Le gusta el okonomiyaki", MemoryType::Identity);
        store.save_memory(&memory).await.unwrap();

        let loaded = store.load_memory(&memory.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, memory.content);
        assert_eq!(loaded.memory_type, MemoryType::Identity);
        assert_eq!(loaded.importance, 3);

        memory.content = "Le encanta el okonomiyaki".to_string();
        memory.importance = 4;
        assert!(store.update_memory(&memory).await.unwrap());
        let loaded = store.load_memory(&memory.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "Le encanta el okonomiyaki");
        assert_eq!(loaded.importance, 4);

        assert!(store.delete_memory(&memory.id).await.unwrap());
        assert!(store.load_memory(&memory.id).await.unwrap().is_none());
        assert!(!store.delete_memory(&memory.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_orders_by_importance_then_recency() {
        let store = ConversationStore::connect_in_memory().await.unwrap();
        let now = Utc::now();

        let low = Memory::new("low", MemoryType::Experience).with_importance(1);
        let old_high = Memory::new("old high", MemoryType::Identity)
            .with_importance(4)
            .with_last_used_at(now - Duration::days(2));
        let new_high = Memory::new("new high", MemoryType::Identity)
            .with_importance(4)
            .with_last_used_at(now);
        for m in [&low, &old_high, &new_high] {
            store.save_memory(m).await.unwrap();
        }

        let contents: Vec<String> = store
            .list_memories()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["new high", "old high", "low"]);

        let identities = store.get_by_type(MemoryType::Identity, 1).await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].content, "new high");
    }

    #[tokio::test]
    async fn clearing_the_buffer_archives_without_deleting() {
        let store = ConversationStore::connect_in_memory().await.unwrap();

        store.add_message(Role::User, "Hola").await.unwrap();
        store.add_message(Role::Assistant, "¡Hola, cariño!").await.unwrap();
        assert_eq!(store.buffer_messages().await.unwrap().len(), 2);

        assert_eq!(store.clear_buffer().await.unwrap(), 2);
        assert!(store.buffer_messages().await.unwrap().is_empty());

        let history = store.history(50, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| !m.is_in_buffer));
    }

    #[tokio::test]
    async fn buffer_is_chronological() {
        let store = ConversationStore::connect_in_memory().await.unwrap();
        let now = Utc::now();

        let second = Message::new(Role::Assistant, "second").with_created_at(now);
        let first = Message::new(Role::User, "first").with_created_at(now - Duration::seconds(5));
        store.insert_message(&second).await.unwrap();
        store.insert_message(&first).await.unwrap();

        let buffer = store.buffer_messages().await.unwrap();
        assert_eq!(buffer[0].content, "first");
        assert_eq!(buffer[1].content, "second");
    }

    #[tokio::test]
    async fn notes_crud() {
        let store = ConversationStore::connect_in_memory().await.unwrap();

        let note = SavedNote::new("Receta de okonomiyaki", Some("msg-1".to_string()));
        store.save_note(&note).await.unwrap();
        let notes = store.list_notes().await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message_id.as_deref(), Some("msg-1"));

        assert!(store.delete_note(&note.id).await.unwrap());
        assert!(store.list_notes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_tables_report_not_configured() {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = sqlx::pool::PoolOptions::<sqlx::Sqlite>::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let store = ConversationStore::new(pool, Arc::new(CapabilityCache::new()));

        assert!(!store.tables_ready().await);
        assert!(matches!(
            store.buffer_messages().await,
            Err(KaedeError::NotConfigured)
        ));

        sqlx::migrate!("./migrations").run(store.pool()).await.unwrap();
        // Still cached as missing until someone invalidates
        assert!(!store.tables_ready().await);
        store.capabilities().invalidate().await;
        assert!(store.tables_ready().await);
        assert!(store.buffer_messages().await.unwrap().is_empty());
    }
}
