//! # Kaede - companion backend with tiered memory
//!
//! Persists the conversation buffer, a three-tier memory store and saved
//! notes in SQLite, builds token-budgeted prompts from them, optionally
//! condenses context with a local model, and relays streamed completions
//! from a cloud provider.

pub mod backup;
pub mod capability;
pub mod chat;
pub mod compression;
pub mod context;
pub mod error;
pub mod gateway;
pub mod local_model;
pub mod settings;
pub mod speech;
pub mod store;
pub mod stream;
pub mod types;

pub use backup::{
    create_backup, import_backup, parse_backup, validate_backup, BackupData, BackupMemory,
    BackupNote, ImportReport, BACKUP_VERSION,
};
pub use capability::CapabilityCache;
pub use chat::{
    apology_for, display_text, ChatError, ChatRequest, ChatService, ChatTurn, PreparedTurn,
    RelayOutcome,
};
pub use compression::{build_narrative, Compression, CompressionInput, ContextCompressor};
pub use context::{
    estimate_tokens, hybrid_messages, AssembledContext, ContextAssembler, UserTurn,
    DEFAULT_MAX_TOKENS,
};
pub use error::{KaedeError, Result};
pub use gateway::{CompletionGateway, CompletionRequest, CompletionStream, GatewayConfig, GatewayError};
pub use local_model::{LocalModel, LocalModelClient, LocalModelConfig, LocalModelError, Probe};
pub use settings::{RoutingMode, Settings, Theme, VoiceSettings};
pub use speech::clean_for_speech;
pub use store::ConversationStore;
pub use stream::DeltaParser;
pub use types::{
    ChatMessage, ChatRole, CreateMemoryInput, Memory, MemoryId, MemoryType, Message, MessageId,
    Role, SavedNote, UpdateMemoryInput,
};

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Database file inside the data directory
pub const DATABASE_FILE: &str = "kaede.db";

/// Main entry point: storage plus the data directory it lives in
#[derive(Clone)]
pub struct Kaede {
    store: Arc<ConversationStore>,
    data_dir: PathBuf,
}

impl std::fmt::Debug for Kaede {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kaede")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl Kaede {
    /// Open (or create) the data directory and apply migrations
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(data_dir, true).await
    }

    /// Open the data directory. With `auto_migrate` off, a fresh database
    /// stays empty and every storage call reports `NotConfigured` until
    /// [`Kaede::migrate`] runs.
    pub async fn open(data_dir: impl AsRef<Path>, auto_migrate: bool) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(DATABASE_FILE))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        if auto_migrate {
            sqlx::migrate!("./migrations").run(&pool).await?;
        }

        let store = ConversationStore::new(pool, Arc::new(CapabilityCache::new()));
        tracing::debug!(data_dir = %data_dir.display(), auto_migrate, "storage opened");

        Ok(Self { store, data_dir })
    }

    /// Create the tables and forget any cached "missing" verdict
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.store.pool()).await?;
        self.store.capabilities().invalidate().await;
        Ok(())
    }

    /// Re-probe for the tables, e.g. after they were created externally
    pub async fn recheck_setup(&self) -> bool {
        self.store.capabilities().invalidate().await;
        self.store.tables_ready().await
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        Settings::path_in(&self.data_dir)
    }

    pub fn load_settings(&self) -> Settings {
        Settings::load(self.settings_path())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        settings.save(self.settings_path())
    }

    /// Chat service wired to this store
    pub fn chat_service(&self, gateway: Arc<CompletionGateway>) -> ChatService {
        ChatService::new(Arc::clone(&self.store), gateway)
    }

    /// Snapshot every memory and note
    pub async fn export_backup(&self) -> Result<BackupData> {
        let memories = self.store.list_memories().await?;
        let notes = self.store.list_notes().await?;
        Ok(create_backup(&memories, &notes))
    }

    pub async fn import_backup(&self, backup: &BackupData) -> Result<ImportReport> {
        import_backup(&self.store, backup).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_without_migration_reports_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let kaede = Kaede::open(dir.path(), false).await.unwrap();

        assert!(matches!(
            kaede.store().list_memories().await,
            Err(KaedeError::NotConfigured)
        ));
        assert!(!kaede.recheck_setup().await);

        kaede.migrate().await.unwrap();
        assert!(kaede.store().list_memories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_then_import_into_fresh_directory() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = Kaede::new(source_dir.path()).await.unwrap();
        source
            .store()
            .save_memory(&Memory::new("Cumple el 3 de abril", MemoryType::Identity))
            .await
            .unwrap();
        source
            .store()
            .save_note(&SavedNote::new("Poema del lunes", None))
            .await
            .unwrap();

        let json = backup::to_json(&source.export_backup().await.unwrap()).unwrap();

        let target_dir = tempfile::tempdir().unwrap();
        let target = Kaede::new(target_dir.path()).await.unwrap();
        let report = target.import_backup(&parse_backup(&json).unwrap()).await.unwrap();
        assert_eq!(report.memories_added, 1);
        assert_eq!(report.notes_added, 1);

        let memories = target.store().list_memories().await.unwrap();
        assert_eq!(memories[0].content, "Cumple el 3 de abril");
    }

    #[tokio::test]
    async fn settings_live_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let kaede = Kaede::new(dir.path()).await.unwrap();
        let settings = Settings {
            theme: Theme::Dark,
            ..Settings::default()
        };
        kaede.save_settings(&settings).unwrap();
        assert!(dir.path().join("settings.json").exists());
        assert_eq!(kaede.load_settings().theme, Theme::Dark);
    }
}
