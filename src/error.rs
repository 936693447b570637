//! Error types for Kaede

use thiserror::Error;

/// Main error type for stores, backups and the chat service
#[derive(Error, Debug)]
pub enum KaedeError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The expected tables are absent from the database
    #[error("Storage not configured: tables have not been created")]
    NotConfigured,

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (missing field, malformed backup)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error (missing credentials, bad address)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for KaedeError {
    fn from(err: serde_json::Error) -> Self {
        KaedeError::Serialization(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, KaedeError>;
