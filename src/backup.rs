//! Backup export and import for memories and saved notes

use crate::error::{KaedeError, Result};
use crate::store::ConversationStore;
use crate::types::{Memory, MemoryType, SavedNote, MAX_IMPORTANCE};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{info, warn};

pub const BACKUP_VERSION: &str = "1.0";

/// Portable backup document. Ids and note-to-message links are dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    pub version: String,
    pub exported_at: String,
    pub memories: Vec<BackupMemory>,
    pub saved_notes: Vec<BackupNote>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupMemory {
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupNote {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Memory> for BackupMemory {
    fn from(memory: &Memory) -> Self {
        Self {
            memory_type: memory.memory_type,
            content: memory.content.clone(),
            importance: Some(memory.importance),
            created_at: Some(memory.created_at),
            last_used_at: Some(memory.last_used_at),
            access_count: Some(memory.access_count),
        }
    }
}

impl From<&SavedNote> for BackupNote {
    fn from(note: &SavedNote) -> Self {
        Self {
            content: note.content.clone(),
            created_at: Some(note.created_at),
        }
    }
}

/// Snapshot memories and notes into a backup document
pub fn create_backup(memories: &[Memory], notes: &[SavedNote]) -> BackupData {
    BackupData {
        version: BACKUP_VERSION.to_string(),
        exported_at: Utc::now().to_rfc3339(),
        memories: memories.iter().map(BackupMemory::from).collect(),
        saved_notes: notes.iter().map(BackupNote::from).collect(),
    }
}

/// Pretty-printed JSON, as written to disk
pub fn to_json(backup: &BackupData) -> Result<String> {
    Ok(serde_json::to_string_pretty(backup)?)
}

/// `kaede-backup-YYYY-MM-DD.json`
pub fn file_name(date: NaiveDate) -> String {
    format!("kaede-backup-{}.json", date.format("%Y-%m-%d"))
}

/// File name for a backup taken today (UTC)
pub fn todays_file_name() -> String {
    file_name(Utc::now().date_naive())
}

fn invalid(message: &str) -> KaedeError {
    KaedeError::Validation(message.to_string())
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn timestamp(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    let raw = value.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Check an untrusted JSON document and extract the backup it carries.
///
/// Checks run in a fixed order and the first failure wins. Unknown fields
/// are ignored, and timestamps that fail to parse are dropped rather than
/// rejected.
pub fn validate_backup(data: &Value) -> Result<BackupData> {
    let root = data
        .as_object()
        .ok_or_else(|| invalid("Archivo inválido: no es un objeto JSON"))?;

    let version = root
        .get("version")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("Archivo inválido: falta versión"))?;

    let exported_at = root
        .get("exportedAt")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("Archivo inválido: falta fecha de exportación"))?;

    let memories = root
        .get("memories")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("Archivo inválido: memorias deben ser un arreglo"))?;

    let notes = root
        .get("savedNotes")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("Archivo inválido: notas deben ser un arreglo"))?;

    let mut backup = BackupData {
        version: version.to_string(),
        exported_at: exported_at.to_string(),
        memories: Vec::with_capacity(memories.len()),
        saved_notes: Vec::with_capacity(notes.len()),
    };

    for memory in memories {
        let content = non_empty_str(memory, "content")
            .ok_or_else(|| invalid("Memoria inválida: falta contenido"))?;
        let memory_type = memory
            .get("type")
            .and_then(Value::as_str)
            .and_then(MemoryType::parse)
            .ok_or_else(|| invalid("Memoria inválida: tipo incorrecto"))?;

        backup.memories.push(BackupMemory {
            memory_type,
            content: content.to_string(),
            importance: memory.get("importance").and_then(Value::as_i64),
            created_at: timestamp(memory, "created_at"),
            last_used_at: timestamp(memory, "last_used_at"),
            access_count: memory.get("access_count").and_then(Value::as_i64),
        });
    }

    for note in notes {
        let content =
            non_empty_str(note, "content").ok_or_else(|| invalid("Nota inválida: falta contenido"))?;
        backup.saved_notes.push(BackupNote {
            content: content.to_string(),
            created_at: timestamp(note, "created_at"),
        });
    }

    Ok(backup)
}

/// Parse raw file contents and validate them
pub fn parse_backup(raw: &str) -> Result<BackupData> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| invalid("No se pudo parsear el archivo JSON"))?;
    validate_backup(&value)
}

/// Counts of records inserted by an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub memories_added: usize,
    pub notes_added: usize,
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Importado: {} memorias, {} notas",
            self.memories_added, self.notes_added
        )
    }
}

/// Insert every record of a validated backup as a fresh row.
///
/// Records are inserted one at a time with no surrounding transaction: a
/// failure stops the import and leaves earlier records in place. Imported
/// memories get new ids and timestamps; a missing or zero importance is
/// restored as the maximum.
pub async fn import_backup(store: &ConversationStore, backup: &BackupData) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for entry in &backup.memories {
        let importance = entry.importance.filter(|i| *i > 0).unwrap_or(MAX_IMPORTANCE);
        let memory = Memory::new(entry.content.clone(), entry.memory_type).with_importance(importance);
        if let Err(err) = store.save_memory(&memory).await {
            warn!(imported = report.memories_added, "memory import stopped: {err}");
            return Err(err);
        }
        report.memories_added += 1;
    }

    for entry in &backup.saved_notes {
        let note = SavedNote::new(entry.content.clone(), None);
        if let Err(err) = store.save_note(&note).await {
            warn!(imported = report.notes_added, "note import stopped: {err}");
            return Err(err);
        }
        report.notes_added += 1;
    }

    info!(
        memories = report.memories_added,
        notes = report.notes_added,
        version = %backup.version,
        "backup imported"
    );
    Ok(report)
}
