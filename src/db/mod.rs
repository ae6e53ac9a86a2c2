//! Metadata store shared across devices.
//!
//! Image rows are keyed by `uuid`, with a `(filename, owner)` index for
//! metadata-first rows created by CSV import before the image was seen.

mod schema;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::sidecar::IdentityRecord;

pub use schema::SCHEMA;
pub use sqlite::SqliteStore;

/// Row id of an image in the store.
pub type RemoteId = i64;

#[derive(Debug, Error)]
pub enum RemoteSyncError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row in metadata store: {0}")]
    Corrupt(String),

    #[error("failed to prepare store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata store lock poisoned")]
    LockPoisoned,

    #[error("remote upsert timed out after {0:?}")]
    Timeout(Duration),

    #[error("sync worker is not running")]
    WorkerUnavailable,

    #[error("sync task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A metadata field value as imported from tabular data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MetadataValue {
    String(String),
    Number(f64),
}

impl MetadataValue {
    /// Interpret a raw CSV cell: finite numbers become `Number`, everything
    /// else stays text.
    pub fn parse_cell(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() && !trimmed.is_empty() => MetadataValue::Number(n),
            _ => MetadataValue::String(raw.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MetadataValue::String(_) => "string",
            MetadataValue::Number(_) => "number",
        }
    }

    pub(crate) fn from_parts(kind: &str, value: String) -> Result<Self, RemoteSyncError> {
        match kind {
            "string" => Ok(MetadataValue::String(value)),
            "number" => value
                .parse()
                .map(MetadataValue::Number)
                .map_err(|_| RemoteSyncError::Corrupt(format!("bad number {:?}", value))),
            other => Err(RemoteSyncError::Corrupt(format!("unknown value kind {:?}", other))),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => f.write_str(s),
            MetadataValue::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Image row as held by the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteImageRecord {
    pub id: RemoteId,
    /// `None` for metadata-first rows that no image has claimed yet.
    pub uuid: Option<Uuid>,
    pub filename: String,
    pub owner: String,
    pub p_hash: Option<String>,
    pub caption: String,
    pub tags: Vec<String>,
    /// False until a pixel file has been matched to this row.
    pub has_image: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One `(filename, field, value)` triple from an import.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRow {
    pub filename: String,
    pub field_key: String,
    pub value: MetadataValue,
}

impl MetadataRow {
    pub fn new(filename: impl Into<String>, field_key: impl Into<String>, value: MetadataValue) -> Self {
        Self {
            filename: filename.into(),
            field_key: field_key.into(),
            value,
        }
    }
}

/// Which branch an upsert took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    /// Existing row found by uuid and patched.
    Patched,
    /// Metadata-first row claimed by this uuid.
    Upgraded,
    /// No matching row; a new one was inserted.
    Inserted,
    /// Row found by uuid but it is newer than the record; left unchanged.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: RemoteId,
    pub action: UpsertAction,
}

/// Per-filename counts from a bulk metadata import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkUpsertSummary {
    pub created: usize,
    pub updated: usize,
}

/// Operations the reconciliation and import code needs from a store.
pub trait MetadataStore: Send + Sync {
    /// Idempotently push an identity record.
    ///
    /// Looks up by uuid, then by `(filename, owner)` among rows without a
    /// uuid, and inserts only when both miss. Every branch leaves
    /// `has_image` set.
    fn upsert(
        &self,
        record: &IdentityRecord,
        filename: &str,
        owner: &str,
    ) -> Result<UpsertOutcome, RemoteSyncError>;

    /// Attach imported field values to rows found or created by filename.
    fn bulk_upsert_metadata_fields(
        &self,
        rows: &[MetadataRow],
        owner: &str,
    ) -> Result<BulkUpsertSummary, RemoteSyncError>;

    fn get_by_uuid(&self, uuid: &Uuid) -> Result<Option<RemoteImageRecord>, RemoteSyncError>;

    fn find_by_filename(
        &self,
        filename: &str,
        owner: &str,
    ) -> Result<Vec<RemoteImageRecord>, RemoteSyncError>;

    /// Field values for an image, ordered by field key.
    fn metadata_values(
        &self,
        image_id: RemoteId,
    ) -> Result<Vec<(String, MetadataValue)>, RemoteSyncError>;

    fn list_images(&self, owner: &str) -> Result<Vec<RemoteImageRecord>, RemoteSyncError>;
}
