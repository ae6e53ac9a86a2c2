//! Per-image identity files stored beside the images.
//!
//! `photo.png` gets `photo.png.json` in the same directory. There is no
//! central index; moving a folder moves its identities with it.

pub mod record;

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub use record::{update, IdentityRecord, RecordPatch};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write sidecar {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize sidecar: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reads and writes identity sidecars for a configured file extension.
#[derive(Debug, Clone)]
pub struct SidecarStore {
    extension: String,
}

impl SidecarStore {
    pub fn new(extension: impl Into<String>) -> Self {
        let extension = extension.into();
        let extension = extension.trim_start_matches('.').to_string();
        Self { extension }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn sidecar_path(&self, directory: &Path, image_name: &str) -> PathBuf {
        directory.join(format!("{}.{}", image_name, self.extension))
    }

    /// Load the sidecar for `image_name`.
    ///
    /// Missing, unreadable and malformed files all come back as `None`;
    /// the caller then mints a new identity.
    pub async fn read(&self, directory: &Path, image_name: &str) -> Option<IdentityRecord> {
        let path = self.sidecar_path(directory, image_name);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No readable sidecar");
                return None;
            }
        };

        match serde_json::from_str::<IdentityRecord>(&content) {
            Ok(record) => Some(record.normalize()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring malformed sidecar");
                None
            }
        }
    }

    /// Write `record` as pretty-printed JSON, replacing any previous file.
    ///
    /// The content goes to a temporary file in the same directory first and
    /// is renamed into place, so readers never observe a partial write.
    pub async fn write(
        &self,
        directory: &Path,
        image_name: &str,
        record: &IdentityRecord,
    ) -> Result<(), PersistenceError> {
        let path = self.sidecar_path(directory, image_name);
        let tmp_path = directory.join(format!(".{}.{}.tmp", image_name, self.extension));

        let mut json = serde_json::to_string_pretty(record)?;
        json.push('\n');

        if let Err(source) = tokio::fs::write(&tmp_path, json.as_bytes()).await {
            return Err(PersistenceError::Io {
                path: tmp_path,
                source,
            });
        }

        if let Err(source) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(PersistenceError::Io { path, source });
        }

        Ok(())
    }

    /// Pure merge of `patch` over `existing`; see [`record::update`].
    pub fn update(existing: &IdentityRecord, patch: &RecordPatch) -> IdentityRecord {
        update(existing, patch)
    }

    /// Delete the sidecar. Returns `false` if there was none.
    pub async fn remove(&self, directory: &Path, image_name: &str) -> Result<bool, PersistenceError> {
        let path = self.sidecar_path(directory, image_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }
}

impl Default for SidecarStore {
    fn default() -> Self {
        Self::new("json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::PerceptualHash;
    use tempfile::tempdir;

    fn sample_record() -> IdentityRecord {
        let mut record = IdentityRecord::new(Some(PerceptualHash::from_bits(0xdead_beef)));
        record.caption = "a cat on a mat".to_string();
        record.tags = vec!["cat".to_string(), "indoor".to_string()];
        record
    }

    #[test]
    fn test_sidecar_path() {
        let store = SidecarStore::new(".json");
        assert_eq!(store.extension(), "json");
        assert_eq!(
            store.sidecar_path(Path::new("/photos"), "a.png"),
            PathBuf::from("/photos/a.png.json")
        );
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::default();
        let record = sample_record();

        store.write(dir.path(), "cat.png", &record).await.unwrap();
        let loaded = store.read(dir.path(), "cat.png").await.unwrap();

        assert_eq!(loaded, record);
        assert!(!dir.path().join(".cat.png.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_is_pretty_json() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::default();
        store.write(dir.path(), "cat.png", &sample_record()).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("cat.png.json")).unwrap();
        assert!(content.contains("\n  \"uuid\": "));
        assert!(content.contains("\"pHash\": \"00000000deadbeef\""));
    }

    #[tokio::test]
    async fn test_overwrite_truncates() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::default();
        let mut record = sample_record();
        record.caption = "x".repeat(500);
        store.write(dir.path(), "cat.png", &record).await.unwrap();

        record.caption = "short".to_string();
        store.write(dir.path(), "cat.png", &record).await.unwrap();

        let loaded = store.read(dir.path(), "cat.png").await.unwrap();
        assert_eq!(loaded.caption, "short");
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_are_not_found() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::default();

        assert!(store.read(dir.path(), "absent.png").await.is_none());

        std::fs::write(dir.path().join("bad.png.json"), "{ not json").unwrap();
        assert!(store.read(dir.path(), "bad.png").await.is_none());

        std::fs::write(dir.path().join("wrong.png.json"), r#"{"uuid": "nope"}"#).unwrap();
        assert!(store.read(dir.path(), "wrong.png").await.is_none());
    }

    #[tokio::test]
    async fn test_tolerant_parse() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::default();
        let json = r#"{
            "uuid": "0b8d2f0e-6c5e-4d8f-9a51-2f2f6f0d6a11",
            "pHash": "0123456789abcdef",
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-01T09:00:00Z",
            "rating": 4
        }"#;
        std::fs::write(dir.path().join("old.jpg.json"), json).unwrap();

        let record = store.read(dir.path(), "old.jpg").await.unwrap();
        assert!(record.caption.is_empty());
        assert!(record.tags.is_empty());
        assert_eq!(record.updated_at, record.created_at);
        assert_eq!(record.extra["rating"], 4);

        // Unknown fields survive a rewrite
        store.write(dir.path(), "old.jpg", &record).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("old.jpg.json")).unwrap();
        assert!(content.contains("\"rating\": 4"));
    }

    #[tokio::test]
    async fn test_write_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::default();
        let missing = dir.path().join("gone");

        let err = store
            .write(&missing, "cat.png", &sample_record())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let store = SidecarStore::default();
        store.write(dir.path(), "cat.png", &sample_record()).await.unwrap();

        assert!(store.remove(dir.path(), "cat.png").await.unwrap());
        assert!(!store.remove(dir.path(), "cat.png").await.unwrap());
        assert!(store.read(dir.path(), "cat.png").await.is_none());
    }
}
