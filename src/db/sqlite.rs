//! SQLite backend for the metadata store.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::schema::SCHEMA;
use super::{
    BulkUpsertSummary, MetadataRow, MetadataStore, MetadataValue, RemoteId, RemoteImageRecord,
    RemoteSyncError, UpsertAction, UpsertOutcome,
};
use crate::sidecar::IdentityRecord;

const IMAGE_COLUMNS: &str = "id, uuid, filename, owner, p_hash, caption, tags, has_image, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, RemoteSyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RemoteSyncError::Open {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RemoteSyncError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RemoteSyncError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RemoteSyncError> {
        self.conn.lock().map_err(|_| RemoteSyncError::LockPoisoned)
    }

    fn get_or_create_field(
        tx: &Transaction<'_>,
        owner: &str,
        key: &str,
    ) -> Result<i64, RemoteSyncError> {
        let existing = tx
            .query_row(
                "SELECT id FROM field_definitions WHERE owner = ? AND key = ?",
                params![owner, key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        tx.execute(
            "INSERT INTO field_definitions (owner, key) VALUES (?, ?)",
            params![owner, key],
        )?;
        Ok(tx.last_insert_rowid())
    }

    /// Find the row a metadata import for `filename` should attach to,
    /// creating a metadata-first row if there is none.
    fn find_or_create_for_import(
        tx: &Transaction<'_>,
        filename: &str,
        owner: &str,
        now: &str,
    ) -> Result<(RemoteId, bool), RemoteSyncError> {
        let existing = tx
            .query_row(
                "SELECT id FROM images WHERE filename = ? AND owner = ? ORDER BY id LIMIT 1",
                params![filename, owner],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok((id, false));
        }
        tx.execute(
            r#"
            INSERT INTO images (uuid, filename, owner, p_hash, has_image, created_at, updated_at)
            VALUES (NULL, ?, ?, NULL, 0, ?, ?)
            "#,
            params![filename, owner, now, now],
        )?;
        Ok((tx.last_insert_rowid(), true))
    }
}

impl MetadataStore for SqliteStore {
    fn upsert(
        &self,
        record: &IdentityRecord,
        filename: &str,
        owner: &str,
    ) -> Result<UpsertOutcome, RemoteSyncError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let uuid = record.uuid.to_string();
        let tags = serde_json::to_string(&record.tags)?;
        let created_at = timestamp(&record.created_at);
        let updated_at = timestamp(&record.updated_at);

        let by_uuid = tx
            .query_row("SELECT id FROM images WHERE uuid = ?", [&uuid], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;

        let outcome = if let Some(id) = by_uuid {
            // A record older than the stored row must not roll it back
            let changed = tx.execute(
                r#"
                UPDATE images SET
                    filename = ?, p_hash = ?, caption = ?, tags = ?,
                    has_image = 1, updated_at = ?
                WHERE id = ? AND updated_at <= ?
                "#,
                params![filename, record.p_hash, record.caption, tags, updated_at, id, updated_at],
            )?;
            UpsertOutcome {
                id,
                action: if changed == 0 {
                    UpsertAction::Stale
                } else {
                    UpsertAction::Patched
                },
            }
        } else {
            let metadata_first = tx
                .query_row(
                    r#"
                    SELECT id FROM images
                    WHERE filename = ? AND owner = ? AND uuid IS NULL
                    ORDER BY id LIMIT 1
                    "#,
                    params![filename, owner],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;

            if let Some(id) = metadata_first {
                // Imported caption/tags win unless the image brings its own.
                tx.execute(
                    r#"
                    UPDATE images SET
                        uuid = ?1, p_hash = ?2, has_image = 1, updated_at = ?3,
                        caption = CASE WHEN ?4 = '' THEN caption ELSE ?4 END,
                        tags = CASE WHEN ?5 = '[]' THEN tags ELSE ?5 END
                    WHERE id = ?6
                    "#,
                    params![uuid, record.p_hash, updated_at, record.caption, tags, id],
                )?;
                UpsertOutcome {
                    id,
                    action: UpsertAction::Upgraded,
                }
            } else {
                tx.execute(
                    r#"
                    INSERT INTO images (
                        uuid, filename, owner, p_hash, caption, tags,
                        has_image, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                    "#,
                    params![
                        uuid,
                        filename,
                        owner,
                        record.p_hash,
                        record.caption,
                        tags,
                        created_at,
                        updated_at
                    ],
                )?;
                UpsertOutcome {
                    id: tx.last_insert_rowid(),
                    action: UpsertAction::Inserted,
                }
            }
        };

        tx.commit()?;
        debug!(uuid = %record.uuid, filename, action = ?outcome.action, "Upserted image record");
        Ok(outcome)
    }

    fn bulk_upsert_metadata_fields(
        &self,
        rows: &[MetadataRow],
        owner: &str,
    ) -> Result<BulkUpsertSummary, RemoteSyncError> {
        let mut by_filename: BTreeMap<&str, Vec<&MetadataRow>> = BTreeMap::new();
        for row in rows {
            by_filename.entry(row.filename.as_str()).or_default().push(row);
        }

        let now = timestamp(&Utc::now());
        let mut summary = BulkUpsertSummary::default();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for (filename, fields) in by_filename {
            let (image_id, created) = Self::find_or_create_for_import(&tx, filename, owner, &now)?;
            if created {
                summary.created += 1;
            } else {
                summary.updated += 1;
            }

            for field in fields {
                let field_id = Self::get_or_create_field(&tx, owner, &field.field_key)?;
                tx.execute(
                    r#"
                    INSERT INTO metadata_values (image_id, field_id, owner, kind, value, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT (image_id, field_id) DO UPDATE SET
                        kind = excluded.kind,
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![
                        image_id,
                        field_id,
                        owner,
                        field.value.kind(),
                        field.value.to_string(),
                        now
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    fn get_by_uuid(&self, uuid: &Uuid) -> Result<Option<RemoteImageRecord>, RemoteSyncError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM images WHERE uuid = ?", IMAGE_COLUMNS),
                [uuid.to_string()],
                row_to_image,
            )
            .optional()?;
        Ok(record)
    }

    fn find_by_filename(
        &self,
        filename: &str,
        owner: &str,
    ) -> Result<Vec<RemoteImageRecord>, RemoteSyncError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM images WHERE filename = ? AND owner = ? ORDER BY id",
            IMAGE_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![filename, owner], row_to_image)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn metadata_values(
        &self,
        image_id: RemoteId,
    ) -> Result<Vec<(String, MetadataValue)>, RemoteSyncError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT f.key, v.kind, v.value
            FROM metadata_values v
            JOIN field_definitions f ON f.id = v.field_id
            WHERE v.image_id = ?
            ORDER BY f.key
            "#,
        )?;
        let raw = stmt
            .query_map([image_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(key, kind, value)| Ok((key, MetadataValue::from_parts(&kind, value)?)))
            .collect()
    }

    fn list_images(&self, owner: &str) -> Result<Vec<RemoteImageRecord>, RemoteSyncError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM images WHERE owner = ? ORDER BY filename, id",
            IMAGE_COLUMNS
        ))?;
        let records = stmt
            .query_map([owner], row_to_image)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn row_to_image(row: &rusqlite::Row) -> rusqlite::Result<RemoteImageRecord> {
    let uuid: Option<String> = row.get(1)?;
    let uuid = uuid
        .map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(1, e)))
        .transpose()?;
    let tags: String = row.get(6)?;
    let tags: Vec<String> = serde_json::from_str(&tags).map_err(|e| conversion_error(6, e))?;

    Ok(RemoteImageRecord {
        id: row.get(0)?,
        uuid,
        filename: row.get(2)?,
        owner: row.get(3)?,
        p_hash: row.get(4)?,
        caption: row.get(5)?,
        tags,
        has_image: row.get::<_, i32>(7)? != 0,
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
    })
}

/// Fixed-width UTC timestamps so `updated_at` compares correctly as text.
fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}
