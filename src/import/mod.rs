//! Tabular metadata import.
//!
//! A CSV with one row per image: one column names the file, every other
//! column becomes a metadata field. Rows may arrive before the image itself;
//! the store keeps them as metadata-first rows until reconciliation claims
//! them.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::db::{BulkUpsertSummary, MetadataRow, MetadataStore, MetadataValue};

/// Read `(filename, field, value)` triples from a CSV file.
///
/// The filename column is matched case-insensitively and reduced to its
/// basename. Empty cells and rows without a filename are skipped.
pub fn read_metadata_csv(path: &Path, filename_column: &str) -> Result<Vec<MetadataRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let Some(name_idx) = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(filename_column))
    else {
        bail!(
            "{} has no {:?} column (found: {})",
            path.display(),
            filename_column,
            headers.iter().collect::<Vec<_>>().join(", ")
        );
    };

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV row {}", line + 2))?;

        let Some(filename) = record.get(name_idx).and_then(basename) else {
            debug!(row = line + 2, "Skipping row without filename");
            continue;
        };

        for (idx, cell) in record.iter().enumerate() {
            if idx == name_idx || cell.trim().is_empty() {
                continue;
            }
            let Some(key) = headers.get(idx).filter(|k| !k.is_empty()) else {
                continue;
            };
            rows.push(MetadataRow::new(
                filename.clone(),
                key,
                MetadataValue::parse_cell(cell),
            ));
        }
    }

    Ok(rows)
}

fn basename(cell: &str) -> Option<String> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Accept both separators regardless of platform
    let name = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    (!name.is_empty()).then(|| name.to_string())
}

/// Read `path` and push its rows into `store` for `owner`.
pub fn import_csv(
    store: &dyn MetadataStore,
    path: &Path,
    owner: &str,
    filename_column: &str,
) -> Result<BulkUpsertSummary> {
    let rows = read_metadata_csv(path, filename_column)?;
    let summary = store
        .bulk_upsert_metadata_fields(&rows, owner)
        .context("Failed to store imported metadata")?;

    info!(
        file = %path.display(),
        values = rows.len(),
        created = summary.created,
        updated = summary.updated,
        "Imported metadata"
    );
    Ok(summary)
}
