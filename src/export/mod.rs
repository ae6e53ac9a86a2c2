use anyhow::{bail, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::reconcile::ImageEntry;
use crate::sidecar::IdentityRecord;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => bail!("Unknown export format: {}", other),
        }
    }
}

/// Image identity for export
#[derive(Debug, Serialize)]
pub struct ExportedImage<'a> {
    pub filename: &'a str,
    #[serde(flatten)]
    pub identity: &'a IdentityRecord,
}

/// Export the identities of `entries` to a file
pub fn export_entries(entries: &[ImageEntry], output_path: &Path, format: ExportFormat) -> Result<usize> {
    let images: Vec<ExportedImage<'_>> = entries
        .iter()
        .map(|e| ExportedImage {
            filename: &e.filename,
            identity: &e.identity,
        })
        .collect();

    match format {
        ExportFormat::Json => export_json(&images, output_path)?,
        ExportFormat::Csv => export_csv(&images, output_path)?,
    }

    Ok(images.len())
}

fn export_json(images: &[ExportedImage<'_>], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(images)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(images: &[ExportedImage<'_>], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    wtr.write_record(["filename", "uuid", "pHash", "caption", "tags"])?;

    for image in images {
        let identity = image.identity;
        let uuid = identity.uuid.to_string();
        let tags = identity.tags.join(", ");
        wtr.write_record([
            image.filename,
            uuid.as_str(),
            identity.p_hash.as_deref().unwrap_or(""),
            identity.caption.as_str(),
            tags.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
