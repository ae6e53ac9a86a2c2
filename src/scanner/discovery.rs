use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// The folder itself could not be listed. Unlike per-file failures this
/// aborts a folder load.
#[derive(Debug, Error)]
#[error("cannot read directory {path}: {source}")]
pub struct DiscoveryError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// List image files under `directory` whose extension is in `extensions`.
///
/// Only the top level is listed unless `recursive` is set. Unreadable
/// entries below the root are skipped.
pub fn discover_images(
    directory: &Path,
    extensions: &[String],
    recursive: bool,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    // Probe the root so permission problems surface instead of an empty list
    std::fs::read_dir(directory).map_err(|source| DiscoveryError {
        path: directory.to_path_buf(),
        source,
    })?;

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut images = Vec::new();

    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if path.is_file() && has_extension(path, extensions) {
            images.push(path.to_path_buf());
        }
    }

    // Sort by path for consistent ordering
    images.sort();

    Ok(images)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        }
        None => false,
    }
}
