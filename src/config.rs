use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scanner::DEFAULT_SIMILARITY_THRESHOLD;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub sidecar: SidecarConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub editing: EditingConfig,

    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Maximum Hamming distance between two fingerprints still counted as
    /// the same picture.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,

    /// Descend into subdirectories when opening a folder.
    #[serde(default)]
    pub recursive: bool,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_similarity_threshold() -> u32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            similarity_threshold: default_similarity_threshold(),
            recursive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SidecarConfig {
    /// Appended to the full image filename: `photo.png` -> `photo.png.json`.
    #[serde(default = "default_sidecar_extension")]
    pub extension: String,
}

fn default_sidecar_extension() -> String {
    "json".to_string()
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            extension: default_sidecar_extension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_enabled")]
    pub enabled: bool,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Scopes every remote row; two owners never see each other's data.
    #[serde(default = "default_owner")]
    pub owner: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_remote_enabled() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("captionary")
        .join("metadata.db")
}

fn default_owner() -> String {
    "local".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: default_remote_enabled(),
            db_path: default_db_path(),
            owner: default_owner(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditingConfig {
    /// Quiet period after the last caption/tag change before it is saved.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    750
}

impl EditingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportConfig {
    /// CSV header naming the image column, matched case-insensitively.
    #[serde(default = "default_filename_column")]
    pub filename_column: String,
}

fn default_filename_column() -> String {
    "filename".to_string()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            filename_column: default_filename_column(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            sidecar: SidecarConfig::default(),
            remote: RemoteConfig::default(),
            editing: EditingConfig::default(),
            import: ImportConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("captionary")
    }

    /// `CAPTIONARY_CONFIG` wins over the XDG location.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CAPTIONARY_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
