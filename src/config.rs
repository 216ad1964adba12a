//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\collection-watcher\config.toml
//! - macOS: ~/Library/Application Support/collection-watcher/config.toml
//! - Linux: ~/.config/collection-watcher/config.toml
//!
//! The `[collection]` table holds the scanner settings. The scanner never
//! reads this module's globals directly: it goes through a
//! [`SettingsSource`] so that `ReloadSettings` can re-read whatever backs it.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::paths::ImageExtensions;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scanner settings
    pub collection: CollectionConfig,

    /// Storage settings
    pub database: DatabaseConfig,
}

/// Collection scanner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Root folders scanned by the CLI
    pub paths: Vec<PathBuf>,

    /// Scan known roots incrementally when they are registered
    pub startup_scan: bool,

    /// Watch subdirectories for changes
    pub monitor: bool,

    /// Fingerprint files so moves keep their identity
    pub song_tracking: bool,

    /// Soft-delete vanished songs instead of removing them
    pub mark_songs_unavailable: bool,

    /// Days an unavailable song is kept before hard deletion (0 = forever)
    pub expire_unavailable_songs: i64,

    /// Cover filename filters, highest priority first
    pub cover_art_patterns: Vec<String>,

    /// Extra cover-art extensions on top of the built-in ones
    pub image_extensions: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            startup_scan: true,
            monitor: true,
            song_tracking: false,
            mark_songs_unavailable: true,
            expire_unavailable_songs: 60,
            cover_art_patterns: vec!["front".to_string(), "cover".to_string()],
            image_extensions: Vec::new(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file (empty = `collection.db` in the config directory)
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .or_else(|| config_dir().map(|d| d.join("collection.db")))
            .unwrap_or_else(|| PathBuf::from("collection.db"))
    }
}

// ============================================================================
// Runtime settings
// ============================================================================

/// Anything the scanner can re-read its settings from.
pub trait SettingsSource: Send {
    fn load(&self) -> CollectionConfig;
}

impl SettingsSource for CollectionConfig {
    fn load(&self) -> CollectionConfig {
        self.clone()
    }
}

impl SettingsSource for Arc<RwLock<CollectionConfig>> {
    fn load(&self) -> CollectionConfig {
        self.read().clone()
    }
}

/// Reads `[collection]` from the config file on every load.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    path: Option<PathBuf>,
}

impl ConfigFile {
    /// Read an explicit file instead of the OS-standard one.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn load_config(&self) -> Config {
        match &self.path {
            Some(path) => load_from(path),
            None => load(),
        }
    }
}

impl SettingsSource for ConfigFile {
    fn load(&self) -> CollectionConfig {
        self.load_config().collection
    }
}

/// The scanner's derived view of [`CollectionConfig`], rebuilt as a whole
/// on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub startup_scan: bool,
    pub monitor: bool,
    pub song_tracking: bool,
    pub mark_unavailable: bool,
    pub expire_unavailable_days: i64,
    /// Lowercased, trimmed, non-empty
    pub cover_filters: Vec<String>,
    pub image_extensions: ImageExtensions,
}

impl ScanSettings {
    pub fn from_config(config: &CollectionConfig, decoder_extensions: &[String]) -> Self {
        let cover_filters = config
            .cover_art_patterns
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        let image_extensions = ImageExtensions::with_extra(
            decoder_extensions
                .iter()
                .chain(config.image_extensions.iter()),
        );

        Self {
            startup_scan: config.startup_scan,
            monitor: config.monitor,
            song_tracking: config.song_tracking,
            // Tracked songs must survive a disappearance so a later move can
            // pick them up by fingerprint.
            mark_unavailable: config.song_tracking || config.mark_songs_unavailable,
            expire_unavailable_days: config.expire_unavailable_songs,
            cover_filters,
            image_extensions,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_config(&CollectionConfig::default(), &[])
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("collection-watcher"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load configuration from disk
///
/// Returns default config if file doesn't exist or can't be parsed.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        tracing::warn!(target: "config", "Could not determine config directory, using defaults");
        return Config::default();
    };
    load_from(&path)
}

/// Load configuration from an explicit file.
pub fn load_from(path: &std::path::Path) -> Config {
    if !path.exists() {
        tracing::debug!(target: "config", path = %path.display(), "No config file, using defaults");
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::debug!(target: "config", path = %path.display(), "Loaded config");
                config
            }
            Err(e) => {
                tracing::warn!(target: "config", path = %path.display(), "Failed to parse config: {}", e);
                Config::default()
            }
        },
        Err(e) => {
            tracing::warn!(target: "config", path = %path.display(), "Failed to read config: {}", e);
            Config::default()
        }
    }
}

/// Save configuration to disk
///
/// Creates the config directory if it doesn't exist.
pub fn save(config: &Config) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    save_to(config, &path)
}

/// Save configuration to an explicit file, atomically.
pub fn save_to(config: &Config, path: &std::path::Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!(target: "config", path = %path.display(), "Saved config");
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================
