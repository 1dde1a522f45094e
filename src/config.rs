use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::spectral::{ExtractionConfig, ResynthesisOptions};

/// Application configuration loaded from TOML config file.
/// All fields have defaults; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory holding the stems to prepare.
    pub data_dir: Option<PathBuf>,
    /// Feature cache root (overrides XDG default).
    pub cache_dir: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Mel analysis parameters (part of every cache key).
    pub extraction: ExtractionConfig,
    /// Griffin-Lim parameters for `invert`.
    pub resynthesis: ResynthesisOptions,
}

impl AppConfig {
    /// Load config from `~/.config/stemprep/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    /// Never exceeds the available parallelism.
    pub fn resolve_workers(&self, requested: usize) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let wanted = if requested > 0 {
            requested
        } else if self.workers > 0 {
            self.workers
        } else {
            (cores / 2).max(1)
        };
        wanted.min(cores).max(1)
    }

    /// Cache root: explicit setting, else the XDG cache directory.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default cache path using the XDG cache directory.
pub fn default_cache_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        dirs.cache_dir().join("features")
    } else {
        // Fallback: current directory
        PathBuf::from("stemprep-cache")
    }
}
