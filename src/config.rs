use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

/// Application configuration loaded from TOML config file.
/// Every field is optional; a missing file means all defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parser threads. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Default file locations for batch commands.
    pub batch: BatchConfig,
}

/// `[batch]` table. CLI flags take precedence over each of these.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BatchConfig {
    /// Authoritative `custom_id` mapping written at submission time.
    pub primary_mapping: Option<PathBuf>,
    /// Mapping written by a retry submission.
    pub retry_mapping: Option<PathBuf>,
    /// Where ingestion writes its failure report.
    pub diagnostics_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load `~/.config/moodring/config.toml`, falling back to defaults when
    /// it is absent or unreadable.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load a specific config file. Errors are logged, never returned.
    pub fn load_from(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str::<AppConfig>(&contents) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parser threads: the configured count, or half the cores (min 1).
    pub fn resolve_workers(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1),
            n => n,
        }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// `moodring.db` in the XDG data directory, or the current directory when
/// there is no home. `Database::open` creates the parent.
pub fn default_db_path() -> PathBuf {
    ProjectDirs::from("", "", crate::APP_NAME)
        .map(|dirs| dirs.data_dir().join("moodring.db"))
        .unwrap_or_else(|| PathBuf::from("moodring.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/tmp/songs.db"
workers = 3

[batch]
primary_mapping = "batch_mapping.json"
retry_mapping = "batch_mapping_retry.json"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/songs.db")));
        assert_eq!(config.resolve_workers(), 3);
        assert_eq!(config.batch.primary_mapping, Some(PathBuf::from("batch_mapping.json")));
        assert_eq!(config.batch.retry_mapping, Some(PathBuf::from("batch_mapping_retry.json")));
        assert!(config.batch.diagnostics_path.is_none());
    }

    #[test]
    fn test_default_db_path_is_in_data_dir() {
        let path = default_db_path();
        assert_eq!(path.file_name().unwrap(), "moodring.db");
    }

    #[test]
    fn test_load_from_bad_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = \"many\"").unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.workers, 0);
        assert!(config.resolve_workers() >= 1);
    }
}
