pub mod schema;

pub use schema::{
    Config, DatabaseConfig, EmbeddingConfig, GenerationConfig, StorageConfig, WorkerConfig,
};

use crate::error::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "ragline.toml";

impl Config {
    /// Default config file location under the platform config directory.
    pub fn default_path() -> std::result::Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("", "", "ragline")
            .ok_or_else(|| ConfigError::Load("could not resolve a home directory".into()))?;
        Ok(dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> std::result::Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Load(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| ConfigError::Load(format!("invalid toml in {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the default-location config, writing defaults first if absent.
    pub fn load_or_init() -> std::result::Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if !path.exists() {
            Self::write_default(&path)?;
            tracing::info!(path = %path.display(), "wrote default config");
        }
        Self::load_from(&path)
    }

    /// Serialize the default config to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> std::result::Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(&Config::default())
            .map_err(|e| ConfigError::Load(format!("cannot render default config: {e}")))?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_default_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ragline.toml");

        Config::write_default(&path).unwrap();
        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.worker.concurrency, Config::default().worker.concurrency);
    }

    #[test]
    fn load_from_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn load_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragline.toml");
        std::fs::write(&path, "[worker]\nconcurrency = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }
}
