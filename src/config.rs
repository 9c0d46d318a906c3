use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::{Result, StorageError};

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    /// Chunk size stamped on newly saved files. Existing files keep their own.
    pub chunk_size: usize,
    pub max_connections: u32,
    pub min_connections: u32,
    pub idle_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_connections: 5,
            min_connections: 2,
            idle_timeout_secs: 300,
        }
    }
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path).map_err(|e| {
            StorageError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(config_str).map_err(|e| StorageError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            return Err(StorageError::Configuration(format!(
                "unsupported database url '{}', expected a sqlite: url",
                self.database_url
            )));
        }
        if self.chunk_size == 0 {
            return Err(StorageError::Configuration("chunk_size must be greater than zero".into()));
        }
        if self.max_connections == 0 {
            return Err(StorageError::Configuration("max_connections must be at least 1".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(StorageError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// In-memory databases live only as long as their connection.
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn default_database_url() -> String {
    let path = dirs::data_local_dir()
        .map(|dir| dir.join("chunkstore").join("files.db"))
        .unwrap_or_else(|| Path::new("files.db").to_path_buf());
    format!("sqlite://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.chunk_size, 512 * 1024);
        assert!(config.database_url.starts_with("sqlite://"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StoreConfig::from_toml_str(
            r#"
            database_url = "sqlite::memory:"
            chunk_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_connections, 5);
        assert!(config.is_in_memory());
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_url = StoreConfig::default().with_database_url("postgres://u:p@host/db");
        assert!(matches!(bad_url.validate(), Err(StorageError::Configuration(_))));

        let zero_chunk = StoreConfig::default().with_chunk_size(0);
        assert!(zero_chunk.validate().is_err());

        assert!(StoreConfig::from_toml_str("min_connections = 9").is_err());
        assert!(StoreConfig::from_toml_str("chunk_size = \"big\"").is_err());
    }
}
