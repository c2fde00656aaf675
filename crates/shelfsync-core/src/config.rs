use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Root application configuration, loaded from `~/.config/shelfsync/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub blob: BlobConfig,
    pub channel: ChannelConfig,
    pub matching: MatchingConfig,
    pub worker: WorkerConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    Local,
    Supabase,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub backend: BlobBackend,
    pub bucket: String,
    pub local_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supabase_url: Option<String>,
    /// Name of the environment variable holding the service key.
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Telegram Desktop export directory (contains `result.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<String>,
    /// Channel carrying book publications.
    pub main: String,
    /// Channel carrying loosely-named book files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    pub publication_window: usize,
    pub archive_window: usize,
    pub connect_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum score for a candidate to be accepted as a match.
    pub threshold: u32,
    pub candidate_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub download_secs: u64,
    pub upload_secs: u64,
    pub shutdown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

// ─── Defaults ──────────────────────────────────────────────

impl Default for DatabaseConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("shelfsync");

        Self {
            path: data_dir.join("shelfsync.db").to_string_lossy().to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("shelfsync");

        Self {
            backend: BlobBackend::Local,
            bucket: "books".to_string(),
            local_root: data_dir.join("blobs").to_string_lossy().to_string(),
            supabase_url: None,
            api_key_env: "SHELFSYNC_STORAGE_KEY".to_string(),
            public_base_url: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            export_dir: None,
            main: String::new(),
            archive: None,
            publication_window: 50,
            archive_window: 200,
            connect_retries: 3,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: 25,
            candidate_limit: 50,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            download_secs: 120,
            upload_secs: 60,
            shutdown_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ─── Load / Save ───────────────────────────────────────────

impl AppConfig {
    /// Standard config file path: `~/.config/shelfsync/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SHELFSYNC_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("shelfsync")
            .join("config.toml")
    }

    /// Load config from disk, falling back to defaults if file doesn't exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        Self::load_from(&path)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Check the settings a worker or orchestrator cannot run without.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if self.database.path.trim().is_empty() {
            missing.push("database.path");
        }
        if self.channel.main.trim().is_empty() {
            missing.push("channel.main");
        }
        if self.blob.bucket.trim().is_empty() {
            missing.push("blob.bucket");
        }
        if self.blob.backend == BlobBackend::Supabase && self.blob.supabase_url.is_none() {
            missing.push("blob.supabase_url");
        }
        if self.worker.poll_interval_secs == 0 {
            missing.push("worker.poll_interval_secs (must be > 0)");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CatalogError::Config(format!(
                "missing or invalid settings: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.matching.threshold, 25);
        assert_eq!(cfg.worker.poll_interval_secs, 5);
        assert_eq!(cfg.blob.backend, BlobBackend::Local);
        assert!(cfg.database_path().to_string_lossy().contains("shelfsync.db"));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = AppConfig::default();
        cfg.channel.main = "books_channel".to_string();
        cfg.matching.threshold = 65;
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.channel.main, "books_channel");
        assert_eq!(loaded.matching.threshold, 65);
        assert_eq!(loaded.timeouts.download_secs, cfg.timeouts.download_secs);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str(
            "[matching]\nthreshold = 40\n\n[blob]\nbackend = \"memory\"\n",
        )
        .unwrap();
        assert_eq!(cfg.matching.threshold, 40);
        assert_eq!(cfg.matching.candidate_limit, 50);
        assert_eq!(cfg.blob.backend, BlobBackend::Memory);
        assert_eq!(cfg.blob.bucket, "books");
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let cfg = AppConfig::load_from(Path::new("/tmp/nonexistent_shelfsync_config.toml")).unwrap();
        assert_eq!(cfg.matching.threshold, 25);
    }

    #[test]
    fn test_validate_reports_missing_channel() {
        let cfg = AppConfig::default();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("channel.main"));

        let mut cfg = AppConfig::default();
        cfg.channel.main = "books".to_string();
        assert!(cfg.validate().is_ok());
    }
}
