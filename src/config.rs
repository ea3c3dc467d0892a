//! Configuration file parser for ~/.config/feedkeep/config.toml.
//!
//! The config file is optional; a missing or empty file yields
//! `Config::default()`. Unknown keys are ignored with a warning.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FeedFetcher, FetchError, DEFAULT_MAX_FEED_SIZE, DEFAULT_TIMEOUT};
use crate::ingest::Ingestor;
use crate::storage::{FeedStore, JsonFileStore, SqliteStore, StoreError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Which [`FeedStore`] backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Json,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreKind::Sqlite),
            "json" => Ok(StoreKind::Json),
            other => Err(format!("unknown store '{other}' (expected sqlite or json)")),
        }
    }
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Relative paths are resolved against the config directory by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend.
    pub store: StoreKind,

    /// SQLite database file, used when `store = "sqlite"`.
    pub database_path: PathBuf,

    /// JSON document, used when `store = "json"`.
    pub json_path: PathBuf,

    /// Bound on one feed retrieval, in seconds.
    pub fetch_timeout_secs: u64,

    /// Largest accepted feed body.
    pub max_feed_size_bytes: usize,

    pub user_agent: String,

    /// Permit feed URLs on loopback and private networks.
    pub allow_private_hosts: bool,

    /// Feeds fetched more recently than this are skipped on refresh. 0 = always refresh.
    pub min_refresh_interval_minutes: u64,

    /// Feeds refreshed at once. Values below 1 are treated as 1.
    pub refresh_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreKind::Sqlite,
            database_path: PathBuf::from("feeds.db"),
            json_path: PathBuf::from("feeds.json"),
            fetch_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_feed_size_bytes: DEFAULT_MAX_FEED_SIZE,
            user_agent: concat!("feedkeep/", env!("CARGO_PKG_VERSION")).to_string(),
            allow_private_hosts: false,
            min_refresh_interval_minutes: 0,
            refresh_concurrency: 1,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "store",
        "database_path",
        "json_path",
        "fetch_timeout_secs",
        "max_feed_size_bytes",
        "user_agent",
        "allow_private_hosts",
        "min_refresh_interval_minutes",
        "refresh_concurrency",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), store = ?config.store, "Loaded configuration");
        Ok(config)
    }

    /// Resolves relative store paths against `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        if self.database_path.is_relative() {
            self.database_path = base.join(&self.database_path);
        }
        if self.json_path.is_relative() {
            self.json_path = base.join(&self.json_path);
        }
        self
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_minutes.saturating_mul(60))
    }

    /// An HTTP fetcher with the configured timeout, size cap and user agent.
    pub fn fetcher(&self) -> Result<FeedFetcher, FetchError> {
        FeedFetcher::new(
            self.fetch_timeout(),
            self.max_feed_size_bytes,
            &self.user_agent,
            self.allow_private_hosts,
        )
    }

    /// Opens the configured backend.
    pub async fn open_store(&self) -> Result<Arc<dyn FeedStore>, StoreError> {
        match self.store {
            StoreKind::Sqlite => {
                let path = self.database_path.to_string_lossy();
                Ok(Arc::new(SqliteStore::open(&path).await?))
            }
            StoreKind::Json => Ok(Arc::new(JsonFileStore::open(&self.json_path).await?)),
        }
    }

    /// A coordinator over `store` with every configured policy applied.
    pub fn ingestor(&self, store: Arc<dyn FeedStore>) -> Result<Ingestor, FetchError> {
        Ok(Ingestor::new(store, self.fetcher()?)
            .allow_private_hosts(self.allow_private_hosts)
            .min_refresh_interval(self.min_refresh_interval())
            .refresh_concurrency(self.refresh_concurrency))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store, StoreKind::Sqlite);
        assert_eq!(config.database_path, PathBuf::from("feeds.db"));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_feed_size_bytes, 10 * 1024 * 1024);
        assert!(config.user_agent.starts_with("feedkeep/"));
        assert!(!config.allow_private_hosts);
        assert_eq!(config.min_refresh_interval(), Duration::ZERO);
        assert_eq!(config.refresh_concurrency, 1);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "  \n\t\n");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "store = \"json\"\nmin_refresh_interval_minutes = 15\n");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store, StoreKind::Json);
        assert_eq!(config.min_refresh_interval(), Duration::from_secs(15 * 60));
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.json_path, PathBuf::from("feeds.json"));
    }

    #[test]
    fn test_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
store = "sqlite"
database_path = "/var/lib/feedkeep/feeds.db"
json_path = "store.json"
fetch_timeout_secs = 5
max_feed_size_bytes = 4096
user_agent = "custom/1.0"
allow_private_hosts = true
min_refresh_interval_minutes = 60
refresh_concurrency = 8
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config,
            Config {
                store: StoreKind::Sqlite,
                database_path: PathBuf::from("/var/lib/feedkeep/feeds.db"),
                json_path: PathBuf::from("store.json"),
                fetch_timeout_secs: 5,
                max_feed_size_bytes: 4096,
                user_agent: "custom/1.0".into(),
                allow_private_hosts: true,
                min_refresh_interval_minutes: 60,
                refresh_concurrency: 8,
            }
        );
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "store = [unclosed");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_store_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "store = \"postgres\"");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "theme = \"dark\"\nfetch_timeout_secs = 10\n");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.fetch_timeout_secs, 10);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "refresh_concurrency = \"many\"");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let padding = "# padding\n".repeat(110_000);
        let path = write_config(&dir, &padding);
        assert!(matches!(Config::load(&path), Err(ConfigError::TooLarge(_))));
    }

    #[test]
    fn test_resolve_paths_only_touches_relative() {
        let config = Config {
            database_path: PathBuf::from("/abs/feeds.db"),
            ..Config::default()
        }
        .resolve_paths(Path::new("/home/u/.config/feedkeep"));

        assert_eq!(config.database_path, PathBuf::from("/abs/feeds.db"));
        assert_eq!(config.json_path, PathBuf::from("/home/u/.config/feedkeep/feeds.json"));
    }

    #[test]
    fn test_store_kind_from_str() {
        assert_eq!("SQLite".parse::<StoreKind>(), Ok(StoreKind::Sqlite));
        assert_eq!("json".parse::<StoreKind>(), Ok(StoreKind::Json));
        assert!("redis".parse::<StoreKind>().is_err());
    }

    #[tokio::test]
    async fn test_open_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            store: StoreKind::Json,
            ..Config::default()
        }
        .resolve_paths(dir.path());

        let store = config.open_store().await.unwrap();
        assert!(store.list_feeds(None).await.unwrap().is_empty());
        assert!(dir.path().join("feeds.json").exists());
    }
}
