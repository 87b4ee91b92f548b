use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CairnConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub shift: ShiftConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Per-connection wait for the writer lock before surfacing `SQLITE_BUSY`.
    pub busy_timeout_ms: u64,
    pub cache_size_kib: i64,
    /// WAL pages before SQLite triggers an automatic checkpoint.
    pub wal_autocheckpoint_pages: u32,
    /// Attempt to load sqlite-vec. `false` forces keyword-only operation.
    pub vector_extension: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub rrf_k: usize,
    /// Vector candidates fetched per requested result.
    pub vector_overfetch: usize,
    pub snippet_tokens: usize,
}

/// Adaptive topic-shift detection.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShiftConfig {
    pub enabled: bool,
    /// Fixed threshold that bypasses the learned EWMA state when set.
    pub manual_threshold: Option<f64>,
    /// EWMA decay factor in `(0, 1]`.
    pub alpha: f64,
    /// Standard deviations above the mean distance that count as a shift.
    pub multiplier: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
    /// Cold-start EWMA distance when a partition has no history.
    pub initial_distance: f64,
    pub initial_variance: f64,
    /// Number of past sessions averaged when seeding.
    pub seed_sessions: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub tick_interval_ms: u64,
    pub embed_batch_size: usize,
    pub checkpoint_batch_size: usize,
    pub stale_after_days: u64,
    pub demote_after_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_cairn_dir()
            .join("cairn.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            busy_timeout_ms: 5000,
            cache_size_kib: 8192,
            wal_autocheckpoint_pages: 1000,
            vector_extension: true,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            rrf_k: 60,
            vector_overfetch: 2,
            snippet_tokens: 16,
        }
    }
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            manual_threshold: None,
            alpha: 0.3,
            multiplier: 1.5,
            min_threshold: 0.15,
            max_threshold: 0.6,
            initial_distance: 0.3,
            initial_variance: 0.01,
            seed_sessions: 10,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5000,
            embed_batch_size: 32,
            checkpoint_batch_size: 16,
            stale_after_days: 30,
            demote_after_days: 90,
        }
    }
}

/// Returns `~/.cairn/`, or `./.cairn/` when no home directory is known.
pub fn default_cairn_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cairn")
}

/// Returns the default config file path: `~/.cairn/config.toml`
pub fn default_config_path() -> PathBuf {
    default_cairn_dir().join("config.toml")
}

impl CairnConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            CairnConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (CAIRN_DB, CAIRN_LOG_LEVEL, CAIRN_BUSY_TIMEOUT_MS).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CAIRN_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("CAIRN_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("CAIRN_BUSY_TIMEOUT_MS") {
            match val.parse() {
                Ok(ms) => self.storage.busy_timeout_ms = ms,
                Err(_) => tracing::warn!(value = %val, "ignoring non-numeric CAIRN_BUSY_TIMEOUT_MS"),
            }
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.shift.validate()?;
        ensure!(self.retrieval.rrf_k > 0, "retrieval.rrf_k must be positive");
        ensure!(
            self.worker.embed_batch_size > 0 && self.worker.checkpoint_batch_size > 0,
            "worker batch sizes must be positive"
        );
        ensure!(
            self.worker.tick_interval_ms > 0,
            "worker.tick_interval_ms must be positive"
        );
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

impl ShiftConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.alpha > 0.0 && self.alpha <= 1.0,
            "shift.alpha must be in (0, 1], got {}",
            self.alpha
        );
        ensure!(
            self.multiplier >= 0.0,
            "shift.multiplier must not be negative"
        );
        ensure!(
            self.min_threshold > 0.0 && self.min_threshold <= self.max_threshold,
            "shift thresholds must satisfy 0 < min_threshold <= max_threshold"
        );
        if let Some(manual) = self.manual_threshold {
            ensure!(manual > 0.0, "shift.manual_threshold must be positive");
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CairnConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.storage.busy_timeout_ms, 5000);
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.shift.alpha, 0.3);
        assert!(config.storage.db_path.ends_with("cairn.db"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"
vector_extension = false

[shift]
manual_threshold = 0.4
"#;
        let config: CairnConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert!(!config.storage.vector_extension);
        assert_eq!(config.shift.manual_threshold, Some(0.4));
        // defaults still apply for unset fields
        assert_eq!(config.shift.multiplier, 1.5);
        assert_eq!(config.storage.busy_timeout_ms, 5000);
    }

    #[test]
    fn inverted_threshold_band_is_rejected() {
        let mut config = CairnConfig::default();
        config.shift.min_threshold = 0.7;
        config.shift.max_threshold = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn alpha_out_of_range_is_rejected() {
        let mut config = CairnConfig::default();
        config.shift.alpha = 0.0;
        assert!(config.validate().is_err());
        config.shift.alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = CairnConfig::default();
        std::env::set_var("CAIRN_DB", "/tmp/override.db");
        std::env::set_var("CAIRN_LOG_LEVEL", "trace");
        std::env::set_var("CAIRN_BUSY_TIMEOUT_MS", "250");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.storage.busy_timeout_ms, 250);

        // Clean up
        std::env::remove_var("CAIRN_DB");
        std::env::remove_var("CAIRN_LOG_LEVEL");
        std::env::remove_var("CAIRN_BUSY_TIMEOUT_MS");
    }
}
