//! Application configuration.
//!
//! Configuration is read from a TOML file. Every section and field has a
//! default, so an absent file or a partial file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_MAX_FILE_COUNT;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "IDA_FREEZE_CONFIG";

const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve and load configuration.
    ///
    /// Lookup order: the explicit path, the `IDA_FREEZE_CONFIG` environment
    /// variable, the platform config directory. When none of these points at
    /// an existing file the defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Self::from_file(Path::new(&path));
            }
        }

        match Self::default_config_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading config from {}", path.display());
                Self::from_file(&path)
            }
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Platform specific default location of the config file.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("fi", "fairdata", "ida-freeze")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Reject combinations of values the workflow cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.max_concurrent_files == 0 {
            return Err(ConfigError::Validation(
                "engine.max_concurrent_files must be at least 1".to_string(),
            ));
        }
        if engine.max_file_attempts == 0 {
            return Err(ConfigError::Validation(
                "engine.max_file_attempts must be at least 1".to_string(),
            ));
        }
        if engine.lease_ttl_secs <= engine.file_timeout_secs {
            return Err(ConfigError::Validation(format!(
                "engine.lease_ttl_secs ({}) must exceed engine.file_timeout_secs ({})",
                engine.lease_ttl_secs, engine.file_timeout_secs
            )));
        }

        let supervisor = &self.supervisor;
        if supervisor.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "supervisor.interval_secs must be at least 1".to_string(),
            ));
        }
        if supervisor.hard_limit_secs <= supervisor.stale_after_secs {
            return Err(ConfigError::Validation(format!(
                "supervisor.hard_limit_secs ({}) must exceed supervisor.stale_after_secs ({})",
                supervisor.hard_limit_secs, supervisor.stale_after_secs
            )));
        }
        if supervisor.max_concurrent_resumes == 0 {
            return Err(ConfigError::Validation(
                "supervisor.max_concurrent_resumes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where records and files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DuckDB database file. `:memory:` keeps everything in memory.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Root of the project data directories and of the control flag files.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Copy every frozen file to the replication tier.
    #[serde(default = "default_replication_enabled")]
    pub replication_enabled: bool,

    #[serde(default = "default_replication_root")]
    pub replication_root: PathBuf,

    /// Identifier recorded in `storage` of every action.
    #[serde(default = "default_replication_backend")]
    pub replication_backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            data_root: default_data_root(),
            replication_enabled: default_replication_enabled(),
            replication_root: default_replication_root(),
            replication_backend: default_replication_backend(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/ida/ida-freeze.duckdb")
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/mnt/storage_vol01/ida")
}

fn default_replication_enabled() -> bool {
    true
}

fn default_replication_root() -> PathBuf {
    PathBuf::from("/mnt/storage_vol02/ida_replication")
}

fn default_replication_backend() -> String {
    "local".to_string()
}

/// Per-action processing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of files in a single action, unless the request is a
    /// batch request by the project's service identity.
    #[serde(default = "default_max_file_count")]
    pub max_file_count: usize,

    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    /// Upper bound for all work on a single file, retries included.
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,

    /// Attempts per side effect before a transient error becomes permanent.
    #[serde(default = "default_max_file_attempts")]
    pub max_file_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_file_count: default_max_file_count(),
            max_concurrent_files: default_max_concurrent_files(),
            file_timeout_secs: default_file_timeout_secs(),
            max_file_attempts: default_max_file_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_max_file_count() -> usize {
    DEFAULT_MAX_FILE_COUNT
}

fn default_max_concurrent_files() -> usize {
    4
}

fn default_file_timeout_secs() -> u64 {
    300
}

fn default_max_file_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_lease_ttl_secs() -> u64 {
    600
}

/// Background sweep of stalled actions and retention of file records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_enabled")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// An in-flight action without a checkpoint for this long is resumed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// An in-flight action without a checkpoint for this long is failed.
    #[serde(default = "default_hard_limit_secs")]
    pub hard_limit_secs: u64,

    #[serde(default = "default_max_concurrent_resumes")]
    pub max_concurrent_resumes: usize,

    /// Removed and orphaned file records older than this are cleared.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: default_supervisor_enabled(),
            interval_secs: default_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            hard_limit_secs: default_hard_limit_secs(),
            max_concurrent_resumes: default_max_concurrent_resumes(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_supervisor_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_stale_after_secs() -> u64 {
    900
}

fn default_hard_limit_secs() -> u64 {
    86_400
}

fn default_max_concurrent_resumes() -> usize {
    3
}

fn default_retention_days() -> u32 {
    90
}

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            enable_cors: default_enable_cors(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4430
}

fn default_enable_cors() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
