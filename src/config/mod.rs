//! Runtime configuration.
//!
//! Values come from a TOML file (every section optional) and are then
//! overridden by `RELAYMQ_*` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "RELAYMQ_CONFIG";

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5672".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for metadata tables and per-queue message logs.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    pub worker_threads: usize,
    /// Pending delivery tasks allowed before publishers block.
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset, e.g.
    /// `"info,relaymq::message=debug"`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub log: LogConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

impl Config {
    /// Loads `path` (or `$RELAYMQ_CONFIG` when `path` is `None`), falling back
    /// to defaults when neither is given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None => Config::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("RELAYMQ_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = env::var("RELAYMQ_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("RELAYMQ_WORKER_THREADS") {
            self.delivery.worker_threads = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("RELAYMQ_WORKER_THREADS: {e}")))?;
        }
        if let Ok(v) = env::var("RELAYMQ_QUEUE_CAPACITY") {
            self.delivery.queue_capacity = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("RELAYMQ_QUEUE_CAPACITY: {e}")))?;
        }
        if let Ok(v) = env::var("RELAYMQ_LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.worker_threads == 0 {
            return Err(ConfigError::Parse(
                "delivery.worker_threads must be at least 1".into(),
            ));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(ConfigError::Parse(
                "delivery.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Loads the file at `path` and applies environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    Config::load(Some(path.as_ref()))
}
