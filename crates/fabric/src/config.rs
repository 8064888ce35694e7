//! Manager Configuration
//!
//! Layered in increasing priority: built-in defaults, the TOML config file,
//! then `FABRIC_`-prefixed environment variables. Nested keys use a double
//! underscore, e.g. `FABRIC_RUNTIME__QUEUE_CAPACITY=64`.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fabric_runtime::RuntimeConfig;

pub const DEFAULT_CONFIG_FILE: &str = "fabric.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),
}

/// Manager configuration (fabric.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Apps to load; entries may be comma-joined lists
    #[serde(default)]
    pub apps: Vec<String>,

    /// Tracing filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Poll period of the link source, in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

fn default_log_filter() -> String {
    "fabric=info,fabric_runtime=info".to_string()
}

fn default_tick_ms() -> u64 {
    1000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            apps: Vec::new(),
            log_filter: default_log_filter(),
            tick_ms: default_tick_ms(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Layered providers for `path`; a missing file contributes nothing
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(ManagerConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FABRIC_").split("__"))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::figment(path).extract().map_err(|e| ConfigError::Invalid(Box::new(e)))
    }

    /// Resolve the config path: explicit argument, else `fabric.toml`
    pub fn path_or_default(path: Option<PathBuf>) -> PathBuf {
        path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}
