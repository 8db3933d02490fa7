//! Gateway configuration.
//!
//! Loaded from a JSON file resolved via `VKGATE_CONFIG_PATH`, then
//! `VKGATE_STATE_DIR/vkgate.json`, then `~/.vkgate/vkgate.json`. A missing
//! file yields the defaults; a malformed one is an error — silently
//! running with defaults after a typo'd config is worse than failing.
//!
//! The `modules` section is a free-form map keyed by module name; each
//! value is handed verbatim to that module's `initialize`.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ratelimit::RateLimitConfig;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub log: LogSection,
    pub plugins: PluginsSection,
    pub ratelimit: RateLimitConfig,
    /// Free-form per-module configuration, keyed by module name.
    pub modules: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Bearer token required on the management surface; empty disables it.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        LogSection {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Root directory for plugin state: archives under `<root>/vpks/`,
    /// extraction scratch under `<root>/temp/`.
    pub root: PathBuf,
}

impl Default for PluginsSection {
    fn default() -> Self {
        PluginsSection {
            root: state_dir().join("plugins"),
        }
    }
}

/// Gateway state directory: `VKGATE_STATE_DIR` or `~/.vkgate`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("VKGATE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vkgate")
}

/// Resolve the config file path.
pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("VKGATE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    state_dir().join("vkgate.json")
}

/// Load configuration from the resolved path; defaults when absent.
pub fn load() -> Result<GatewayConfig, ConfigError> {
    load_from(&config_path())
}

/// Load configuration from an explicit path; defaults when absent.
pub fn load_from(path: &Path) -> Result<GatewayConfig, ConfigError> {
    if !path.exists() {
        return Ok(GatewayConfig::default());
    }

    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
