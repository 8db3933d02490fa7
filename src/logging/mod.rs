//! Logging subsystem.
//!
//! Structured logging via tracing, with JSON output for production and
//! plaintext for development.
//!
//! # Environment variables
//!
//! - `VKGATE_LOG` — primary log level/filter (takes precedence)
//! - `RUST_LOG` — fallback log level/filter
//!
//! # Examples
//!
//! ```no_run
//! use vkgate::logging::{init_logging, LogConfig};
//!
//! // Development setup (plaintext to stdout, debug level)
//! init_logging(LogConfig::development()).unwrap();
//! ```

use std::fs::File;
use std::path::PathBuf;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Guard so a second init attempt is a no-op instead of a panic.
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Logging setup errors.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {message}")]
    OpenLogFile { path: String, message: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON for production (structured logs).
    Json,
    /// Human-readable plaintext for development.
    #[default]
    Plaintext,
}

/// Log output destination.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Configuration for the logging subsystem.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default level when no env filter is set.
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stdout at debug level.
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stdout at info level.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }

    /// Map the config-file `log` section onto a LogConfig.
    pub fn from_settings(level: &str, format: &str) -> Self {
        let default_level = match level.to_ascii_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        let format = match format.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plaintext,
        };
        Self {
            format,
            output: LogOutput::Stdout,
            default_level,
        }
    }
}

/// Initialize the global tracing subscriber. Repeat calls are no-ops.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_env("VKGATE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.to_string()));

    let writer = match &config.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogOutput::File(path) => {
            let file = File::create(path).map_err(|e| LoggingError::OpenLogFile {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            BoxMakeWriter::new(std::sync::Arc::new(file))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plaintext => builder.try_init(),
    };

    // A subscriber installed by the test harness or an embedding
    // application is not an error.
    if result.is_ok() {
        let _ = INIT_GUARD.set(());
    }

    Ok(())
}
