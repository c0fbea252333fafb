//! Logging setup shared by both binaries.

use std::fs::OpenOptions;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::DaemonSettings;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global logger is already installed")]
    AlreadyInitialized,
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

impl LogTarget {
    /// `stderr`, `stdout`, or anything else as a file path.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "stderr" => Self::Stderr,
            "stdout" => Self::Stdout,
            path => Self::File(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub target: LogTarget,
    pub json: bool,
}

impl LogConfig {
    /// Level from `RUST_LOG` when set, `default_level` otherwise.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("RUST_LOG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        Self {
            level,
            target: LogTarget::Stderr,
            json: false,
        }
    }

    /// Level, target and format from the `[daemon]` table, `RUST_LOG` still
    /// wins for the level.
    pub fn from_settings(settings: &DaemonSettings) -> Self {
        Self::from_env(&settings.log_level)
            .with_target(LogTarget::parse(&settings.log_location))
            .with_json(settings.log_json)
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_stderr(self) -> Self {
        self.with_target(LogTarget::Stderr)
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Keeps the non-blocking writer flushing; hold it for the process lifetime.
#[must_use = "dropping the guard stops log output"]
pub struct LoggingGuards {
    _writer: WorkerGuard,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidFilter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })?;

    let (writer, guard) = match &config.target {
        LogTarget::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        LogTarget::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
    };
    let ansi = !matches!(config.target, LogTarget::File(_));

    let text_layer = (!config.json).then(|| {
        fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(ansi)
            .with_target(true)
    });
    let json_layer = config
        .json
        .then(|| fmt::layer().json().with_writer(writer.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuards { _writer: guard })
}
