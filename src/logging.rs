//! Log output setup for hosts embedding the engine.
//!
//! The library itself only emits `tracing` events under component spans. A
//! host builds a [`tracing::Dispatch`] from the `[logging]` config section and
//! installs it however it likes (globally, or scoped with
//! `tracing::dispatcher::with_default`).

use serde::{Deserialize, Serialize};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// The `[logging]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `worktree_sandbox=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LogConfig {
    /// The filter to apply: `RUST_LOG` if set, the configured level otherwise.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level).map_err(|e| {
                Error::Config(format!("invalid log level '{}': {}", self.level, e))
            }),
        }
    }
}

/// Builds a fmt subscriber for `config` without installing it.
pub fn build_dispatch(config: &LogConfig) -> Result<Dispatch> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let dispatch = match config.format {
        LogFormat::Pretty => Dispatch::new(builder.pretty().finish()),
        LogFormat::Compact => Dispatch::new(builder.compact().finish()),
        LogFormat::Json => Dispatch::new(builder.json().finish()),
    };
    Ok(dispatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn log_format_deserializes_lowercase() {
        let config: LogConfig = toml::from_str("level = \"debug\"\nformat = \"json\"").unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn builds_each_format() {
        for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
            let config = LogConfig {
                level: "worktree_sandbox=debug".to_string(),
                format,
            };
            let dispatch = build_dispatch(&config).unwrap();
            tracing::dispatcher::with_default(&dispatch, || {
                tracing::info!("logging configured");
            });
        }
    }
}
