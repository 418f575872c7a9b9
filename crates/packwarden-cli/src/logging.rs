//! Subscriber setup

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `--log-level` wins over `RUST_LOG`, which wins over `info`
pub fn filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|e| CliError::config(format!("invalid log level '{}': {}", level, e))),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

pub fn init(level: Option<&str>, format: LogFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .with_target(true);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    installed.map_err(|e| CliError::config(format!("failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_flag() {
        let filter = filter(Some("packwarden_runtime=debug,warn")).unwrap();
        assert!(filter.to_string().contains("packwarden_runtime=debug"));
    }

    #[test]
    fn test_invalid_level_rejected() {
        let err = filter(Some("packwarden=loud")).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
    }
}
