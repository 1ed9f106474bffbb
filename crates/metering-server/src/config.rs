//! Server configuration.
//!
//! Read from an optional TOML file (`METER_CONFIG`, default `metering.toml`)
//! and then from `METER__*` environment variables, e.g.
//! `METER__SERVER__PORT=9000` or `METER__AUTH__ADMIN_KEY=...`.

use anyhow::{Context, Result};
use metering::MeterConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_PATH_VAR: &str = "METER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "metering.toml";
const ENV_PREFIX: &str = "METER";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub meter: MeterConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from the config file and environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let path = std::env::var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        Self::load_from(&path)
    }

    /// Load from `path` (skipped when absent) layered under the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let log = match settings.get::<LogConfig>("log") {
            Ok(log) => log,
            Err(config::ConfigError::NotFound(_)) => LogConfig::default(),
            Err(e) => return Err(e).context("Invalid log configuration"),
        };

        let meter = settings
            .try_deserialize::<MeterConfig>()
            .context("Failed to deserialize configuration")?;

        Ok(Self { meter, log })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.log.level, "info");
        assert!(config.meter.providers.is_empty());
        assert!(config.meter.dispatch.sweep_enabled);
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[log]
level = "debug"

[server]
port = 9090

[routing]
default_provider = "backup"

[dispatch]
trigger = "disabled"
sweep_interval = "15s"

[[providers]]
name = "primary"
model = "gpt-4o-mini"
base_url = "https://primary.example.com/v1"
credential = "sk-primary"

[[providers]]
name = "backup"
model = "llama-3"
base_url = "https://backup.example.com/v1"
credential = "sk-backup"
timeout = "5s"
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.meter.server.port, 9090);
        assert_eq!(config.meter.providers.len(), 2);
        assert_eq!(config.meter.providers[1].timeout, Duration::from_secs(5));
        assert_eq!(
            config.meter.routing.default_provider.as_deref(),
            Some("backup")
        );
        assert_eq!(config.meter.dispatch.sweep_interval, Duration::from_secs(15));
    }
}
