//! Configuration for the pvac blocking client.
//!
//! A TOML file at the platform config path, overridden by `PVAC_`
//! environment variables, translated into [`pvac_core::ClientConfig`].
//!
//! ```toml
//! provider = "pva"
//!
//! [timeouts]
//! connect = 5.0
//! operation = 0.0      # zero waits forever
//! multi_connect = 5.0
//!
//! [monitor]
//! queue_size = 8
//!
//! [multi]
//! min_connect = 2
//! ```
//!
//! Nested keys use a double underscore in the environment:
//! `PVAC_TIMEOUTS__CONNECT=2.5`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use pvac_core::{ClientConfig, DEFAULT_PROVIDER};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Provider for channels created without naming one.
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub monitor: MonitorDefaults,

    #[serde(default)]
    pub multi: MultiDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            timeouts: Timeouts::default(),
            monitor: MonitorDefaults::default(),
            multi: MultiDefaults::default(),
        }
    }
}

/// Timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Timeouts {
    #[serde(default = "default_connect")]
    pub connect: f64,

    /// Zero waits forever.
    #[serde(default)]
    pub operation: f64,

    #[serde(default = "default_connect")]
    pub multi_connect: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            operation: 0.0,
            multi_connect: default_connect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MonitorDefaults {
    /// Queue size for monitors whose request does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MultiDefaults {
    /// Channels a multi-channel connect must reach. Unset means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_connect: Option<usize>,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.into()
}
fn default_connect() -> f64 {
    5.0
}

impl Config {
    /// Validate and translate into the runtime configuration.
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        if self.provider.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "provider".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.monitor.queue_size == Some(0) {
            return Err(ConfigError::Validation {
                field: "monitor.queue_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(ClientConfig {
            default_provider: self.provider.trim().to_owned(),
            connect_timeout: seconds("timeouts.connect", self.timeouts.connect)?,
            operation_timeout: seconds("timeouts.operation", self.timeouts.operation)?,
            monitor_queue_size: self.monitor.queue_size,
            multi_connect_timeout: seconds("timeouts.multi_connect", self.timeouts.multi_connect)?,
            min_connect: self.multi.min_connect,
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("expected a non-negative number of seconds, got {value}"),
    })
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "pvac", "pvac").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("pvac");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PVAC_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

/// Load and translate in one step.
pub fn load_client_config() -> Result<ClientConfig, ConfigError> {
    load_config()?.client_config()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    debug!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_translate() {
        let client = Config::default().client_config().unwrap();
        assert_eq!(client, ClientConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "provider = \"loopback\"\n\n[timeouts]\nconnect = 0.5\n\n[multi]\nmin_connect = 2\n",
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.provider, "loopback");
        assert_eq!(config.timeouts.connect, 0.5);
        assert_eq!(config.timeouts.multi_connect, 5.0);

        let client = config.client_config().unwrap();
        assert_eq!(client.connect_timeout, Duration::from_millis(500));
        assert_eq!(client.min_connect, Some(2));
        assert_eq!(client.monitor_queue_size, None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.provider, DEFAULT_PROVIDER);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.monitor.queue_size = Some(8);
        config.timeouts.operation = 2.0;

        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.timeouts.connect = -1.0;
        let err = config.client_config().unwrap_err();
        assert!(
            matches!(&err, ConfigError::Validation { field, .. } if field == "timeouts.connect"),
            "{err}"
        );

        let mut config = Config::default();
        config.timeouts.operation = f64::NAN;
        assert!(config.client_config().is_err());

        let mut config = Config::default();
        config.provider = "  ".into();
        assert!(config.client_config().is_err());

        let mut config = Config::default();
        config.monitor.queue_size = Some(0);
        assert!(config.client_config().is_err());
    }
}
