//! Configuration management for the sandbox SDK.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sandbox-sdk/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be between 1 and {max}, got {value}")]
    InvalidTimeout {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("default cwd must be an absolute path, got {0}")]
    InvalidCwd(String),

    #[error("env var names must be non-empty and contain no '=', got {0:?}")]
    InvalidEnvName(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for the request and start timeouts (one hour).
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Upper bound for the close grace period (one minute).
const MAX_CLOSE_GRACE_MS: u64 = 60_000;

/// SDK configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SdkConfig {
    /// Defaults applied to every session started on the sandbox.
    pub sandbox: SandboxConfig,

    /// RPC and lifecycle timeouts.
    pub timeouts: TimeoutConfig,

    /// Logging for the command-line tool.
    pub log: LogConfig,
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SandboxConfig {
    /// Environment variables passed to every session. Manager and per-call
    /// variables override these.
    pub env_vars: BTreeMap<String, String>,

    /// Working directory used when a session does not set one.
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout for stdin, kill, resize and subscription calls.
    pub request_secs: u64,

    /// Timeout for the start call of a session.
    pub start_secs: u64,

    /// How long `Sandbox::close` waits for sessions to finish on their own.
    pub close_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            start_secs: 60,
            close_grace_ms: 1000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandbox-sdk")
        .join("config.toml")
}

impl SdkConfig {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SANDBOX_SDK_START_TIMEOUT: start timeout in seconds
    /// - SANDBOX_SDK_REQUEST_TIMEOUT: request timeout in seconds
    /// - SANDBOX_SDK_CWD: default working directory
    /// - SANDBOX_SDK_LOG_LEVEL: log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_secs("SANDBOX_SDK_START_TIMEOUT") {
            tracing::info!("Overriding start timeout from environment: {}s", secs);
            self.timeouts.start_secs = secs;
        }

        if let Some(secs) = env_secs("SANDBOX_SDK_REQUEST_TIMEOUT") {
            tracing::info!("Overriding request timeout from environment: {}s", secs);
            self.timeouts.request_secs = secs;
        }

        if let Some(cwd) = env_non_empty("SANDBOX_SDK_CWD") {
            tracing::info!("Overriding default cwd from environment: {}", cwd);
            self.sandbox.cwd = Some(cwd);
        }

        if let Some(level) = env_non_empty("SANDBOX_SDK_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.log.level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("request_secs", self.timeouts.request_secs, MAX_TIMEOUT_SECS)?;
        check_range("start_secs", self.timeouts.start_secs, MAX_TIMEOUT_SECS)?;
        check_range(
            "close_grace_ms",
            self.timeouts.close_grace_ms,
            MAX_CLOSE_GRACE_MS,
        )?;

        if let Some(cwd) = &self.sandbox.cwd {
            // The sandbox is a POSIX environment regardless of the client OS.
            if !cwd.starts_with('/') {
                return Err(ConfigError::InvalidCwd(cwd.clone()));
            }
        }

        if let Some(name) = self
            .sandbox
            .env_vars
            .keys()
            .find(|name| name.is_empty() || name.contains('='))
        {
            return Err(ConfigError::InvalidEnvName(name.clone()));
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn check_range(name: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value < 1 || value > max {
        return Err(ConfigError::InvalidTimeout { name, value, max });
    }
    Ok(())
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_secs(name: &str) -> Option<u64> {
    let value = env_non_empty(name)?;
    match value.parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!("Ignoring {}: not a number of seconds: {:?}", name, value);
            None
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "SANDBOX_SDK_START_TIMEOUT",
        "SANDBOX_SDK_REQUEST_TIMEOUT",
        "SANDBOX_SDK_CWD",
        "SANDBOX_SDK_LOG_LEVEL",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_default_config() {
        let config = SdkConfig::default();

        assert!(config.sandbox.env_vars.is_empty());
        assert_eq!(config.sandbox.cwd, None);
        assert_eq!(config.timeouts.request(), Duration::from_secs(30));
        assert_eq!(config.timeouts.start(), Duration::from_secs(60));
        assert_eq!(config.timeouts.close_grace(), Duration::from_millis(1000));
        assert_eq!(config.log.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = SdkConfig::from_toml("").unwrap();
        assert_eq!(config, SdkConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[sandbox]
cwd = "/home/user"

[sandbox.env_vars]
LANG = "C.UTF-8"
PATH = "/usr/local/bin:/usr/bin"

[timeouts]
request_secs = 5
start_secs = 120
close_grace_ms = 250

[log]
level = "debug"
"#;
        let config = SdkConfig::from_toml(toml).unwrap();

        assert_eq!(config.sandbox.cwd.as_deref(), Some("/home/user"));
        assert_eq!(config.sandbox.env_vars.len(), 2);
        assert_eq!(config.sandbox.env_vars["LANG"], "C.UTF-8");
        assert_eq!(config.timeouts.request_secs, 5);
        assert_eq!(config.timeouts.start(), Duration::from_secs(120));
        assert_eq!(config.timeouts.close_grace(), Duration::from_millis(250));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_from_toml_partial_keeps_defaults() {
        let toml = r#"
[timeouts]
start_secs = 10
"#;
        let config = SdkConfig::from_toml(toml).unwrap();
        assert_eq!(config.timeouts.start_secs, 10);
        assert_eq!(config.timeouts.request_secs, 30);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = SdkConfig::from_toml("[timeouts\nstart_secs = 1")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[timeouts]
start_secs = "soon"
"#;
        assert!(SdkConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = SdkConfig::default();
        original
            .sandbox
            .env_vars
            .insert("FOO".to_string(), "bar".to_string());
        original.sandbox.cwd = Some("/srv".to_string());
        original.timeouts.close_grace_ms = 10;
        let loaded = SdkConfig::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = SdkConfig::default();
        config.timeouts.start_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout {
                name: "start_secs",
                value: 0,
                max: MAX_TIMEOUT_SECS,
            })
        );

        let mut config = SdkConfig::default();
        config.timeouts.close_grace_ms = MAX_CLOSE_GRACE_MS + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeout {
                name: "close_grace_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_relative_cwd() {
        let mut config = SdkConfig::default();
        config.sandbox.cwd = Some("relative/dir".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCwd("relative/dir".to_string()))
        );
    }

    #[test]
    fn test_validate_env_names() {
        let mut config = SdkConfig::default();
        config
            .sandbox
            .env_vars
            .insert("A=B".to_string(), "x".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEnvName("A=B".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = SdkConfig::default();
        config.log.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.log.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let config = SdkConfig::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, SdkConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = SdkConfig::default();
        original.timeouts.request_secs = 7;
        original.save(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(SdkConfig::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = SdkConfig::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("sandbox-sdk"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("SANDBOX_SDK_START_TIMEOUT", "5");
        std::env::set_var("SANDBOX_SDK_REQUEST_TIMEOUT", "2");
        std::env::set_var("SANDBOX_SDK_CWD", "/work");
        std::env::set_var("SANDBOX_SDK_LOG_LEVEL", "trace");

        let mut config = SdkConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.timeouts.start_secs, 5);
        assert_eq!(config.timeouts.request_secs, 2);
        assert_eq!(config.sandbox.cwd.as_deref(), Some("/work"));
        assert_eq!(config.log.level, "trace");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_or_invalid_is_ignored() {
        clear_env();
        std::env::set_var("SANDBOX_SDK_START_TIMEOUT", "soon");
        std::env::set_var("SANDBOX_SDK_LOG_LEVEL", "");

        let mut config = SdkConfig::default();
        config.apply_env_overrides();

        assert_eq!(config, SdkConfig::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();
        let mut config = SdkConfig::default();
        config.apply_env_overrides();
        assert_eq!(config, SdkConfig::default());
    }
}
