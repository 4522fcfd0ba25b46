//! Application configuration management.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `LATCH__SECTION__KEY` environment variables. Covers:
//! - Backend base URL and request timeout
//! - Scan filter and device staleness
//! - Realtime socket path and reconnect backoff
//! - The device to follow when no session carries one
//! - Logging

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LATCH";

/// Separator between prefix, section and key in environment variables.
pub const ENV_SEPARATOR: &str = "__";

/// Errors from loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Writing the file failed.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Target path.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// A source could not be read or deserialized.
    #[error("Invalid configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field is invalid.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} invalid configuration fields", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatchConfig {
    /// HTTP backend.
    pub backend: BackendConfig,
    /// BLE discovery.
    pub ble: BleConfig,
    /// Realtime status socket.
    pub realtime: RealtimeConfig,
    /// Device selection.
    pub device: DeviceConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the lock backend; also the origin of the realtime socket.
    pub base_url: String,
    /// Abort delay for sign-in and settings calls, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/".to_string(),
            request_timeout_ms: 8000,
        }
    }
}

impl BackendConfig {
    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// BLE discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Case-insensitive advertised-name fragment.
    pub name_filter: String,
    /// Drop devices unheard for this long, in milliseconds.
    pub device_ttl_ms: u64,
    /// Prune period, in milliseconds.
    pub prune_interval_ms: u64,
    /// Lock-state read period while connected, in milliseconds; 0 turns polling off.
    pub lock_state_poll_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            name_filter: "lock".to_string(),
            device_ttl_ms: 6000,
            prune_interval_ms: 1000,
            lock_state_poll_ms: 1000,
        }
    }
}

/// Realtime socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Path appended to the socket origin.
    pub socket_path: String,
    /// First reconnect delay, in milliseconds.
    pub backoff_base_ms: u64,
    /// Reconnect delay ceiling, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            socket_path: "ws/client".to_string(),
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
        }
    }
}

/// Device selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device to follow when the session has none.
    pub default_device_id: Option<String>,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level.
    pub level: String,
    /// JSON file output alongside stdout.
    pub production: bool,
    /// Directory for log files in production mode.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            production: false,
            directory: None,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LatchConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the platform config file is
    /// used if present.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is unreadable or the result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(file) = &file {
            builder = builder.add_source(File::from(file.as_path()).format(FileFormat::Toml));
        }
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(env);
        let config: Self = builder.add_source(environment).build()?.try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_error)
    }

    /// Platform configuration file, e.g. `~/.config/latch/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "latch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        match Url::parse(&self.backend.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(ConfigError::invalid(
                "backend.base_url",
                format!("scheme '{}' must be http or https", url.scheme()),
            )),
            Err(e) => errors.push(ConfigError::invalid("backend.base_url", e.to_string())),
        }
        if self.backend.request_timeout_ms == 0 {
            errors.push(ConfigError::invalid(
                "backend.request_timeout_ms",
                "must be greater than zero",
            ));
        }

        if self.ble.device_ttl_ms == 0 {
            errors.push(ConfigError::invalid("ble.device_ttl_ms", "must be greater than zero"));
        }
        if self.ble.prune_interval_ms == 0 {
            errors.push(ConfigError::invalid(
                "ble.prune_interval_ms",
                "must be greater than zero",
            ));
        } else if self.ble.prune_interval_ms > self.ble.device_ttl_ms {
            errors.push(ConfigError::invalid(
                "ble.prune_interval_ms",
                "must not exceed ble.device_ttl_ms",
            ));
        }

        if self.realtime.socket_path.trim_matches('/').is_empty() {
            errors.push(ConfigError::invalid("realtime.socket_path", "must not be empty"));
        }
        if self.realtime.backoff_base_ms == 0 {
            errors.push(ConfigError::invalid(
                "realtime.backoff_base_ms",
                "must be greater than zero",
            ));
        }
        if self.realtime.backoff_cap_ms < self.realtime.backoff_base_ms {
            errors.push(ConfigError::invalid(
                "realtime.backoff_cap_ms",
                "must be at least realtime.backoff_base_ms",
            ));
        }

        if self
            .device
            .default_device_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            errors.push(ConfigError::invalid(
                "device.default_device_id",
                "must not be blank",
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            errors.push(ConfigError::invalid(
                "logging.level",
                format!("must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend.request_timeout(), Duration::from_millis(8000));
        assert_eq!(config.ble.name_filter, "lock");
        assert_eq!(config.realtime.socket_path, "ws/client");
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let err = LatchConfig::load(Some(Path::new("/nonexistent/latch.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[backend]
base_url = "https://locks.example.com/api/"

[device]
default_device_id = "dev-42"
"#,
        )
        .unwrap();

        let config = LatchConfig::load_with_env(Some(&path), Some(HashMap::new())).unwrap();
        assert_eq!(config.backend.base_url, "https://locks.example.com/api/");
        assert_eq!(config.backend.request_timeout_ms, 8000);
        assert_eq!(config.device.default_device_id.as_deref(), Some("dev-42"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ble]\ndevice_ttl_ms = 9000\n").unwrap();

        let env = HashMap::from([
            ("LATCH__BLE__DEVICE_TTL_MS".to_string(), "12000".to_string()),
            ("LATCH__LOGGING__LEVEL".to_string(), "debug".to_string()),
        ]);
        let config = LatchConfig::load_with_env(Some(&path), Some(env)).unwrap();
        assert_eq!(config.ble.device_ttl_ms, 12_000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = LatchConfig::default();
        config.device.default_device_id = Some("dev-7".into());
        config.save(&path).unwrap();

        let loaded = LatchConfig::load_with_env(Some(&path), Some(HashMap::new())).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = LatchConfig::default();
        config.backend.base_url = "ftp://example.com/".into();
        config.realtime.backoff_cap_ms = 10;
        config.logging.level = "loud".into();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_single_validation_error() {
        let mut config = LatchConfig::default();
        config.ble.prune_interval_ms = 60_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "ble.prune_interval_ms"
        ));
    }
}
