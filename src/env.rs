//! Startup settings read from environment variables.
//!
//! These are the only values the host application supplies; everything else
//! lives in the logging configuration document.

use crate::config::{ConfigError, ConfigFileType};
use crate::record::Severity;
use crate::traceback::DEFAULT_TRACEBACK_LIMIT;
use std::path::PathBuf;

/// Path of an override configuration document. Unset means the packaged
/// default is used alone.
pub const LOG_CONFIG_FILENAME_ENV: &str = "LOG_CONFIG_FILENAME";

/// Format of the override document: `json` or `yaml`.
pub const LOG_CONFIG_FILE_TYPE_ENV: &str = "LOG_CONFIG_FILE_TYPE";

/// Level of the application logger.
pub const LOG_CONFIG_APP_LEVEL_ENV: &str = "LOG_CONFIG_APP_LEVEL";

/// Application logger level when neither the environment nor the
/// configuration documents set one.
pub const DEFAULT_APP_LEVEL: Severity = Severity::Info;

/// Maximum number of traceback frames per record.
pub const LOG_CONFIG_TRACEBACK_LIMIT_ENV: &str = "LOG_CONFIG_TRACEBACK_LIMIT";

/// Pretty-print JSON records (`1`, `true`, `yes`, `on`).
pub const LOG_CONFIG_PRETTY_JSON_ENV: &str = "LOG_CONFIG_PRETTY_JSON";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config_filename: Option<PathBuf>,
    pub file_type: ConfigFileType,
    /// `None` leaves the level from the configuration documents in place.
    pub app_level: Option<Severity>,
    pub traceback_limit: usize,
    pub pretty_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            config_filename: None,
            file_type: ConfigFileType::Yaml,
            app_level: None,
            traceback_limit: DEFAULT_TRACEBACK_LIMIT,
            pretty_json: false,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings from any string-keyed source, e.g. an app config map.
    ///
    /// Empty values count as unset. Fails on an unknown file type, level or a
    /// non-numeric traceback limit.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let file_type = match get(LOG_CONFIG_FILE_TYPE_ENV) {
            Some(raw) => raw.parse::<ConfigFileType>()?,
            None => defaults.file_type,
        };

        let app_level = match get(LOG_CONFIG_APP_LEVEL_ENV) {
            Some(raw) => Some(
                raw.parse::<Severity>()
                    .map_err(|e| ConfigError::Format(format!("{}: {}", LOG_CONFIG_APP_LEVEL_ENV, e)))?,
            ),
            None => defaults.app_level,
        };

        let traceback_limit = match get(LOG_CONFIG_TRACEBACK_LIMIT_ENV) {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                ConfigError::Format(format!(
                    "{} must be a non-negative integer, got `{}`",
                    LOG_CONFIG_TRACEBACK_LIMIT_ENV, raw
                ))
            })?,
            None => defaults.traceback_limit,
        };

        let pretty_json = get(LOG_CONFIG_PRETTY_JSON_ENV)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(defaults.pretty_json);

        Ok(Settings {
            config_filename: get(LOG_CONFIG_FILENAME_ENV).map(PathBuf::from),
            file_type,
            app_level,
            traceback_limit,
            pretty_json,
        })
    }
}
