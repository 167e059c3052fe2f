//! Logging configuration: the packaged default document, an optional user
//! override, and the two-level merge between them.
//!
//! The merge only goes two levels deep. Top-level scalars and `root` are
//! replaced when the override sets them; inside `formatters`, `handlers` and
//! `loggers` each named entry in the override replaces the default entry
//! wholesale. Entries the override does not mention are inherited unchanged.

use crate::formatter::{FormatterSettings, OutputFormat, ROOT_LOGGER, WORKER_NAME};
use crate::record::Severity;
use crate::sink::StreamTarget;
use crate::traceback::DEFAULT_TRACEBACK_LIMIT;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The default configuration, shipped inside the binary.
pub const DEFAULT_CONFIG: &str = include_str!("../config/default_log_config.yml");

/// Error type returned when loading or exporting configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("logging configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid logging configuration: {0}")]
    Format(String),

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: tracing_appender::rolling::InitError,
    },
}

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFileType {
    Json,
    #[default]
    Yaml,
}

impl FromStr for ConfigFileType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ConfigFileType::Json),
            "yaml" => Ok(ConfigFileType::Yaml),
            other => Err(ConfigError::Format(format!(
                "unsupported config file type `{}`, expected `json` or `yaml`",
                other
            ))),
        }
    }
}

impl fmt::Display for ConfigFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFileType::Json => f.write_str("json"),
            ConfigFileType::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatterSpec {
    pub format: FormatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_logger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_user_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback_limit: Option<usize>,
}

impl FormatterSpec {
    /// Resolve unset fields to their defaults.
    pub fn settings(&self) -> FormatterSettings {
        let output = match self.format {
            FormatKind::Json => OutputFormat::Json { pretty: self.pretty.unwrap_or(false) },
            FormatKind::Text => OutputFormat::Text,
        };
        FormatterSettings {
            output,
            root_logger: self.root_logger.clone().unwrap_or_else(|| ROOT_LOGGER.to_string()),
            worker_name: self.worker_name.clone().unwrap_or_else(|| WORKER_NAME.to_string()),
            user_header: self.user_header.clone(),
            session_user_key: self.session_user_key.clone(),
            traceback_limit: self.traceback_limit.unwrap_or(DEFAULT_TRACEBACK_LIMIT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerClass {
    Stream,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSpec {
    pub class: HandlerClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    pub formatter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Severity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Severity>,
    #[serde(default)]
    pub handlers: Vec<String>,
    #[serde(default = "default_propagate")]
    pub propagate: bool,
}

fn default_propagate() -> bool {
    true
}

impl LoggerSpec {
    pub fn with_level(level: Severity) -> Self {
        LoggerSpec { level: Some(level), handlers: Vec::new(), propagate: true }
    }
}

fn default_version() -> u32 {
    1
}

/// Complete logging configuration: formatters, handlers and loggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfiguration {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub formatters: BTreeMap<String, FormatterSpec>,
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerSpec>,
    #[serde(default)]
    pub loggers: BTreeMap<String, LoggerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<LoggerSpec>,
    /// Standard `dictConfig` keys, accepted so existing documents load;
    /// their values have no effect.
    #[serde(default, skip_serializing)]
    pub disable_existing_loggers: Option<IgnoredAny>,
    #[serde(default, skip_serializing)]
    pub incremental: Option<IgnoredAny>,
    #[serde(default, skip_serializing)]
    pub filters: Option<IgnoredAny>,
}

/// A partial configuration document. Absent sections inherit the default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverride {
    pub version: Option<u32>,
    pub formatters: Option<BTreeMap<String, FormatterSpec>>,
    pub handlers: Option<BTreeMap<String, HandlerSpec>>,
    pub loggers: Option<BTreeMap<String, LoggerSpec>>,
    pub root: Option<LoggerSpec>,
    /// Standard `dictConfig` keys, accepted so existing documents load;
    /// their values have no effect.
    pub disable_existing_loggers: Option<IgnoredAny>,
    pub incremental: Option<IgnoredAny>,
    pub filters: Option<IgnoredAny>,
}

impl LoggingConfiguration {
    /// Check that every reference between sections resolves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, handler) in &self.handlers {
            if !self.formatters.contains_key(&handler.formatter) {
                return Err(ConfigError::Format(format!(
                    "handler `{}` references unknown formatter `{}`",
                    name, handler.formatter
                )));
            }
            if handler.class == HandlerClass::File && handler.filename.is_none() {
                return Err(ConfigError::Format(format!("file handler `{}` has no filename", name)));
            }
        }

        let loggers = self
            .loggers
            .iter()
            .map(|(name, spec)| (name.as_str(), spec))
            .chain(self.root.iter().map(|spec| ("root", spec)));
        for (name, spec) in loggers {
            if let Some(missing) = spec.handlers.iter().find(|h| !self.handlers.contains_key(*h)) {
                return Err(ConfigError::Format(format!(
                    "logger `{}` references unknown handler `{}`",
                    name, missing
                )));
            }
        }
        Ok(())
    }
}

/// Apply `over` on top of `base` with block replacement.
pub fn merge(mut base: LoggingConfiguration, over: ConfigOverride) -> LoggingConfiguration {
    if let Some(version) = over.version {
        base.version = version;
    }
    if let Some(formatters) = over.formatters {
        base.formatters.extend(formatters);
    }
    if let Some(handlers) = over.handlers {
        base.handlers.extend(handlers);
    }
    if let Some(loggers) = over.loggers {
        base.loggers.extend(loggers);
    }
    if over.root.is_some() {
        base.root = over.root;
    }
    base
}

fn parse<T: serde::de::DeserializeOwned>(content: &str, file_type: ConfigFileType, origin: &str) -> Result<T, ConfigError> {
    let parsed = match file_type {
        ConfigFileType::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        ConfigFileType::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| ConfigError::Format(format!("{} ({}): {}", origin, file_type, reason)))
}

/// Parse the packaged default document.
pub fn load_default() -> Result<LoggingConfiguration, ConfigError> {
    load_from(DEFAULT_CONFIG, None, ConfigFileType::Yaml)
}

/// Load the packaged default, merged with the override at `override_path`.
pub fn load(override_path: Option<&Path>, file_type: ConfigFileType) -> Result<LoggingConfiguration, ConfigError> {
    load_from(DEFAULT_CONFIG, override_path, file_type)
}

/// Load `default_doc` (YAML), merged with the override at `override_path`
/// parsed as `file_type`.
///
/// **Errors**
/// - [`ConfigError::NotFound`] if `override_path` does not exist.
/// - [`ConfigError::Format`] if either document fails to parse or the merged
///   result has dangling references.
pub fn load_from(
    default_doc: &str,
    override_path: Option<&Path>,
    file_type: ConfigFileType,
) -> Result<LoggingConfiguration, ConfigError> {
    let mut config: LoggingConfiguration = parse(default_doc, ConfigFileType::Yaml, "default configuration")?;

    if let Some(path) = override_path {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let over: ConfigOverride = parse(&content, file_type, &path.display().to_string())?;
        config = merge(config, over);
    }

    config.validate()?;
    Ok(config)
}

/// Write the packaged default document verbatim to `dest`.
pub fn export_default(dest: &Path) -> Result<(), ConfigError> {
    fs::write(dest, DEFAULT_CONFIG).map_err(|source| ConfigError::Io {
        path: dest.to_path_buf(),
        source,
    })
}
