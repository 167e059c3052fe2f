use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Log importance level, ordered `Debug < Info < Warning < Error < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    #[serde(alias = "WARN")]
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// `tracing` has no CRITICAL level; `critical` upgrades an ERROR event.
    pub fn from_tracing(level: &tracing::Level, critical: bool) -> Self {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::WARN => Severity::Warning,
            tracing::Level::ERROR if critical => Severity::Critical,
            tracing::Level::ERROR => Severity::Error,
        }
    }

    pub fn has_traceback(&self) -> bool {
        *self >= Severity::Error
    }

    /// Whether a record at this severity passes an optional `threshold`.
    pub fn passes(&self, threshold: Option<Severity>) -> bool {
        threshold.map_or(true, |t| *self >= t)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name is not one of the known severities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown log level `{0}`")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "WARNING" | "WARN" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" | "FATAL" => Ok(Severity::Critical),
            _ => Err(UnknownSeverity(s.to_string())),
        }
    }
}

/// A log event as produced at the call site, before any enrichment.
///
/// Built by [`ContextLayer`](crate::layer::ContextLayer) from `tracing` events,
/// or directly by callers that format records without a subscriber.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub logger: String,
    pub module: String,
    pub function: String,
    pub line: u32,
    pub thread: u64,
    pub extra: BTreeMap<String, Value>,
    /// Stack frames, innermost first. Only rendered for ERROR and above.
    pub frames: Vec<String>,
}

impl LogRecord {
    pub fn new(severity: Severity, logger: impl Into<String>, message: impl Into<String>) -> Self {
        LogRecord {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            logger: logger.into(),
            module: String::new(),
            function: String::new(),
            line: 0,
            thread: current_thread_id(),
            extra: BTreeMap::new(),
            frames: Vec::new(),
        }
    }

    pub fn at(mut self, module: impl Into<String>, function: impl Into<String>, line: u32) -> Self {
        self.module = module.into();
        self.function = function.into();
        self.line = line;
        self
    }

    /// Attach an extra field. Values that cannot be represented as JSON are
    /// stored as their string form.
    pub fn with_extra<T>(mut self, key: impl Into<String>, value: &T) -> Self
    where
        T: Serialize + fmt::Display + ?Sized,
    {
        self.extra.insert(key.into(), coerce(value));
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self
    }

    /// `<module>#<function>:<line>`
    pub fn locator(&self) -> String {
        format!("{}#{}:{}", self.module, self.function, self.line)
    }
}

/// Raised when an extra value has no JSON representation.
#[derive(thiserror::Error, Debug)]
#[error("extra value could not be serialized, stored as string: {reason}")]
pub struct SerializationWarning {
    pub reason: String,
}

/// Convert a value to JSON.
pub fn try_to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, SerializationWarning> {
    serde_json::to_value(value).map_err(|e| SerializationWarning { reason: e.to_string() })
}

/// Convert a value to JSON, falling back to its `Display` form.
pub fn coerce<T: Serialize + fmt::Display + ?Sized>(value: &T) -> Value {
    try_to_value(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

/// JSON has no NaN or infinity.
pub fn float_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

/// Request block of a [`StructuredRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub remote_ip: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// The enriched, serialization-ready form of a [`LogRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct StructuredRecord {
    pub severity: Severity,
    pub message: String,
    pub line: String,
    pub logger: String,
    pub thread: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestInfo>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
    #[serde(skip)]
    pub timestamp: DateTime<Utc>,
}

/// Field names owned by the formatter; extras with these names are dropped.
pub const RESERVED_FIELDS: [&str; 6] = ["severity", "message", "line", "logger", "thread", "request"];

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Numeric identifier of the calling thread, stable for the thread's lifetime.
pub fn current_thread_id() -> u64 {
    THREAD_ID
        .try_with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
        .unwrap_or(0)
}
