use crate::context::{current_request, RequestContext};
use crate::record::{LogRecord, RequestInfo, StructuredRecord, RESERVED_FIELDS};
use crate::traceback::{self, DEFAULT_TRACEBACK_LIMIT};
use chrono::SecondsFormat;
use serde_json::Value;
use std::fmt::Write as _;

/// Logger every application record is a child of when running under the
/// process manager.
pub const ROOT_LOGGER: &str = "gunicorn.error";

/// Name shown for records logged on [`ROOT_LOGGER`] itself.
pub const WORKER_NAME: &str = "gunicorn_worker";

/// Output layout of a [`ContextualFormatter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json { pretty: bool },
    Text,
}

/// Resolved settings for one formatter instance.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatterSettings {
    pub output: OutputFormat,
    pub root_logger: String,
    pub worker_name: String,
    pub user_header: Option<String>,
    pub session_user_key: Option<String>,
    pub traceback_limit: usize,
}

impl Default for FormatterSettings {
    fn default() -> Self {
        FormatterSettings {
            output: OutputFormat::Json { pretty: false },
            root_logger: ROOT_LOGGER.to_string(),
            worker_name: WORKER_NAME.to_string(),
            user_header: None,
            session_user_key: Some("username".to_string()),
            traceback_limit: DEFAULT_TRACEBACK_LIMIT,
        }
    }
}

/// Turns a [`LogRecord`] into a [`StructuredRecord`] enriched with the active
/// request scope, and serializes it.
///
/// Holds no mutable state; one instance is shared by every thread that logs
/// through the handler owning it.
#[derive(Debug, Clone, Default)]
pub struct ContextualFormatter {
    settings: FormatterSettings,
}

impl ContextualFormatter {
    pub fn new(settings: FormatterSettings) -> Self {
        ContextualFormatter { settings }
    }

    pub fn settings(&self) -> &FormatterSettings {
        &self.settings
    }

    /// Remove the process manager's logger prefix so application loggers
    /// appear under their own names.
    ///
    /// `gunicorn.error.app` becomes `app`, `gunicorn.error` becomes the worker
    /// name, and names without the prefix are returned unchanged.
    pub fn sanitize_logger_name(&self, name: &str) -> String {
        let prefix = self.settings.root_logger.as_str();
        if prefix.is_empty() || !name.contains(prefix) {
            return name.to_string();
        }

        let mut stripped = name.to_string();
        while stripped.contains(prefix) {
            stripped = stripped.replace(prefix, "");
        }
        let joined = stripped
            .split('.')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(".");

        if joined.is_empty() {
            self.settings.worker_name.clone()
        } else {
            joined
        }
    }

    /// Assemble the structured record, reading the current request scope.
    pub fn build(&self, record: &LogRecord) -> StructuredRecord {
        let request = current_request().ok().map(|ctx| self.request_info(&ctx));
        self.build_with_request(record, request)
    }

    /// Assemble the structured record for an explicitly supplied request.
    pub fn build_for(&self, record: &LogRecord, ctx: Option<&RequestContext>) -> StructuredRecord {
        self.build_with_request(record, ctx.map(|c| self.request_info(c)))
    }

    fn build_with_request(&self, record: &LogRecord, request: Option<RequestInfo>) -> StructuredRecord {
        let traceback = (record.severity.has_traceback() && !record.frames.is_empty())
            .then(|| traceback::truncate(&record.frames, self.settings.traceback_limit));

        let mut extra = record.extra.clone();
        for reserved in RESERVED_FIELDS {
            extra.remove(reserved);
        }
        if traceback.is_some() {
            extra.remove("traceback");
        }

        StructuredRecord {
            severity: record.severity,
            message: record.message.clone(),
            line: record.locator(),
            logger: self.sanitize_logger_name(&record.logger),
            thread: record.thread,
            request,
            extra,
            traceback,
            timestamp: record.timestamp,
        }
    }

    fn request_info(&self, ctx: &RequestContext) -> RequestInfo {
        RequestInfo {
            method: ctx.method().to_string(),
            url: ctx.url().to_string(),
            remote_ip: ctx.remote_ip().to_string(),
            id: ctx.id(),
            username: ctx.username(
                self.settings.user_header.as_deref(),
                self.settings.session_user_key.as_deref(),
            ),
        }
    }

    /// Render `record` in this formatter's output format.
    pub fn format(&self, record: &LogRecord) -> String {
        self.render(&self.build(record))
    }

    pub fn render(&self, structured: &StructuredRecord) -> String {
        match self.settings.output {
            OutputFormat::Json { pretty } => render_json(structured, pretty),
            OutputFormat::Text => render_text(structured),
        }
    }
}

fn render_json(structured: &StructuredRecord, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(structured)
    } else {
        serde_json::to_string(structured)
    };
    rendered.unwrap_or_else(|e| {
        serde_json::json!({
            "severity": structured.severity,
            "message": structured.message,
            "logger": structured.logger,
            "formatError": e.to_string(),
        })
        .to_string()
    })
}

fn render_text(structured: &StructuredRecord) -> String {
    let mut out = format!(
        "{} {} [{}] {} thread={}: {}",
        structured.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        structured.severity,
        structured.logger,
        structured.line,
        structured.thread,
        structured.message,
    );
    if let Some(request) = &structured.request {
        if let Ok(json) = serde_json::to_string(request) {
            let _ = write!(out, " request={}", json);
        }
    }
    for (key, value) in &structured.extra {
        match value {
            Value::String(s) => {
                let _ = write!(out, " {}={}", key, s);
            }
            other => {
                let _ = write!(out, " {}={}", key, other);
            }
        }
    }
    if let Some(frames) = &structured.traceback {
        for frame in frames {
            let _ = write!(out, "\n    {}", frame);
        }
    }
    out
}
