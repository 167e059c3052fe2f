use crate::config::{ConfigError, HandlerSpec, LoggerSpec, LoggingConfiguration};
use crate::formatter::ContextualFormatter;
use crate::record::{current_thread_id, float_value, LogRecord, Severity};
use crate::sink::{make_sink, LogSink};
use crate::traceback;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Event field that overrides the logger name (default: the event target).
pub const LOGGER_FIELD: &str = "logger";

/// Boolean event field that raises an ERROR event to CRITICAL.
pub const CRITICAL_FIELD: &str = "critical";

/// Level used when neither the logger chain nor root sets one.
const FALLBACK_LEVEL: Severity = Severity::Warning;

struct Handler {
    name: String,
    level: Option<Severity>,
    formatter: Arc<ContextualFormatter>,
    sink: Arc<dyn LogSink>,
}

#[derive(Debug, Clone, Default)]
struct Route {
    level: Option<Severity>,
    handlers: Vec<usize>,
    propagate: bool,
}

/// `tracing_subscriber` layer that renders every event as a structured record
/// and writes it synchronously to the configured handlers.
///
/// Loggers form a dotted hierarchy: a record for `a.b.c` is governed by the
/// most specific configured logger among `a.b.c`, `a.b`, `a`, then root. The
/// first level found in that chain decides whether the record is kept; the
/// handlers of every logger in the chain receive it, up to and including the
/// first logger with `propagate: false`.
pub struct ContextLayer {
    handlers: Vec<Handler>,
    loggers: BTreeMap<String, Route>,
    root: Route,
    /// Total events seen by the layer (before level filtering).
    pub total_events: Arc<AtomicU64>,
    /// Records successfully written, counted once per handler.
    pub emitted_records: Arc<AtomicU64>,
    /// Writes that failed in a sink.
    pub failed_writes: Arc<AtomicU64>,
}

impl ContextLayer {
    /// Build the layer from a validated configuration, opening the sink each
    /// handler describes.
    pub fn from_config(config: &LoggingConfiguration) -> Result<Self, ConfigError> {
        Self::with_sinks(config, |_, spec| make_sink(spec))
    }

    /// Build the layer, obtaining each handler's sink from `sink_for`.
    pub fn with_sinks<F>(config: &LoggingConfiguration, sink_for: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str, &HandlerSpec) -> Result<Arc<dyn LogSink>, ConfigError>,
    {
        config.validate()?;

        let formatters: BTreeMap<&str, Arc<ContextualFormatter>> = config
            .formatters
            .iter()
            .map(|(name, spec)| (name.as_str(), Arc::new(ContextualFormatter::new(spec.settings()))))
            .collect();

        let mut handlers = Vec::with_capacity(config.handlers.len());
        let mut index = BTreeMap::new();
        for (name, spec) in &config.handlers {
            let formatter = formatters
                .get(spec.formatter.as_str())
                .cloned()
                .ok_or_else(|| ConfigError::Format(format!("unknown formatter `{}`", spec.formatter)))?;
            index.insert(name.as_str(), handlers.len());
            handlers.push(Handler {
                name: name.clone(),
                level: spec.level,
                formatter,
                sink: sink_for(name, spec)?,
            });
        }

        let route = |spec: &LoggerSpec| Route {
            level: spec.level,
            handlers: spec.handlers.iter().filter_map(|h| index.get(h.as_str()).copied()).collect(),
            propagate: spec.propagate,
        };

        Ok(ContextLayer {
            loggers: config.loggers.iter().map(|(name, spec)| (name.clone(), route(spec))).collect(),
            root: config.root.as_ref().map(route).unwrap_or_default(),
            handlers,
            total_events: Arc::new(AtomicU64::new(0)),
            emitted_records: Arc::new(AtomicU64::new(0)),
            failed_writes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Configured loggers governing `name`, most specific first.
    fn chain(&self, name: &str) -> Vec<&Route> {
        let mut chain = Vec::new();
        let mut current = name;
        loop {
            if let Some(route) = self.loggers.get(current) {
                chain.push(route);
            }
            match current.rfind('.') {
                Some(dot) => current = &current[..dot],
                None => break,
            }
        }
        chain
    }

    fn effective_level(&self, chain: &[&Route]) -> Severity {
        chain
            .iter()
            .find_map(|route| route.level)
            .or(self.root.level)
            .unwrap_or(FALLBACK_LEVEL)
    }

    /// Effective level of logger `name`.
    pub fn level_for(&self, name: &str) -> Severity {
        self.effective_level(&self.chain(name))
    }

    /// Handlers that would receive a record, or `None` if it is filtered out.
    fn route(&self, record: &LogRecord) -> Option<Vec<usize>> {
        let chain = self.chain(&record.logger);
        if record.severity < self.effective_level(&chain) {
            return None;
        }

        let mut targets: Vec<usize> = Vec::new();
        let mut reached_root = true;
        for route in &chain {
            targets.extend(&route.handlers);
            if !route.propagate {
                reached_root = false;
                break;
            }
        }
        if reached_root {
            targets.extend(&self.root.handlers);
        }

        let mut seen = Vec::with_capacity(targets.len());
        targets.retain(|idx| {
            let first = !seen.contains(idx);
            seen.push(*idx);
            first && record.severity.passes(self.handlers[*idx].level)
        });
        (!targets.is_empty()).then_some(targets)
    }

    /// Route and write a record built outside of `tracing`.
    pub fn dispatch(&self, record: &LogRecord) {
        if let Some(targets) = self.route(record) {
            self.emit(record, &targets);
        }
    }

    fn emit(&self, record: &LogRecord, targets: &[usize]) {
        for idx in targets {
            let handler = &self.handlers[*idx];
            let line = handler.formatter.format(record);
            match handler.sink.write(&line) {
                Ok(()) => {
                    self.emitted_records.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed_writes.fetch_add(1, Ordering::Relaxed);
                    eprintln!("log handler `{}` failed to write record: {}", handler.name, e);
                }
            }
        }
    }

    /// Flush every handler's sink.
    pub fn flush(&self) {
        for handler in &self.handlers {
            if let Err(e) = handler.sink.flush() {
                eprintln!("log handler `{}` failed to flush: {}", handler.name, e);
            }
        }
    }
}

impl<S> Layer<S> for ContextLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let module = meta
            .file()
            .map(|f| Path::new(f).file_name().and_then(|n| n.to_str()).unwrap_or(f).to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let mut record = LogRecord {
            timestamp: Utc::now(),
            severity: Severity::from_tracing(meta.level(), visitor.critical),
            message: visitor.message.unwrap_or_default(),
            logger: visitor.logger.unwrap_or_else(|| meta.target().replace("::", ".")),
            module,
            function: meta.module_path().unwrap_or("<unknown>").to_string(),
            line: meta.line().unwrap_or(0),
            thread: current_thread_id(),
            extra: visitor.fields,
            frames: visitor.frames,
        };

        let Some(targets) = self.route(&record) else {
            return;
        };
        if record.severity.has_traceback() && record.frames.is_empty() {
            record.frames = traceback::capture();
        }
        self.emit(&record, &targets);
    }
}

/// Collects an event's fields into extras, pulling out the message and the
/// control fields. Dotted names (`timer.elapsedTime`) nest into objects.
#[derive(Default)]
pub struct FieldVisitor {
    pub fields: BTreeMap<String, Value>,
    pub message: Option<String>,
    pub logger: Option<String>,
    pub critical: bool,
    pub frames: Vec<String>,
}

impl FieldVisitor {
    fn insert(&mut self, name: &str, value: Value) {
        match name {
            "message" => {
                self.message = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            LOGGER_FIELD => {
                self.logger = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            CRITICAL_FIELD if value.is_boolean() => self.critical = value == Value::Bool(true),
            _ => insert_path(&mut self.fields, name, value),
        }
    }
}

fn insert_path(fields: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            fields.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = fields.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            insert_nested(entry, rest, value);
        }
    }
}

fn insert_nested(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            insert_nested(entry, rest, value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field.name(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field.name(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field.name(), float_value(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field.name(), Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        if self.frames.is_empty() {
            self.frames = traceback::error_chain(value);
        }
        self.insert(field.name(), Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field.name(), Value::String(format!("{:?}", value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_default;
    use crate::sink::MemorySink;
    use serde_json::json;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    fn layer_with(sink: &MemorySink) -> ContextLayer {
        let config = load_default().unwrap();
        let sink = sink.clone();
        ContextLayer::with_sinks(&config, move |_, _| Ok(Arc::new(sink.clone()) as Arc<dyn LogSink>)).unwrap()
    }

    #[test]
    fn dotted_fields_nest() {
        let mut fields = BTreeMap::new();
        insert_path(&mut fields, "formData.user.name", json!("ada"));
        insert_path(&mut fields, "formData.count", json!(2));
        insert_path(&mut fields, "plain", json!(true));
        assert_eq!(fields["formData"], json!({"user": {"name": "ada"}, "count": 2}));
        assert_eq!(fields["plain"], json!(true));
    }

    #[test]
    fn effective_level_comes_from_nearest_ancestor() {
        let layer = layer_with(&MemorySink::new());
        assert_eq!(layer.level_for("gunicorn.error.app.jobs"), Severity::Info);
        assert_eq!(layer.level_for("my_app.jobs"), Severity::Warning);
    }

    #[test]
    fn events_become_structured_records() {
        let sink = MemorySink::new();
        let subscriber = Registry::default().with(layer_with(&sink));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(logger = "gunicorn.error.app", formData.name = "Ada", attempt = 3, "saved {}", "form");
            tracing::debug!(logger = "gunicorn.error.app", "below the INFO threshold");
            tracing::info!("root only passes WARNING and above");
            tracing::warn!(target: "my_app::jobs", ratio = f64::NAN, "queue is slow");
        });

        let records = sink.json_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["logger"], "app");
        assert_eq!(records[0]["message"], "saved form");
        assert_eq!(records[0]["formData"], json!({"name": "Ada"}));
        assert_eq!(records[0]["attempt"], 3);
        assert!(records[0]["line"].as_str().unwrap().starts_with("layer.rs#tracing_context_log::layer::tests:"));
        assert_eq!(records[1]["logger"], "my_app.jobs");
        assert_eq!(records[1]["severity"], "WARNING");
        assert_eq!(records[1]["ratio"], "NaN");
    }

    #[test]
    fn critical_flag_and_error_chain() {
        let sink = MemorySink::new();
        let subscriber = Registry::default().with(layer_with(&sink));
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(logger = "gunicorn.error.app", critical = true, error = &err as &(dyn std::error::Error + 'static), "cannot persist");
        });

        let records = sink.json_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["severity"], "CRITICAL");
        assert_eq!(records[0]["error"], "disk full");
        assert_eq!(records[0]["traceback"], json!(["disk full"]));
        assert!(records[0].get("critical").is_none());
    }
}
