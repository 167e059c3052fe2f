use std::fmt;
use std::fs;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing_context_log::context::RequestContext;
use tracing_context_log::env::Settings;
use tracing_context_log::init::{build_layer, build_layer_with_sinks, AppLogger};
use tracing_context_log::layer::ContextLayer;
use tracing_context_log::record::{LogRecord, Severity};
use tracing_context_log::sink::{LogSink, MemorySink};
use tracing::instrument::WithSubscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

fn capture(settings: &Settings) -> (ContextLayer, AppLogger, MemorySink) {
    let sink = MemorySink::new();
    let shared = sink.clone();
    let (layer, app) = build_layer_with_sinks(settings, move |_, _| {
        Ok(Arc::new(shared.clone()) as Arc<dyn LogSink>)
    })
    .unwrap();
    (layer, app, sink)
}

#[test]
fn outside_a_request_there_is_no_request_block() {
    let (layer, app, sink) = capture(&Settings::default());
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::info!(logger = app.name(), "info");
        tracing::warn!(logger = app.name(), "warning");
        tracing::error!(logger = app.name(), "error");
        tracing::error!(logger = app.name(), critical = true, "critical");
    });

    let records = sink.json_records();
    assert_eq!(records.len(), 4);
    for record in &records {
        assert!(record.get("request").is_none(), "unexpected request in {record}");
    }
    let severities: Vec<&str> = records.iter().map(|r| r["severity"].as_str().unwrap()).collect();
    assert_eq!(severities, ["INFO", "WARNING", "ERROR", "CRITICAL"]);
}

#[test]
fn inside_a_request_every_level_carries_the_request() {
    let (layer, app, sink) = capture(&Settings::default());
    let ctx = RequestContext::new("GET", "http://localhost:5000/orders/7", "192.0.2.10")
        .with_id(123_456_789)
        .with_session_value("username", "guest");

    tracing::subscriber::with_default(Registry::default().with(layer), || {
        let _scope = ctx.enter();
        tracing::info!(logger = app.name(), "info");
        tracing::warn!(logger = app.name(), "warning");
        tracing::error!(logger = app.name(), "error");
    });

    let records = sink.json_records();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(
            record["request"],
            json!({
                "method": "GET",
                "url": "http://localhost:5000/orders/7",
                "remoteIp": "192.0.2.10",
                "id": 123_456_789u64,
                "username": "guest",
            })
        );
    }
}

#[test]
fn extras_are_top_level_and_cannot_override_reserved_fields() {
    let (layer, app, sink) = capture(&Settings::default());
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::info!(
            logger = app.name(),
            formData.email = "ada@example.com",
            formData.plan = "pro",
            thread = "not-a-thread",
            message_id = 11,
            "form submitted"
        );
    });

    let records = sink.json_records();
    assert_eq!(records[0]["formData"], json!({"email": "ada@example.com", "plan": "pro"}));
    assert!(records[0]["thread"].is_u64());
    assert_eq!(records[0]["message_id"], 11);
    assert_eq!(records[0]["message"], "form submitted");
}

#[derive(Debug)]
struct Frame(usize, Option<Box<Frame>>);

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {}", self.0)
    }
}

impl std::error::Error for Frame {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.1.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

fn nested_error(depth: usize) -> Frame {
    (1..depth).rev().fold(Frame(depth - 1, None), |inner, i| Frame(i - 1, Some(Box::new(inner))))
}

#[test]
fn traceback_is_truncated_to_the_configured_limit() {
    let err = nested_error(50);
    let (layer, app, sink) = capture(&Settings::default());
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::error!(logger = app.name(), error = &err as &(dyn std::error::Error + 'static), "job failed");
    });
    let tb = sink.json_records()[0]["traceback"].as_array().unwrap().clone();
    assert_eq!(tb.len(), 20);
    assert_eq!(tb[0], "level 0");
    assert_eq!(tb[1], "caused by: level 1");

    let (layer, app, sink) = capture(&Settings { traceback_limit: 5, ..Settings::default() });
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::error!(logger = app.name(), error = &err as &(dyn std::error::Error + 'static), "job failed");
    });
    assert_eq!(sink.json_records()[0]["traceback"].as_array().unwrap().len(), 5);
}

#[test]
fn errors_without_an_attached_error_still_get_a_bounded_traceback() {
    let (layer, app, sink) = capture(&Settings { traceback_limit: 3, ..Settings::default() });
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::error!(logger = app.name(), "unexpected state");
    });
    let record = &sink.json_records()[0];
    let tb = record["traceback"].as_array().expect("ERROR records carry a traceback");
    assert!(!tb.is_empty());
    assert!(tb.len() <= 3);
    for frame in tb {
        let frame = frame.as_str().unwrap();
        assert!(!frame.starts_with("tracing_context_log::"), "internal frame {frame}");
        assert!(!frame.starts_with("tracing_subscriber::"), "internal frame {frame}");
        assert!(!frame.starts_with("tracing::"), "internal frame {frame}");
    }
}

#[test]
fn app_level_setting_filters_application_records() {
    let (layer, app, sink) = capture(&Settings { app_level: Some(Severity::Error), ..Settings::default() });
    let billing = app.child("billing");
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::warn!(logger = app.name(), "suppressed");
        tracing::warn!(logger = "gunicorn.error", "worker message");
        tracing::error!(logger = billing.name(), "kept");
    });
    let records = sink.json_records();
    let loggers: Vec<&str> = records.iter().map(|r| r["logger"].as_str().unwrap()).collect();
    assert_eq!(loggers, ["gunicorn_worker", "app.billing"]);
}

#[test]
fn direct_dispatch_uses_same_routing() {
    let (layer, _app, sink) = capture(&Settings::default());
    layer.dispatch(&LogRecord::new(Severity::Debug, "gunicorn.error.app", "dropped"));
    layer.dispatch(
        &LogRecord::new(Severity::Info, "gunicorn.error.app", "kept")
            .at("worker.rs", "jobs::run", 3)
            .with_extra("attempt", &2),
    );
    let records = sink.json_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["line"], "worker.rs#jobs::run:3");
    assert_eq!(records[0]["attempt"], 2);
    assert_eq!(layer.emitted_records.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_see_each_other() {
    let (layer, app, sink) = capture(&Settings::default());
    let dispatch = tracing::Dispatch::new(Registry::default().with(layer));

    let mut tasks = Vec::new();
    for id in 0..16u64 {
        let app = app.clone();
        let ctx = RequestContext::new("GET", format!("http://localhost/item/{id}"), "127.0.0.1").with_id(id);
        let work = ctx.scope(async move {
            for step in 0..5u64 {
                tokio::task::yield_now().await;
                tracing::info!(logger = app.name(), request_id = id, step = step, "working");
            }
        });
        tasks.push(tokio::spawn(work.with_subscriber(dispatch.clone())));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let records: Vec<Value> = sink
        .json_records()
        .into_iter()
        .filter(|r| r.get("request_id").is_some())
        .collect();
    assert_eq!(records.len(), 80);
    for record in records {
        assert_eq!(record["request"]["id"], record["request_id"]);
        assert_eq!(
            record["request"]["url"],
            format!("http://localhost/item/{}", record["request_id"])
        );
    }
}

#[test]
fn file_handler_from_override_document() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    let override_path = dir.path().join("logging.yml");
    fs::write(
        &override_path,
        format!(
            "handlers:\n  console:\n    class: file\n    filename: {}\n    formatter: json\n",
            log_path.display()
        ),
    )
    .unwrap();

    let settings = Settings {
        config_filename: Some(override_path),
        ..Settings::default()
    };
    let (layer, app) = build_layer(&settings).unwrap();
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::info!(logger = app.name(), "to the file");
    });

    let content = fs::read_to_string(&log_path).unwrap();
    let record: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(record["message"], "to the file");
    assert_eq!(record["logger"], "app");
}

#[test]
fn override_document_level_for_app_logger_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    let override_path = dir.path().join("logging.yml");
    fs::write(&override_path, "loggers:\n  gunicorn.error.app:\n    level: DEBUG\n").unwrap();

    let settings = Settings {
        config_filename: Some(override_path),
        ..Settings::default()
    };
    let (layer, app, sink) = capture(&settings);
    assert_eq!(layer.level_for(app.name()), Severity::Debug);
    tracing::subscriber::with_default(Registry::default().with(layer), || {
        tracing::debug!(logger = app.name(), "cache warmed");
    });
    let records = sink.json_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["severity"], "DEBUG");
}
