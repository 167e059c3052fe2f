use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use serde_json::Value;
use tracing_context_log::env::Settings;
use tracing_context_log::init::{build_layer_with_sinks, AppLogger};
use tracing_context_log::sink::{LogSink, MemorySink};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

fn with_capture<R>(f: impl FnOnce(&AppLogger) -> R) -> (R, Vec<Value>) {
    let sink = MemorySink::new();
    let shared = sink.clone();
    let (layer, app) = build_layer_with_sinks(&Settings::default(), move |_, _| {
        Ok(Arc::new(shared.clone()) as Arc<dyn LogSink>)
    })
    .unwrap();
    let out = tracing::subscriber::with_default(Registry::default().with(layer), || f(&app));
    (out, sink.json_records())
}

fn timer_records(records: &[Value]) -> Vec<&Value> {
    records.iter().filter(|r| r.get("timer").is_some()).collect()
}

#[test]
fn slow_operation_emits_one_warning() {
    let (out, records) = with_capture(|app| {
        let timer = app.timer("reports", 0.05);
        timer.time("build_report", || {
            sleep(Duration::from_millis(80));
            "done"
        })
    });
    assert_eq!(out, "done");

    let timed = timer_records(&records);
    assert_eq!(timed.len(), 1);
    let record = timed[0];
    assert_eq!(record["severity"], "WARNING");
    assert_eq!(record["logger"], "app.timer.reports");
    assert!(record["message"].as_str().unwrap().starts_with("Timer result: "));

    let timer = &record["timer"];
    assert!(timer["elapsedTime"].as_f64().unwrap() >= 0.08);
    assert_eq!(timer["timedFunc"], "build_report");
    assert_eq!(timer["namespace"], "reports");
    assert!(timer["startTime"].as_str().unwrap() <= timer["endTime"].as_str().unwrap());
}

#[test]
fn fast_operation_is_silent() {
    let (_, records) = with_capture(|app| {
        let timer = app.timer("reports", 0.5);
        timer.time("quick", || sleep(Duration::from_millis(5)))
    });
    assert!(timer_records(&records).is_empty());
}

#[test]
fn failing_operation_is_timed_and_error_returned() {
    let (out, records) = with_capture(|app| {
        let timer = app.timer("payments", 0.02);
        let result: Result<u32, String> = timer.time("charge", || {
            sleep(Duration::from_millis(40));
            Err("card declined".to_string())
        });
        result
    });
    assert_eq!(out, Err("card declined".to_string()));
    let timed = timer_records(&records);
    assert_eq!(timed.len(), 1);
    assert_eq!(timed[0]["timer"]["timedFunc"], "charge");
}

#[test]
fn panicking_operation_is_timed_while_unwinding() {
    let (caught, records) = with_capture(|app| {
        let timer = app.timer("jobs", 0.02);
        catch_unwind(AssertUnwindSafe(|| {
            timer.time("explode", || {
                sleep(Duration::from_millis(40));
                panic!("worker crashed");
            })
        }))
    });
    assert!(caught.is_err());
    let timed = timer_records(&records);
    assert_eq!(timed.len(), 1);
    assert_eq!(timed[0]["timer"]["timedFunc"], "explode");
}

#[test]
fn guard_covers_early_return() {
    fn lookup(app: &AppLogger, key: &str) -> Option<u32> {
        let timer = app.timer("cache", 0.01);
        let _guard = timer.start("lookup");
        sleep(Duration::from_millis(30));
        if key.is_empty() {
            return None;
        }
        Some(1)
    }

    let (out, records) = with_capture(|app| lookup(app, ""));
    assert_eq!(out, None);
    assert_eq!(timer_records(&records).len(), 1);
}

#[tokio::test]
async fn async_operation_is_timed() {
    let sink = MemorySink::new();
    let shared = sink.clone();
    let (layer, app) = build_layer_with_sinks(&Settings::default(), move |_, _| {
        Ok(Arc::new(shared.clone()) as Arc<dyn LogSink>)
    })
    .unwrap();
    let _default = tracing::subscriber::set_default(Registry::default().with(layer));

    let timer = app.timer("http", 0.02);
    let body = timer
        .time_async("fetch", async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            42
        })
        .await;
    assert_eq!(body, 42);

    let records = sink.json_records();
    let timed = timer_records(&records);
    assert_eq!(timed.len(), 1);
    assert_eq!(timed[0]["logger"], "app.timer.http");
}
