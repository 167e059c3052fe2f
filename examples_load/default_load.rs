use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use tracing_context_log::context::RequestContext;
use tracing_context_log::env::Settings;
use tracing_context_log::init::build_layer_with_sinks;
use tracing_context_log::noop_sink::NoopSink;
use tracing_context_log::sink::LogSink;

fn main() {
    let (layer, app) = build_layer_with_sinks(&Settings::default(), |_, _| {
        Ok(Arc::new(NoopSink) as Arc<dyn LogSink>)
    })
    .expect("default configuration loads");
    let emitted = Arc::clone(&layer.emitted_records);
    tracing::subscriber::set_global_default(Registry::default().with(layer)).expect("set global subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    let _scope = RequestContext::new("GET", "http://localhost/load", "127.0.0.1")
        .with_session_value("username", "loadtest")
        .enter();
    for i in 0..n {
        info!(logger = app.name(), iteration = i, "default load test record");
    }

    let elapsed = start.elapsed();
    println!("default config: formatted {} records in {:?} (~{:.0} rec/s), {} written",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64(),
        emitted.load(std::sync::atomic::Ordering::Relaxed),
    );
}
