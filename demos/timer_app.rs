//! Simulated request handlers logging through the default configuration.
//!
//! Run with `LOG_CONFIG_PRETTY_JSON=1 cargo run --example timer_app` and
//! `DEMO_SLEEP_SECS` to change how long the slow handler takes.

use std::time::Duration;
use tracing_context_log::context::RequestContext;
use tracing_context_log::env::{env_or, Settings};
use tracing_context_log::init::{init_logging, AppLogger};

async fn timer_example(app: &AppLogger, sleep_secs: u64) -> String {
    let timer = app.timer("handlers", 5.0);
    timer
        .time_async("timer_example", async {
            tracing::info!(logger = app.name(), "Sleeping for {} seconds", sleep_secs);
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
            format!("You slept for {} seconds", sleep_secs)
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    let app = init_logging(&settings)?;
    let slow: u64 = env_or("DEMO_SLEEP_SECS", "6").parse()?;

    let fast = RequestContext::new("GET", "http://localhost:5000/timeout/1", "127.0.0.1")
        .with_session_value("username", "guest");
    let slow_req = RequestContext::new("GET", format!("http://localhost:5000/timeout/{}", slow), "127.0.0.1")
        .with_header("X-Forwarded-For", "203.0.113.9");

    let (a, b) = tokio::join!(
        fast.scope(timer_example(&app, 1)),
        slow_req.scope(timer_example(&app, slow)),
    );
    tracing::info!(logger = app.name(), fast = %a, slow = %b, "handlers finished");
    Ok(())
}
