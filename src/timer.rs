use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

/// Outcome of one timed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerResult {
    pub start_time: DateTime<Utc>,
    /// `start_time` plus the measured elapsed time.
    pub end_time: DateTime<Utc>,
    /// Seconds, measured with a monotonic clock.
    pub elapsed_time: f64,
    pub timed_func: String,
    pub namespace: String,
}

/// Measures units of work and logs a WARNING when one runs longer than the
/// threshold. Fast runs log nothing.
///
/// The record goes to logger `<app>.timer.<namespace>` with message
/// `Timer result: <elapsed>` and a `timer` object holding the [`TimerResult`].
#[derive(Debug, Clone)]
pub struct ScopedTimer {
    logger: String,
    namespace: String,
    threshold: Duration,
}

impl ScopedTimer {
    /// `threshold` is in seconds. Negative or NaN values count as zero;
    /// infinite or out-of-range values mean the timer never reports.
    pub fn new(app_logger: &str, namespace: impl Into<String>, threshold: f64) -> Self {
        let namespace = namespace.into();
        ScopedTimer {
            logger: format!("{}.timer.{}", app_logger, namespace),
            namespace,
            threshold: threshold_duration(threshold),
        }
    }

    pub fn logger_name(&self) -> &str {
        &self.logger
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start measuring. The check runs when the guard is dropped, including
    /// during unwinding and on early returns.
    pub fn start(&self, timed_func: impl Into<String>) -> TimerGuard<'_> {
        TimerGuard {
            timer: self,
            timed_func: timed_func.into(),
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Run `f` under a timer and hand back its result untouched.
    pub fn time<T>(&self, timed_func: &str, f: impl FnOnce() -> T) -> T {
        let _guard = self.start(timed_func);
        f()
    }

    /// Await `fut` under a timer and hand back its output untouched.
    pub async fn time_async<F: Future>(&self, timed_func: &str, fut: F) -> F::Output {
        let _guard = self.start(timed_func);
        fut.await
    }

    fn report(&self, result: &TimerResult) {
        tracing::warn!(
            logger = %self.logger,
            timer.startTime = %result.start_time.to_rfc3339_opts(SecondsFormat::Micros, true),
            timer.endTime = %result.end_time.to_rfc3339_opts(SecondsFormat::Micros, true),
            timer.elapsedTime = result.elapsed_time,
            timer.timedFunc = %result.timed_func,
            timer.namespace = %result.namespace,
            "Timer result: {}",
            result.elapsed_time
        );
    }
}

fn threshold_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Active measurement started by [`ScopedTimer::start`].
#[must_use = "the measurement ends when the guard is dropped"]
pub struct TimerGuard<'a> {
    timer: &'a ScopedTimer,
    timed_func: String,
    start_time: DateTime<Utc>,
    started: Instant,
}

impl TimerGuard<'_> {
    fn finish(&mut self) -> Option<TimerResult> {
        let elapsed = self.started.elapsed();
        if elapsed <= self.timer.threshold {
            return None;
        }
        let end_time = chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| self.start_time.checked_add_signed(d))
            .unwrap_or_else(Utc::now);
        Some(TimerResult {
            start_time: self.start_time,
            end_time,
            elapsed_time: elapsed.as_secs_f64(),
            timed_func: std::mem::take(&mut self.timed_func),
            namespace: self.timer.namespace.clone(),
        })
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        if let Some(result) = self.finish() {
            self.timer.report(&result);
        }
    }
}
