//! Frame lists attached to ERROR and CRITICAL records.
//!
//! Ordering is innermost-first everywhere: native backtraces keep Rust's own
//! order (capture site first), error chains start at the reported error and
//! walk down through `source()`.

use std::backtrace::Backtrace;
use std::error::Error;

/// Default number of frames kept per record.
pub const DEFAULT_TRACEBACK_LIMIT: usize = 20;

/// Symbol prefixes belonging to the logging machinery itself.
const INTERNAL_PREFIXES: [&str; 5] = [
    "std::backtrace",
    "tracing_core::",
    "tracing_subscriber::",
    "tracing::",
    "tracing_context_log::",
];

/// The reported error followed by each of its causes.
pub fn error_chain(err: &(dyn Error + 'static)) -> Vec<String> {
    let mut frames = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        frames.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    frames
}

/// Capture the current stack, without the logging machinery's own frames.
pub fn capture() -> Vec<String> {
    parse_backtrace(&Backtrace::force_capture().to_string())
}

/// Split the `Display` form of a [`Backtrace`] into one string per frame.
///
/// A frame starts at a `N: symbol` line; the `at file:line` line that follows
/// it is folded into the same entry.
pub fn parse_backtrace(rendered: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    for raw in rendered.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(symbol) = frame_symbol(line) {
            frames.push(symbol.to_string());
        } else if let Some(location) = line.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                last.push_str(" at ");
                last.push_str(location);
            }
        }
    }
    frames.retain(|frame| !is_internal(frame));
    frames
}

fn frame_symbol(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(rest.trim())
}

fn is_internal(frame: &str) -> bool {
    let symbol = frame.trim_start_matches('<');
    INTERNAL_PREFIXES.iter().any(|p| symbol.starts_with(p))
}

/// Keep at most `limit` frames, innermost first.
pub fn truncate(frames: &[String], limit: usize) -> Vec<String> {
    frames.iter().take(limit).cloned().collect()
}
