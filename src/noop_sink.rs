use crate::sink::LogSink;
use std::io;

/// A sink that simply drops all records.
///
/// Useful for measuring the cost of routing and formatting without any
/// output I/O.
#[derive(Clone, Default)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn write(&self, _line: &str) -> io::Result<()> {
        Ok(())
    }
}
