use crate::config::{ConfigError, HandlerClass, HandlerSpec};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

/// Synchronous destination for rendered log lines.
///
/// Implementations are responsible for serializing concurrent writes so that
/// two records never interleave. The layer calls `write` on the thread that
/// emitted the event and waits for it to return.
pub trait LogSink: Send + Sync {
    /// Write one rendered record.
    ///
    /// **Parameters**
    /// - `line`: a fully formatted record without a trailing newline.
    ///
    /// **Returns**
    /// - `Ok(())` once the record has been handed to the underlying writer.
    /// - `Err(..)` on I/O failure. The layer reports the error on stderr and
    ///   carries on; the emitting code never sees it.
    fn write(&self, line: &str) -> io::Result<()>;

    /// Flush any buffered output. Default implementation is a no-op.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Standard stream a stream handler writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTarget {
    Stdout,
    Stderr,
}

/// Sink over any writer, guarded by a single lock.
pub struct WriterSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl WriterSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        WriterSink { writer: Mutex::new(Box::new(writer)) }
    }

    pub fn stream(target: StreamTarget) -> Self {
        match target {
            StreamTarget::Stdout => WriterSink::new(io::stdout()),
            StreamTarget::Stderr => WriterSink::new(io::stderr()),
        }
    }

    /// Append to `path`, creating it and its directory if needed. The file
    /// is opened immediately and never rotated.
    pub fn file(path: &Path) -> Result<Self, InitError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(name)
            .build(dir)?;
        Ok(WriterSink::new(appender))
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        // A panic while holding the lock leaves at worst a partial line.
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LogSink for WriterSink {
    fn write(&self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.lock().write_all(buf.as_bytes())
    }

    fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }
}

/// Keeps every record in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Records parsed as JSON; lines that are not JSON are skipped.
    pub fn json_records(&self) -> Vec<serde_json::Value> {
        self.lines()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl LogSink for MemorySink {
    fn write(&self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line.to_string());
        Ok(())
    }
}

/// Create the sink a handler describes.
///
/// Stream handlers default to stdout; file handlers open their file in append
/// mode at startup so a bad path fails before the first record is written.
pub fn make_sink(spec: &HandlerSpec) -> Result<Arc<dyn LogSink>, ConfigError> {
    match spec.class {
        HandlerClass::Stream => {
            let target = spec.stream.unwrap_or(StreamTarget::Stdout);
            Ok(Arc::new(WriterSink::stream(target)) as Arc<dyn LogSink>)
        }
        HandlerClass::File => {
            let path = spec
                .filename
                .as_deref()
                .ok_or_else(|| ConfigError::Format("file handler has no filename".to_string()))?;
            if path.file_name().is_none() {
                return Err(ConfigError::Format(format!("file handler path `{}` names no file", path.display())));
            }
            let sink = WriterSink::file(path).map_err(|source| ConfigError::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Arc::new(sink) as Arc<dyn LogSink>)
        }
    }
}
