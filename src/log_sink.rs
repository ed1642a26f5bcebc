//! Request Log Sink: append-only CSV audit trail of every forwarded request.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::SecondsFormat;
use serde::Serialize;

use crate::selector::RoutingMode;

/// One row of `proxy_log.csv`.
#[derive(Debug, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub backend_url: String,
    pub latency_ms: i64,
    pub status_code: Option<u16>,
    pub routing_mode: String,
}

impl LogRecord {
    pub fn now(backend_url: String, latency_ms: i64, status_code: Option<u16>, mode: RoutingMode) -> Self {
        Self {
            timestamp: chrono::Local::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            backend_url,
            latency_ms,
            status_code,
            routing_mode: mode.to_string(),
        }
    }
}

/// Append-only CSV sink, serializing concurrent writers behind a mutex so
/// individual rows never interleave.
pub struct RequestLogSink {
    path: PathBuf,
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl RequestLogSink {
    /// Open (creating if needed) the log file at `path`, writing the header
    /// row iff the file does not exist or is currently empty.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let needs_header = !path.exists() || path.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if needs_header {
            writer.write_record(["timestamp", "backend_url", "latency_ms", "status_code", "routing_mode"])?;
            writer.flush()?;
        }

        Ok(Self { path, writer: Mutex::new(writer) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, flushing immediately so the dashboard (out of
    /// scope for this crate) sees it without delay. Failures are reported
    /// to the caller to log, not propagated as a request failure.
    pub fn append(&self, record: &LogRecord) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("log sink lock poisoned");
        writer.serialize(record)?;
        writer.flush()
    }
}
