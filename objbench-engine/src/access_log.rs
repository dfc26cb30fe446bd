//! JSON-lines log of every call issued against the storage.
//!
//! Each line has the shape consumed by [`ReplayMode::Normal`](crate::ReplayMode::Normal), so
//! the log of one run can seed the next.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::operation::{OpKind, Operation};

/// Layout of the `start` field.
pub const START_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Outcome of a logged call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The call succeeded.
    Succ,
    /// The call failed.
    Err,
}

/// One line of the access log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// Outcome of the call.
    pub status: Status,
    /// Kind of the call.
    pub action: OpKind,
    /// Target bucket.
    pub bucket: String,
    /// Object name.
    pub object: String,
    /// Duration of the call in milliseconds.
    pub cost: f64,
    /// Entity tag of an upload or content digest of a download.
    pub etag: String,
    /// Bytes transferred.
    pub size: u64,
    /// Error text, empty on success.
    pub msg: String,
    /// Local start time of the call.
    pub start: String,
    /// Whether the call took longer than expected for its size.
    pub slow: bool,
    /// Endpoint the call was sent to.
    pub endpoint: String,
}

impl AccessLogEntry {
    /// Describes a finished operation.
    pub fn from_operation(op: &Operation, bucket: &str, etag: &str) -> Self {
        let elapsed = op.duration();
        Self {
            status: if op.is_ok() { Status::Succ } else { Status::Err },
            action: op.kind,
            bucket: bucket.to_owned(),
            object: op.file.clone(),
            cost: elapsed.as_secs_f64() * 1000.0,
            etag: etag.to_owned(),
            size: op.size,
            msg: op.err.clone().unwrap_or_default(),
            start: op
                .start
                .with_timezone(&Local)
                .format(START_FORMAT)
                .to_string(),
            slow: is_slow(elapsed, op.size),
            endpoint: op.endpoint.clone(),
        }
    }
}

/// A call is slow if it took longer than one second per MiB, and at least one second.
fn is_slow(elapsed: Duration, size: u64) -> bool {
    let budget = Duration::from_secs((size >> 20).max(1));
    elapsed > budget
}

/// Size of the write buffer in front of the log file.
const BUFFER_SIZE: usize = 64 * 1024;

/// Appends [`AccessLogEntry`] lines to a file.
///
/// Writes are synchronous and serialized by a mutex. They only touch the file once the buffer is
/// full, so workers block for at most one buffer flush.
#[derive(Debug)]
pub struct AccessLog {
    writer: Mutex<BufWriter<File>>,
}

impl AccessLog {
    /// Creates or truncates the log at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(BUFFER_SIZE, file)),
        })
    }

    /// Appends one entry.
    ///
    /// Failing to log never fails the call being logged, so errors are only reported.
    pub fn write(&self, entry: &AccessLogEntry) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let result = serde_json::to_writer(&mut *writer, entry)
            .map_err(io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));

        if let Err(error) = result {
            tracing::warn!(%error, object = %entry.object, "failed to write access log");
        }
    }

    /// Writes buffered entries to disk.
    pub fn flush(&self) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl Drop for AccessLog {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            tracing::warn!(%error, "failed to flush access log");
        }
    }
}
