//! Records of individual storage calls and queries over a finished run.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// The kind of storage call an [`Operation`] describes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// An object upload.
    Put,
    /// An object download.
    Get,
}

impl OpKind {
    /// Returns the HTTP method name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Put => "PUT",
            OpKind::Get => "GET",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed or failed storage call and its timing.
///
/// A worker creates the record right before issuing the call, fills in the timestamps as the
/// call progresses and sends it to the [`Collector`](crate::Collector) exactly once.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    /// The kind of call.
    pub kind: OpKind,
    /// Index of the worker that executed the call.
    pub thread: u16,
    /// Payload size in bytes.
    ///
    /// For successful calls this is the number of bytes actually transferred.
    pub size: u64,
    /// Name of the object.
    pub file: String,
    /// Number of objects touched by the call.
    pub obj_per_op: u32,
    /// Identifier of the endpoint the call was sent to.
    pub endpoint: String,
    /// When the call was issued.
    pub start: DateTime<Utc>,
    /// When the call completed.
    pub end: DateTime<Utc>,
    /// When the first byte of a download arrived.
    pub first_byte: Option<DateTime<Utc>>,
    /// Error text if the call failed.
    pub err: Option<String>,
}

impl Operation {
    /// Creates a pending record for a call on a single object.
    pub fn new(
        kind: OpKind,
        thread: u16,
        file: impl Into<String>,
        size: u64,
        endpoint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            kind,
            thread,
            size,
            file: file.into(),
            obj_per_op: 1,
            endpoint: endpoint.into(),
            start: now,
            end: now,
            first_byte: None,
            err: None,
        }
    }

    /// Stamps the start of the call.
    pub fn begin(&mut self) {
        self.start = Utc::now();
        self.end = self.start;
    }

    /// Stamps the end of the call.
    pub fn finish(&mut self) {
        self.end = Utc::now().max(self.start);
    }

    /// Marks the call as failed, keeping the first error if there already is one.
    pub fn fail(&mut self, err: impl fmt::Display) {
        if self.err.is_none() {
            self.err = Some(err.to_string());
        }
    }

    /// Returns `true` if the call succeeded.
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    /// Wall-clock duration of the call.
    pub fn duration(&self) -> Duration {
        to_std(self.end - self.start)
    }

    /// Time from issuing the call until the first byte arrived.
    pub fn time_to_first_byte(&self) -> Option<Duration> {
        self.first_byte.map(|t| to_std(t - self.start))
    }
}

fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or_default()
}

/// Number of calls and bytes observed within a time window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Throughput {
    /// Successful calls completed within the window.
    pub ops: u64,
    /// Bytes transferred by those calls.
    pub bytes: u64,
    /// Length of the window.
    pub span: Duration,
}

impl Throughput {
    /// Bytes per second over the window.
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.span.as_secs_f64();
        if secs > 0.0 { self.bytes as f64 / secs } else { 0.0 }
    }

    /// Calls per second over the window.
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.span.as_secs_f64();
        if secs > 0.0 { self.ops as f64 / secs } else { 0.0 }
    }
}

/// Operations of a run in the order they arrived at the collector.
///
/// Arrival order is not start order, since workers run concurrently. Records of a single worker
/// are causally ordered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Operations(Vec<Operation>);

impl Operations {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, op: Operation) {
        self.0.push(op);
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no operation was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all records in arrival order.
    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.0.iter()
    }

    /// Iterates over the records of one kind.
    pub fn by_kind(&self, kind: OpKind) -> impl Iterator<Item = &Operation> {
        self.0.iter().filter(move |op| op.kind == kind)
    }

    /// Iterates over failed records.
    pub fn errors(&self) -> impl Iterator<Item = &Operation> {
        self.0.iter().filter(|op| !op.is_ok())
    }

    /// Distinct kinds present in the sequence.
    pub fn kinds(&self) -> BTreeSet<OpKind> {
        self.0.iter().map(|op| op.kind).collect()
    }

    /// Distinct object names touched by any record.
    pub fn objects(&self) -> BTreeSet<&str> {
        self.0.iter().map(|op| op.file.as_str()).collect()
    }

    /// The span from the earliest start to the latest end of successful records of `kind`.
    pub fn active_range(&self, kind: OpKind) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.by_kind(kind)
            .filter(|op| op.is_ok())
            .fold(None, |range, op| match range {
                None => Some((op.start, op.end)),
                Some((start, end)) => Some((start.min(op.start), end.max(op.end))),
            })
    }

    /// Successful records of `kind` whose end falls into `[from, to)`.
    pub fn throughput(&self, kind: OpKind, from: DateTime<Utc>, to: DateTime<Utc>) -> Throughput {
        let mut throughput = Throughput {
            span: to_std(to - from),
            ..Default::default()
        };
        for op in self.by_kind(kind) {
            if op.is_ok() && op.end >= from && op.end < to {
                throughput.ops += 1;
                throughput.bytes += op.size;
            }
        }
        throughput
    }

    /// Splits `[from, to)` into `count` windows of equal length and measures each.
    ///
    /// This is equivalent to calling [`throughput`](Self::throughput) per window, but visits
    /// every record only once.
    pub fn segment(
        &self,
        kind: OpKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        count: usize,
    ) -> Vec<Throughput> {
        let total = (to - from).num_nanoseconds().unwrap_or(i64::MAX);
        if count == 0 || total <= 0 {
            return Vec::new();
        }

        let width = total / count as i64;
        if width == 0 {
            return Vec::new();
        }

        let span = Duration::from_nanos(width as u64);
        let mut segments = vec![
            Throughput {
                span,
                ..Default::default()
            };
            count
        ];

        for op in self.by_kind(kind).filter(|op| op.is_ok()) {
            let Some(offset) = (op.end - from).num_nanoseconds() else {
                continue;
            };
            if offset < 0 {
                continue;
            }
            let index = (offset / width) as usize;
            if let Some(segment) = segments.get_mut(index) {
                segment.ops += 1;
                segment.bytes += op.size;
            }
        }

        segments
    }
}

impl From<Vec<Operation>> for Operations {
    fn from(ops: Vec<Operation>) -> Self {
        Self(ops)
    }
}

impl FromIterator<Operation> for Operations {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Operations {
    type Item = Operation;
    type IntoIter = std::vec::IntoIter<Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Operations {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
