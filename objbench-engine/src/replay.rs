//! Reading historical access logs to seed a benchmark.
//!
//! Two line formats are understood, both newline-delimited JSON:
//!
//! - [`ReplayMode::Normal`] reads logs in the shape of [`AccessLogEntry`], as written by this
//!   tool. Only entries with `"status": "succ"` are admitted. These logs carry no usable
//!   timestamps, so replayed records start and end at the time of reading.
//! - [`ReplayMode::Xstore`] reads gateway logs with a numeric `code`, where only `200` is
//!   admitted. The `datetime` field marks the end of the call in the host's local time zone and
//!   `cost` holds its duration in milliseconds as a string.
//!
//! Lines that do not match the selected shape are skipped and counted in [`ReplayStats`].
//!
//! [`AccessLogEntry`]: crate::access_log::AccessLogEntry

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::access_log::Status;
use crate::operation::OpKind;

/// Layout of `datetime` in xstore logs.
pub const XSTORE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// The log format to replay.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Access logs written by this tool.
    #[default]
    Normal,
    /// Gateway logs with HTTP status codes and local timestamps.
    Xstore,
}

impl FromStr for ReplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "xstore" => Ok(Self::Xstore),
            other => Err(format!("unknown replay mode `{other}`")),
        }
    }
}

impl fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Xstore => f.write_str("xstore"),
        }
    }
}

/// A line of a [`ReplayMode::Normal`] log.
#[derive(Debug, Deserialize)]
struct NormalEntry {
    status: Status,
    object: String,
    size: u64,
    #[serde(default)]
    action: Option<OpKind>,
}

/// A line of a [`ReplayMode::Xstore`] log.
#[derive(Debug, Deserialize)]
struct XstoreEntry {
    code: i64,
    key: String,
    object_size: u64,
    datetime: String,
    cost: String,
    #[serde(default)]
    method: Option<String>,
}

/// An admitted historical call, reduced to what a benchmark needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayEntry {
    /// Name of the object.
    pub name: String,
    /// Size of the object in bytes.
    pub size: u64,
    /// The kind of the historical call.
    ///
    /// Exports of a log keep it. A benchmark seeded from the log records every entry as a
    /// [`OpKind::Put`] instead, since the entry only places an object into the download set.
    pub kind: OpKind,
    /// When the call started.
    pub start: DateTime<Utc>,
    /// When the call completed.
    pub end: DateTime<Utc>,
}

/// Classification of a single log line.
#[derive(Debug, PartialEq)]
pub enum LineOutcome {
    /// A successful call that seeds the benchmark.
    Admitted(ReplayEntry),
    /// A well-formed line describing a failed call.
    Rejected,
    /// A line that does not match the log format.
    Malformed,
}

/// Classifies one line of a log in the given format.
///
/// `now` is used as the timestamp of entries that carry none.
pub fn parse_line(mode: ReplayMode, line: &str, now: DateTime<Utc>) -> LineOutcome {
    match mode {
        ReplayMode::Normal => parse_normal(line, now),
        ReplayMode::Xstore => parse_xstore(line),
    }
}

fn parse_normal(line: &str, now: DateTime<Utc>) -> LineOutcome {
    let Ok(entry) = serde_json::from_str::<NormalEntry>(line) else {
        return LineOutcome::Malformed;
    };
    if entry.status != Status::Succ {
        return LineOutcome::Rejected;
    }

    LineOutcome::Admitted(ReplayEntry {
        name: entry.object,
        size: entry.size,
        kind: entry.action.unwrap_or(OpKind::Put),
        start: now,
        end: now,
    })
}

fn parse_xstore(line: &str) -> LineOutcome {
    let Ok(entry) = serde_json::from_str::<XstoreEntry>(line) else {
        return LineOutcome::Malformed;
    };
    if entry.code != 200 {
        return LineOutcome::Rejected;
    }

    let Some(end) = parse_local_datetime(&entry.datetime) else {
        return LineOutcome::Malformed;
    };
    let Ok(cost) = entry.cost.trim().parse::<u32>() else {
        return LineOutcome::Malformed;
    };

    let kind = match entry.method.as_deref() {
        Some(method) if method.eq_ignore_ascii_case("get") => OpKind::Get,
        _ => OpKind::Put,
    };

    LineOutcome::Admitted(ReplayEntry {
        name: entry.key,
        size: entry.object_size,
        kind,
        start: end - TimeDelta::milliseconds(cost.into()),
        end,
    })
}

/// Interprets a timestamp without zone information in the host's local time zone.
///
/// Ambiguous times during a DST fold resolve to the earlier instant. Times that do not exist
/// locally yield `None`.
pub fn parse_local_datetime(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), XSTORE_DATETIME_FORMAT).ok()?;
    let local = naive.and_local_timezone(Local).earliest()?;
    Some(local.with_timezone(&Utc))
}

/// Line counts of a replayed log.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    /// Non-empty lines read.
    pub lines: u64,
    /// Lines that seeded the benchmark.
    pub admitted: u64,
    /// Well-formed lines describing failed calls.
    pub rejected: u64,
    /// Lines that did not match the format.
    pub malformed: u64,
}

/// Streams admitted entries from a log.
#[derive(Debug)]
pub struct ReplayReader<R> {
    mode: ReplayMode,
    reader: R,
    buf: Vec<u8>,
    stats: ReplayStats,
}

impl ReplayReader<BufReader<File>> {
    /// Opens the log at `path`.
    pub async fn open(path: impl AsRef<Path>, mode: ReplayMode) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::new(BufReader::new(file), mode))
    }
}

impl<R: AsyncBufRead + Unpin> ReplayReader<R> {
    /// Reads a log from `reader`.
    pub fn new(reader: R, mode: ReplayMode) -> Self {
        Self {
            mode,
            reader,
            buf: Vec::new(),
            stats: ReplayStats::default(),
        }
    }

    /// Returns the next admitted entry, or `None` at the end of the log.
    ///
    /// Only I/O errors are returned. Rejected and malformed lines, including lines that are not
    /// valid UTF-8, are skipped.
    pub async fn next_entry(&mut self) -> io::Result<Option<ReplayEntry>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }

            let Ok(line) = std::str::from_utf8(&self.buf) else {
                self.stats.lines += 1;
                self.stats.malformed += 1;
                tracing::trace!("skipping replay line that is not UTF-8");
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            self.stats.lines += 1;
            match parse_line(self.mode, line, Utc::now()) {
                LineOutcome::Admitted(entry) => {
                    self.stats.admitted += 1;
                    return Ok(Some(entry));
                }
                LineOutcome::Rejected => self.stats.rejected += 1,
                LineOutcome::Malformed => {
                    self.stats.malformed += 1;
                    tracing::trace!(line, "skipping malformed replay line");
                }
            }
        }
    }

    /// Counts of all lines read so far.
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_success_is_admitted() {
        let now = Utc::now();
        let line = r#"{"status":"succ","object":"a.csv","size":1000,"bucket":"b"}"#;

        let LineOutcome::Admitted(entry) = parse_line(ReplayMode::Normal, line, now) else {
            panic!("line was not admitted");
        };
        assert_eq!(entry.name, "a.csv");
        assert_eq!(entry.size, 1000);
        assert_eq!(entry.kind, OpKind::Put);
        assert_eq!(entry.start, now);
        assert_eq!(entry.end, now);
    }

    #[test]
    fn normal_failure_is_rejected() {
        let line = r#"{"status":"err","object":"a.csv","size":1000,"bucket":"b"}"#;
        assert_eq!(
            parse_line(ReplayMode::Normal, line, Utc::now()),
            LineOutcome::Rejected
        );
    }

    #[test]
    fn normal_wrong_types_are_malformed() {
        for line in [
            r#"{"status":1,"object":"a.csv","size":1000}"#,
            r#"{"status":"succ","object":"a.csv","size":"1000"}"#,
            r#"{"status":"succ","size":1000}"#,
            r#"{"status":"succ","object":"a.csv""#,
            "not json",
        ] {
            assert_eq!(
                parse_line(ReplayMode::Normal, line, Utc::now()),
                LineOutcome::Malformed,
                "{line}"
            );
        }
    }

    #[test]
    fn xstore_start_is_end_minus_cost() {
        let line = r#"{"code":200,"key":"f.txt","object_size":270,"datetime":"2021-06-09T18:15:59","cost":"3029"}"#;

        let LineOutcome::Admitted(entry) = parse_line(ReplayMode::Xstore, line, Utc::now()) else {
            panic!("line was not admitted");
        };
        let end = parse_local_datetime("2021-06-09T18:15:59").unwrap();
        assert_eq!(entry.name, "f.txt");
        assert_eq!(entry.size, 270);
        assert_eq!(entry.end, end);
        assert_eq!(entry.start, end - TimeDelta::milliseconds(3029));
    }

    #[test]
    fn xstore_datetime_is_local_time() {
        let parsed = parse_local_datetime("2021-06-09T18:15:59").unwrap();
        let local = parsed.with_timezone(&Local).naive_local();
        assert_eq!(local.to_string(), "2021-06-09 18:15:59");
    }

    #[test]
    fn xstore_classification() {
        let now = Utc::now();
        let rejected = r#"{"code":404,"key":"f.txt","object_size":270,"datetime":"2021-06-09T18:15:59","cost":"1"}"#;
        assert_eq!(
            parse_line(ReplayMode::Xstore, rejected, now),
            LineOutcome::Rejected
        );

        for line in [
            r#"{"code":"200","key":"f.txt","object_size":270,"datetime":"2021-06-09T18:15:59","cost":"1"}"#,
            r#"{"code":200,"key":"f.txt","object_size":270,"datetime":"09/06/2021","cost":"1"}"#,
            r#"{"code":200,"key":"f.txt","object_size":270,"datetime":"2021-06-09T18:15:59","cost":"fast"}"#,
            r#"{"code":200,"key":"f.txt","object_size":270,"datetime":"2021-06-09T18:15:59","cost":12}"#,
        ] {
            assert_eq!(
                parse_line(ReplayMode::Xstore, line, now),
                LineOutcome::Malformed,
                "{line}"
            );
        }
    }

    #[tokio::test]
    async fn reader_skips_noise() {
        let log = concat!(
            r#"{"status":"succ","object":"a.csv","size":1000,"bucket":"b"}"#,
            "\n",
            "garbage\n",
            "\n",
            r#"{"status":"err","object":"b.csv","size":1,"bucket":"b"}"#,
            "\n",
            r#"{"status":1}"#,
            "\n",
            r#"{"status":"succ","object":"c.csv","size":3,"action":"get"}"#,
            "\n",
        );

        let mut reader = ReplayReader::new(log.as_bytes(), ReplayMode::Normal);
        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await.unwrap() {
            names.push(entry.name);
        }

        assert_eq!(names, ["a.csv", "c.csv"]);
        assert_eq!(
            reader.stats(),
            ReplayStats {
                lines: 5,
                admitted: 2,
                rejected: 1,
                malformed: 2,
            }
        );
    }

    #[tokio::test]
    async fn reader_skips_invalid_utf8() {
        let mut log = Vec::new();
        log.extend_from_slice(br#"{"status":"succ","object":"a.csv","size":1}"#);
        log.extend_from_slice(b"\n\xff\xfe garbage \xc3\x28\n");
        log.extend_from_slice(br#"{"status":"succ","object":"c.csv","size":3}"#);

        let mut reader = ReplayReader::new(log.as_slice(), ReplayMode::Normal);
        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await.unwrap() {
            names.push(entry.name);
        }

        assert_eq!(names, ["a.csv", "c.csv"]);
        assert_eq!(reader.stats().malformed, 1);
        assert_eq!(reader.stats().lines, 3);
    }

    #[test]
    fn mode_parses_from_str() {
        assert_eq!("xstore".parse::<ReplayMode>(), Ok(ReplayMode::Xstore));
        assert!("csv".parse::<ReplayMode>().is_err());
    }
}
