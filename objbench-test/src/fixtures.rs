//! Temporary files holding log fixtures.

use std::io::Write;

use tempfile::NamedTempFile;

/// Writes `lines` to a temporary file, one per line.
///
/// The file is deleted when the returned handle is dropped.
pub fn log_file<I, S>(lines: I) -> NamedTempFile
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{}", line.as_ref()).unwrap();
    }
    file.flush().unwrap();
    file
}

/// A successful access log line in the format written by the engine.
pub fn access_log_line(object: &str, size: u64) -> String {
    format!(
        r#"{{"status":"succ","action":"put","bucket":"bench","object":"{object}","cost":1.5,"etag":"","size":{size},"msg":"","start":"2024-01-01T00:00:00","slow":false,"endpoint":"mem://local"}}"#
    )
}

/// A successful xstore gateway log line.
pub fn xstore_line(key: &str, size: u64, datetime: &str, cost_ms: u64) -> String {
    format!(
        r#"{{"code":200,"key":"{key}","object_size":{size},"datetime":"{datetime}","cost":"{cost_ms}"}}"#
    )
}
