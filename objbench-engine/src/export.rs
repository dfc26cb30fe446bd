//! Tab-separated export of recorded operations.

use std::io::{self, Write};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::operation::Operation;

/// Column names of the export, in order.
pub const TSV_HEADER: &str =
    "idx\tthread\top\tclient_id\tn_objects\tbytes\tendpoint\tfile\terror\tstart\tfirst_byte\tend\tduration_ns";

/// Writes `ops` as TSV, including a header line.
pub fn write_tsv<'a, W, I>(ops: I, client_id: &str, mut writer: W) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a Operation>,
{
    writeln!(writer, "{TSV_HEADER}")?;
    for (idx, op) in ops.into_iter().enumerate() {
        write_row(&mut writer, idx, op, client_id)?;
    }
    writer.flush()
}

/// Writes a single row without header.
pub fn write_row<W: Write>(
    writer: &mut W,
    idx: usize,
    op: &Operation,
    client_id: &str,
) -> io::Result<()> {
    let duration_ns = (op.end - op.start).num_nanoseconds().unwrap_or(i64::MAX);
    writeln!(
        writer,
        "{idx}\t{}\t{}\t{client_id}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{duration_ns}",
        op.thread,
        op.kind,
        op.obj_per_op,
        op.size,
        clean(&op.endpoint),
        clean(&op.file),
        clean(op.err.as_deref().unwrap_or_default()),
        timestamp(op.start),
        op.first_byte.map(timestamp).unwrap_or_default(),
        timestamp(op.end),
    )
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Replaces characters that would break the column layout.
fn clean(field: &str) -> String {
    field.replace(['\t', '\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::operation::OpKind;

    #[test]
    fn rows_follow_the_header() {
        let mut ok = Operation::new(OpKind::Get, 3, "p/a.rnd", 100, "http://s3:9000");
        ok.start = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        ok.first_byte = Some(ok.start + TimeDelta::microseconds(250));
        ok.end = ok.start + TimeDelta::milliseconds(2);

        let mut failed = ok.clone();
        failed.first_byte = None;
        failed.fail("unexpected download size.\twant: 100, got: 7");

        let mut out = Vec::new();
        write_tsv(&[ok, failed], "c1", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TSV_HEADER);
        assert_eq!(
            lines[1],
            "0\t3\tGET\tc1\t1\t100\thttp://s3:9000\tp/a.rnd\t\t\
             2024-01-02T03:04:05.000000000Z\t2024-01-02T03:04:05.000250000Z\t\
             2024-01-02T03:04:05.002000000Z\t2000000"
        );

        let columns: Vec<_> = lines[2].split('\t').collect();
        assert_eq!(columns.len(), 13);
        assert_eq!(columns[8], "unexpected download size. want: 100, got: 7");
        assert_eq!(columns[10], "");
    }
}
