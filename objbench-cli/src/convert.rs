//! Turns an `xstore` access log into the TSV format of recorded operations.
//!
//! The log carries no worker or client information, so both are made up: every line is assigned
//! to a random worker, and the whole conversion shares one random client id.

use std::io::Write;

use objbench_engine::Operation;
use objbench_engine::export::{TSV_HEADER, write_row};
use objbench_engine::replay::{ReplayMode, ReplayReader, ReplayStats};
use rand::Rng;
use rand::distr::{Alphanumeric, SampleString};
use tokio::io::AsyncBufRead;

/// Settings of a conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Endpoint written into every row.
    pub endpoint: String,
    /// Rows are spread over this many synthetic workers.
    pub threads: u16,
    /// Client id written into every row.
    pub client_id: String,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            endpoint: "replay".to_owned(),
            threads: 200,
            client_id: Alphanumeric.sample_string(&mut rand::rng(), 6),
        }
    }
}

/// Writes all admitted entries of `reader` to `writer`, preceded by the header.
pub async fn convert<R, W>(
    mut reader: ReplayReader<R>,
    options: &ConvertOptions,
    mut writer: W,
) -> anyhow::Result<ReplayStats>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut rng = rand::rng();
    let threads = options.threads.max(1);

    writeln!(writer, "{TSV_HEADER}")?;
    let mut idx = 0;
    while let Some(entry) = reader.next_entry().await? {
        let thread = rng.random_range(0..threads);
        let mut op = Operation::new(entry.kind, thread, entry.name, entry.size, &options.endpoint);
        op.start = entry.start;
        op.end = entry.end;

        write_row(&mut writer, idx, &op, &options.client_id)?;
        idx += 1;
    }
    writer.flush()?;

    Ok(reader.stats())
}

/// Converts the `xstore` log at `path`, writing to stdout.
pub async fn convert_file(path: &std::path::Path, options: &ConvertOptions) -> anyhow::Result<()> {
    let reader = ReplayReader::open(path, ReplayMode::Xstore).await?;
    let stdout = std::io::stdout().lock();
    let stats = convert(reader, options, std::io::BufWriter::new(stdout)).await?;

    tracing::info!(
        lines = stats.lines,
        converted = stats.admitted,
        rejected = stats.rejected,
        malformed = stats.malformed,
        "converted access log"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use objbench_test::fixtures;

    use super::*;

    #[tokio::test]
    async fn converts_successful_lines() {
        let log = fixtures::log_file([
            fixtures::xstore_line("f.txt", 270, "2021-06-09T18:15:59", 3029),
            r#"{"code":404,"key":"g.txt","object_size":1,"datetime":"2021-06-09T18:15:59","cost":"1"}"#
                .to_owned(),
            "garbage".to_owned(),
        ]);

        let options = ConvertOptions {
            endpoint: "http://test-ozone".to_owned(),
            threads: 4,
            client_id: "FZz0y2".to_owned(),
        };
        let reader = ReplayReader::open(log.path(), ReplayMode::Xstore)
            .await
            .unwrap();

        let mut output = Vec::new();
        let stats = convert(reader, &options, &mut output).await.unwrap();
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.malformed, 1);

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], TSV_HEADER);

        let columns: Vec<_> = lines[1].split('\t').collect();
        assert_eq!(columns[0], "0");
        assert!(columns[1].parse::<u16>().unwrap() < 4);
        assert_eq!(columns[3], "FZz0y2");
        assert_eq!(columns[5], "270");
        assert_eq!(columns[6], "http://test-ozone");
        assert_eq!(columns[7], "f.txt");
        assert_eq!(columns[12], "3029000000");
    }

    #[tokio::test]
    async fn keeps_the_logged_method() {
        let log = fixtures::log_file([
            r#"{"code":200,"key":"g.txt","object_size":5,"datetime":"2021-06-09T18:15:59","cost":"7","method":"GET"}"#,
            r#"{"code":200,"key":"p.txt","object_size":5,"datetime":"2021-06-09T18:16:00","cost":"7"}"#,
        ]);

        let reader = ReplayReader::open(log.path(), ReplayMode::Xstore)
            .await
            .unwrap();
        let mut output = Vec::new();
        convert(reader, &ConvertOptions::default(), &mut output)
            .await
            .unwrap();

        let output = String::from_utf8(output).unwrap();
        let kinds: Vec<_> = output
            .lines()
            .skip(1)
            .map(|line| line.split('\t').nth(2).unwrap())
            .collect();
        assert_eq!(kinds, ["GET", "PUT"]);
    }
}
