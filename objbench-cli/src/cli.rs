use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use objbench_engine::access_log::AccessLog;
use objbench_engine::bench::{self, Benchmark, Common, Get, Put, ReplaySource, RunOptions};
use objbench_engine::client::{BoxedClient, ClientPool, PutOptions};
use objbench_engine::source::{RandomSource, SizeDistribution};
use objbench_engine::{AutoTermination, Operations, export};
use rand::distr::{Alphanumeric, SampleString};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config, Kind};
use crate::convert::{self, ConvertOptions};
use crate::s3::S3Client;
use crate::{observability, report};

/// Load generator for S3-compatible object storage.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Convert(ConvertCommand),
    Version(VersionCommand),
}

/// run the configured benchmark and print a summary
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// convert an xstore access log into TSV operations on stdout
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "convert")]
struct ConvertCommand {
    /// path of the access log
    #[argh(positional)]
    input: PathBuf,

    /// endpoint written into every row
    #[argh(option, default = "String::from(\"replay\")")]
    endpoint: String,

    /// number of synthetic workers rows are spread over
    #[argh(option, default = "200")]
    threads: u16,
}

/// print the objbench version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand {}) => run(config).await,
            Command::Convert(ConvertCommand {
                input,
                endpoint,
                threads,
            }) => {
                let options = ConvertOptions {
                    endpoint,
                    threads,
                    ..Default::default()
                };
                convert::convert_file(&input, &options).await
            }
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

async fn run(config: Config) -> Result<()> {
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping benchmark");
            interrupt.cancel();
        }
    });

    let mut benchmark = benchmark(&config)?;
    let options = RunOptions {
        duration: config.benchmark.duration,
        start_delay: config.benchmark.start_delay,
        keep_data: config.benchmark.keep_data,
    };

    let ops = bench::run(benchmark.as_mut(), &options, &token).await?;
    if let Some(access_log) = &benchmark.common().access_log {
        access_log.flush().context("failed to flush access log")?;
    }

    report::print(&report::summarize(&ops));

    if let Some(path) = &config.results {
        write_results(&ops, path)?;
        tracing::info!(path = %path.display(), ops = ops.len(), "wrote results");
    }

    Ok(())
}

/// Creates the configured workload.
fn benchmark(config: &Config) -> Result<Box<dyn Benchmark>> {
    let clients = config
        .s3
        .endpoints
        .iter()
        .map(|endpoint| {
            let client = s3_client(&config.s3, endpoint)?;
            Ok(Arc::new(client) as BoxedClient)
        })
        .collect::<Result<Vec<_>>>()?;

    let source = RandomSource::factory(size_distribution(&config.benchmark.sizes))?;
    let mut common = Common::new(&config.s3.bucket, ClientPool::new(clients)?, source);
    common.concurrency = config.benchmark.concurrency;
    common.clear_bucket = config.benchmark.clear_bucket;
    common.put_options = PutOptions {
        content_type: config.benchmark.content_type.clone(),
    };
    common.auto_termination = auto_termination(&config.autoterm);

    if let Some(path) = &config.access_log {
        let access_log = AccessLog::create(path)
            .with_context(|| format!("failed to create access log `{}`", path.display()))?;
        common.access_log = Some(Arc::new(access_log));
    }

    Ok(match config.benchmark.kind {
        Kind::Put => {
            if config.replay.is_some() {
                tracing::warn!("replay is only used by get benchmarks, ignoring");
            }
            Box::new(Put::new(common))
        }
        Kind::Get => {
            let mut get = Get::new(common, config.benchmark.objects);
            get.random_ranges = config.benchmark.random_ranges;
            get.replay = config.replay.as_ref().map(|replay| ReplaySource {
                path: replay.path.clone(),
                mode: replay.mode,
            });
            Box::new(get)
        }
    })
}

fn s3_client(s3: &config::S3, endpoint: &str) -> Result<S3Client> {
    let access_key = s3.access_key.as_ref().map(|key| key.expose_secret().as_str());
    let secret_key = s3.secret_key.as_ref().map(|key| key.expose_secret().as_str());

    S3Client::new(endpoint, &s3.region, access_key, secret_key, s3.path_style)
        .with_context(|| format!("failed to create client for `{endpoint}`"))
}

fn size_distribution(sizes: &config::Sizes) -> SizeDistribution {
    match sizes.p99 {
        Some(p99) if p99 != sizes.p50 => SizeDistribution::LogNormal {
            p50: sizes.p50.as_u64(),
            p99: p99.as_u64(),
        },
        _ => SizeDistribution::Fixed(sizes.p50.as_u64()),
    }
}

fn auto_termination(config: &config::AutoTerm) -> Option<AutoTermination> {
    config
        .enabled
        .then(|| AutoTermination::new(config.duration, config.pct / 100.0))
}

fn write_results(ops: &Operations, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create results file `{}`", path.display()))?;
    let client_id = Alphanumeric.sample_string(&mut rand::rng(), 6);
    export::write_tsv(ops, &client_id, BufWriter::new(file))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytesize::ByteSize;
    use secrecy::SecretBox;

    use super::*;

    #[test]
    fn single_percentile_means_fixed_sizes() {
        let sizes = config::Sizes {
            p50: ByteSize::kib(4),
            p99: None,
        };
        assert_eq!(size_distribution(&sizes), SizeDistribution::Fixed(4096));

        let sizes = config::Sizes {
            p50: ByteSize::kib(4),
            p99: Some(ByteSize::kib(4)),
        };
        assert_eq!(size_distribution(&sizes), SizeDistribution::Fixed(4096));

        let sizes = config::Sizes {
            p50: ByteSize::kib(4),
            p99: Some(ByteSize::mib(1)),
        };
        assert_eq!(
            size_distribution(&sizes),
            SizeDistribution::LogNormal {
                p50: 4096,
                p99: 1024 * 1024
            }
        );
    }

    #[test]
    fn auto_termination_uses_percent() {
        let disabled = config::AutoTerm::default();
        assert!(auto_termination(&disabled).is_none());

        let enabled = config::AutoTerm {
            enabled: true,
            duration: Duration::from_secs(30),
            pct: 5.0,
        };
        let params = auto_termination(&enabled).unwrap();
        assert_eq!(params.min_duration, Duration::from_secs(30));
        assert!((params.scale - 0.05).abs() < 1e-12);
    }

    #[test]
    fn builds_one_client_per_endpoint() {
        let mut config = Config::default();
        config.s3.endpoints = vec!["http://a:9000".into(), "http://b:9000".into()];
        config.s3.access_key = Some(SecretBox::new(Box::new("minio".into())));
        config.s3.secret_key = Some(SecretBox::new(Box::new("minio123".into())));
        config.benchmark.kind = Kind::Get;
        config.benchmark.objects = 7;

        let benchmark = benchmark(&config).unwrap();
        assert_eq!(benchmark.common().bucket, "objbench");
        assert_eq!(benchmark.common().concurrency, 20);
        assert!(benchmark.common().auto_termination.is_none());
    }
}
