//! Configuration for objbench.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `OBJBENCH__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `OBJBENCH__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `OBJBENCH__S3__ENDPOINTS=[http://localhost:9000]` sets the storage endpoints
//! - `OBJBENCH__BENCHMARK__KIND=get` selects the download workload
//! - `OBJBENCH__BENCHMARK__CONCURRENCY=64` sets the number of workers
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! s3:
//!   endpoints: [http://localhost:9000]
//!
//! benchmark:
//!   kind: get
//!   concurrency: 64
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use objbench_engine::ReplayMode;
use secrecy::{CloneableSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "OBJBENCH__";

/// Newtype around `String` that keeps credentials out of logs. Use with [`SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Connection to the storage service.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct S3 {
    /// Endpoints to spread calls over.
    ///
    /// Each endpoint gets its own client; workers pick the least busy one per call.
    ///
    /// # Default
    ///
    /// `["http://localhost:9000"]`
    pub endpoints: Vec<String>,

    /// Signing region.
    pub region: String,

    /// Bucket the benchmark operates on. It is created if missing.
    pub bucket: String,

    /// Address buckets in the path instead of the host name, as most self-hosted services
    /// expect.
    pub path_style: bool,

    /// Access key ID.
    pub access_key: Option<SecretBox<ConfigSecret>>,

    /// Secret access key.
    pub secret_key: Option<SecretBox<ConfigSecret>>,
}

impl Default for S3 {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:9000".to_owned()],
            region: "us-east-1".to_owned(),
            bucket: "objbench".to_owned(),
            path_style: true,
            access_key: None,
            secret_key: None,
        }
    }
}

/// The workload to run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Upload synthetic objects.
    #[default]
    Put,
    /// Download prepared or replayed objects.
    Get,
}

/// Object sizes of synthetic uploads.
///
/// With only `p50` set, all objects have that size. Otherwise sizes follow a LogNormal
/// distribution through both percentiles.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Sizes {
    /// Median object size.
    pub p50: ByteSize,
    /// 99th percentile object size.
    pub p99: Option<ByteSize>,
}

impl Default for Sizes {
    fn default() -> Self {
        Self {
            p50: ByteSize::mib(10),
            p99: None,
        }
    }
}

/// Benchmark settings.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Benchmark {
    /// Workload to run.
    pub kind: Kind,

    /// Number of concurrent workers.
    pub concurrency: usize,

    /// How long the timed phase runs, unless auto-termination stops it earlier.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Pause between preparing and starting the workers.
    #[serde(with = "humantime_serde")]
    pub start_delay: Duration,

    /// Number of objects uploaded before a `get` benchmark.
    pub objects: usize,

    /// Sizes of uploaded objects.
    pub sizes: Sizes,

    /// Content type of uploaded objects.
    pub content_type: Option<String>,

    /// Download random byte ranges instead of whole objects.
    pub random_ranges: bool,

    /// Delete everything in the bucket before the benchmark.
    pub clear_bucket: bool,

    /// Keep created objects after the benchmark.
    pub keep_data: bool,
}

impl Default for Benchmark {
    fn default() -> Self {
        Self {
            kind: Kind::Put,
            concurrency: 20,
            duration: Duration::from_secs(5 * 60),
            start_delay: Duration::ZERO,
            objects: 2500,
            sizes: Sizes::default(),
            content_type: None,
            random_ranges: false,
            clear_bucket: false,
            keep_data: false,
        }
    }
}

/// Seeds a `get` benchmark from an access log instead of uploading objects.
#[derive(Debug, Deserialize, Serialize)]
pub struct Replay {
    /// Path of the log.
    pub path: PathBuf,
    /// Format of the log.
    #[serde(default)]
    pub mode: ReplayMode,
}

/// Stops the benchmark once throughput has stabilized.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoTerm {
    /// Enables auto-termination.
    pub enabled: bool,
    /// Minimum run time before the benchmark may be stopped.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Allowed deviation in percent.
    pub pct: f64,
}

impl Default for AutoTerm {
    fn default() -> Self {
        Self {
            enabled: false,
            duration: Duration::from_secs(10),
            pct: 7.5,
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Auto => "auto",
            LogFormat::Pretty => "pretty",
            LogFormat::Simplified => "simplified",
            LogFormat::Json => "json",
        })
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr, leaving stdout for reports.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format, matched case-insensitively.
    #[serde(with = "display_fromstr")]
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Storage connection.
    pub s3: S3,

    /// Workload settings.
    pub benchmark: Benchmark,

    /// Seeds a `get` benchmark from a log.
    pub replay: Option<Replay>,

    /// Early termination.
    pub autoterm: AutoTerm,

    /// Writes one JSON line per storage call to this file.
    pub access_log: Option<PathBuf>,

    /// Writes all recorded operations as TSV to this file.
    pub results: Option<PathBuf>,

    /// Logging settings.
    pub logging: Logging,
}

impl Config {
    /// Loads configuration from defaults, an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults_are_usable() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert_eq!(config.benchmark.kind, Kind::Put);
            assert_eq!(config.benchmark.concurrency, 20);
            assert_eq!(config.s3.endpoints, ["http://localhost:9000"]);
            assert!(config.replay.is_none());
            assert!(!config.autoterm.enabled);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("OBJBENCH__S3__BUCKET", "warm");
            jail.set_env("OBJBENCH__S3__ACCESS_KEY", "minio");
            jail.set_env("OBJBENCH__S3__SECRET_KEY", "minio123");
            jail.set_env("OBJBENCH__BENCHMARK__KIND", "get");
            jail.set_env("OBJBENCH__BENCHMARK__CONCURRENCY", "64");
            jail.set_env("OBJBENCH__BENCHMARK__DURATION", "30s");
            jail.set_env("OBJBENCH__AUTOTERM__ENABLED", "true");

            let config = Config::load(None).unwrap();

            assert_eq!(config.s3.bucket, "warm");
            assert_eq!(
                config.s3.secret_key.unwrap().expose_secret().as_str(),
                "minio123"
            );
            assert_eq!(config.benchmark.kind, Kind::Get);
            assert_eq!(config.benchmark.concurrency, 64);
            assert_eq!(config.benchmark.duration, Duration::from_secs(30));
            assert!(config.autoterm.enabled);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            s3:
                endpoints: [http://a:9000, http://b:9000]
            benchmark:
                kind: get
                objects: 100
                sizes:
                    p50: 4KiB
                    p99: 1MiB
                random_ranges: true
            replay:
                path: /var/log/gateway.log
                mode: xstore
            autoterm:
                enabled: true
                duration: 15s
                pct: 5
            logging:
                level: debug
                format: json
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.s3.endpoints.len(), 2);
            assert_eq!(config.benchmark.objects, 100);
            assert_eq!(config.benchmark.sizes.p50, ByteSize::kib(4));
            assert_eq!(config.benchmark.sizes.p99, Some(ByteSize::mib(1)));
            assert!(config.benchmark.random_ranges);

            let replay = config.replay.unwrap();
            assert_eq!(replay.path, PathBuf::from("/var/log/gateway.log"));
            assert_eq!(replay.mode, ReplayMode::Xstore);

            assert_eq!(config.autoterm.duration, Duration::from_secs(15));
            assert_eq!(config.autoterm.pct, 5.0);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);

            Ok(())
        });
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            benchmark:
                concurrency: 8
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("OBJBENCH__BENCHMARK__CONCURRENCY", "16");

            let config = Config::load(Some(tempfile.path())).unwrap();

            // Env should overwrite the yaml config
            assert_eq!(config.benchmark.concurrency, 16);

            Ok(())
        });
    }

    #[test]
    fn log_format_ignores_case() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("OBJBENCH__LOGGING__FORMAT", "JSON");
            let config = Config::load(None).unwrap();
            assert_eq!(config.logging.format, LogFormat::Json);

            jail.set_env("OBJBENCH__LOGGING__FORMAT", "Simplified");
            let config = Config::load(None).unwrap();
            assert_eq!(config.logging.format, LogFormat::Simplified);

            jail.set_env("OBJBENCH__LOGGING__FORMAT", "xml");
            let error = Config::load(None).unwrap_err();
            assert!(error.to_string().contains("xml"), "{error}");

            Ok(())
        });
    }

    #[test]
    fn log_format_round_trips_through_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();
            assert_eq!(config.logging.format, LogFormat::Auto);
            assert_eq!(LogFormat::Simplified.to_string(), "simplified");
            Ok(())
        });
    }

    #[test]
    fn secrets_are_redacted() {
        let s3 = S3 {
            access_key: Some(SecretBox::new(Box::new("minio".into()))),
            secret_key: Some(SecretBox::new(Box::new("minio123".into()))),
            ..Default::default()
        };

        let debug = format!("{s3:?}");
        assert!(!debug.contains("minio123"));
    }
}
