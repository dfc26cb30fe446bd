//! Benchmark workloads and the driver running them.
//!
//! Every workload goes through three phases, driven by [`run`]:
//!
//! 1. **Prepare** creates the bucket and whatever objects the workload needs.
//! 2. **Start** runs `concurrency` workers until cancelled. All workers are held at a
//!    [`StartSignal`] so that their timed loops begin at the same instant.
//! 3. **Cleanup** removes the objects the run created.
//!
//! Workers check for cancellation between calls only. A call that has been issued always runs
//! to completion and is recorded.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod gate;
mod get;
mod put;

pub use gate::{StartGate, StartSignal};
pub use get::{Get, REPLAY_ENDPOINT, ReplaySource, random_range};
pub use put::Put;

use crate::access_log::{AccessLog, AccessLogEntry};
use crate::autoterm::AutoTermination;
use crate::client::{ClientError, ClientPool, PutOptions};
use crate::collector::Collector;
use crate::error::{Error, Result};
use crate::operation::{OpKind, Operation, Operations};
use crate::readers::HashingReader;
use crate::source::{Object, SourceFactory, SourceObject};

/// Settings shared by all workload kinds.
#[derive(Clone)]
pub struct Common {
    /// Bucket all objects are placed in.
    pub bucket: String,
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Clients the workers send their calls through.
    pub clients: ClientPool,
    /// Creates the object source of each uploading worker.
    pub source: SourceFactory,
    /// Options applied to every upload.
    pub put_options: PutOptions,
    /// Delete all objects in the bucket while preparing.
    pub clear_bucket: bool,
    /// Stop early once throughput has stabilized.
    pub auto_termination: Option<AutoTermination>,
    /// Receives one entry per call issued against the storage.
    pub access_log: Option<Arc<AccessLog>>,
}

impl Common {
    /// Creates settings for a single worker without auto-termination or access log.
    pub fn new(bucket: impl Into<String>, clients: ClientPool, source: SourceFactory) -> Self {
        Self {
            bucket: bucket.into(),
            concurrency: 1,
            clients,
            source,
            put_options: PutOptions::default(),
            clear_bucket: false,
            auto_termination: None,
            access_log: None,
        }
    }

    /// Fails unless the worker count is usable.
    pub fn check_concurrency(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.concurrency > usize::from(u16::MAX) {
            return Err(Error::Config(format!(
                "concurrency must be at most {}, got {}",
                u16::MAX,
                self.concurrency
            )));
        }
        Ok(())
    }

    /// Derives the token that Start's workers observe.
    pub(crate) fn start_token(
        &self,
        collector: &Collector,
        token: &CancellationToken,
        kind: OpKind,
    ) -> Result<CancellationToken> {
        match &self.auto_termination {
            Some(params) => collector.auto_terminate(token, kind, params),
            None => Ok(token.clone()),
        }
    }

    fn log_access(&self, op: &Operation, etag: &str) {
        if let Some(log) = &self.access_log {
            log.write(&AccessLogEntry::from_operation(op, &self.bucket, etag));
        }
    }

    /// Creates the bucket and empties it if configured.
    pub(crate) async fn create_bucket(&self, clear: bool) -> Result<()> {
        let client = self.clients.acquire();
        client.ensure_bucket(&self.bucket).await?;

        if clear {
            let deleted = client.delete_prefix(&self.bucket, "").await?;
            tracing::info!(bucket = %self.bucket, deleted, "cleared bucket");
        }
        Ok(())
    }

    /// Deletes every object under the given prefixes.
    ///
    /// Failures are logged and do not stop the remaining deletions.
    pub(crate) async fn delete_prefixes(&self, prefixes: BTreeSet<String>) {
        for prefix in prefixes {
            // Keep `abc` from matching `abcd/...`.
            let prefix = if prefix.is_empty() {
                prefix
            } else {
                format!("{prefix}/")
            };

            let client = self.clients.acquire();
            match client.delete_prefix(&self.bucket, &prefix).await {
                Ok(deleted) => tracing::debug!(%prefix, deleted, "deleted objects"),
                Err(error) => {
                    tracing::warn!(error = &error as &dyn std::error::Error, %prefix, "cleanup failed")
                }
            }
        }
    }
}

impl fmt::Debug for Common {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Common")
            .field("bucket", &self.bucket)
            .field("concurrency", &self.concurrency)
            .field("clients", &self.clients)
            .field("put_options", &self.put_options)
            .field("clear_bucket", &self.clear_bucket)
            .field("auto_termination", &self.auto_termination)
            .field("access_log", &self.access_log.is_some())
            .finish_non_exhaustive()
    }
}

/// Deadline for uploading an object of `size` bytes: one second per KiB, plus one.
pub fn upload_timeout(size: u64) -> Duration {
    Duration::from_secs(size / 1024 + 1)
}

/// Outcome of a single timed upload.
#[derive(Debug)]
pub(crate) struct Upload {
    pub op: Operation,
    pub object: Object,
    /// Sent and acknowledged byte counts if the storage accepted fewer bytes than were sent.
    pub short: Option<(u64, u64)>,
}

/// Uploads one synthetic object, records its timing and writes the access log.
pub(crate) async fn upload(common: &Common, thread: u16, source: SourceObject) -> Upload {
    let SourceObject { mut object, body } = source;
    let (body, checksum) = HashingReader::new(body);

    let options = PutOptions {
        content_type: common
            .put_options
            .content_type
            .clone()
            .or_else(|| Some(object.content_type.clone())),
    };
    let timeout = upload_timeout(object.size);

    let client = common.clients.acquire();
    let mut op = Operation::new(
        OpKind::Put,
        thread,
        &object.name,
        object.size,
        client.endpoint(),
    );

    op.begin();
    let result = tokio::time::timeout(
        timeout,
        client.put_object(
            &common.bucket,
            &object.name,
            Box::pin(body),
            object.size,
            &options,
        ),
    )
    .await;
    op.finish();
    drop(client);

    let mut etag = String::new();
    let mut short = None;
    match result {
        Err(_) => op.fail(ClientError::Timeout(timeout)),
        Ok(Err(error)) => op.fail(error),
        Ok(Ok(response)) if response.size != object.size => {
            op.fail(format!(
                "short upload. want: {}, got: {}",
                object.size, response.size
            ));
            short = Some((object.size, response.size));
        }
        Ok(Ok(response)) => {
            etag = response.etag;
            object.version_id = response.version_id;
            object.md5 = Some(checksum.hex());
        }
    }

    if let Some(err) = &op.err {
        tracing::warn!(thread, object = %object.name, error = %err, "upload failed");
    }
    common.log_access(&op, &etag);

    Upload { op, object, short }
}

/// Waits for all workers, cancelling `stop` once the first of them fails.
pub(crate) async fn join_workers(
    mut workers: JoinSet<Result<()>>,
    stop: &CancellationToken,
) -> Result<()> {
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        let result = joined.map_err(Error::from).and_then(|r| r);
        if let Err(error) = result {
            stop.cancel();
            first_error.get_or_insert(error);
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// The phases of a workload.
#[async_trait::async_trait]
pub trait Benchmark: Send {
    /// Creates the bucket and the objects Start operates on.
    async fn prepare(&mut self, token: &CancellationToken) -> Result<()>;

    /// Runs the workers until `token` is cancelled and returns all recorded operations.
    ///
    /// Workers begin their timed loop once `start` is released.
    async fn start(&mut self, token: &CancellationToken, start: StartSignal) -> Result<Operations>;

    /// Removes the objects created by Prepare and Start.
    async fn cleanup(&mut self);

    /// Settings shared by all workload kinds.
    fn common(&self) -> &Common;
}

/// Timing of a benchmark run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// How long Start runs, unless stopped earlier.
    pub duration: Duration,
    /// Pause between the end of Prepare and the release of the workers.
    pub start_delay: Duration,
    /// Skip Cleanup.
    pub keep_data: bool,
}

/// Runs all phases of `bench`.
///
/// Cancelling `token` ends Prepare and Start early; Cleanup still runs.
pub async fn run(
    bench: &mut dyn Benchmark,
    options: &RunOptions,
    token: &CancellationToken,
) -> Result<Operations> {
    tracing::info!(common = ?bench.common(), "preparing benchmark");
    if let Err(error) = bench.prepare(token).await {
        if !options.keep_data {
            bench.cleanup().await;
        }
        return Err(error);
    }

    let (gate, signal) = StartGate::new();
    let running = token.child_token();
    let timer = tokio::spawn({
        let running = running.clone();
        let options = *options;
        async move {
            tokio::select! {
                _ = running.cancelled() => return,
                _ = tokio::time::sleep(options.start_delay) => {}
            }

            tracing::info!(duration = ?options.duration, "starting benchmark");
            gate.release();

            tokio::select! {
                _ = running.cancelled() => {}
                _ = tokio::time::sleep(options.duration) => running.cancel(),
            }
        }
    });

    let result = bench.start(&running, signal).await;
    running.cancel();
    if let Err(error) = timer.await {
        tracing::error!(%error, "benchmark timer failed");
    }

    match &result {
        Ok(ops) => tracing::info!(operations = ops.len(), "benchmark finished"),
        Err(error) => tracing::error!(error = error as &dyn std::error::Error, "benchmark failed"),
    }

    if options.keep_data {
        tracing::info!("keeping benchmark data");
    } else {
        tracing::info!("cleaning up");
        bench.cleanup().await;
    }

    result
}
