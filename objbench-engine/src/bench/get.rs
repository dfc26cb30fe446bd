use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Benchmark, Common, StartSignal, join_workers, upload};
use crate::client::{ByteRange, GetOptions};
use crate::collector::{Collector, Receiver};
use crate::error::{Error, Result};
use crate::operation::{OpKind, Operation, Operations};
use crate::readers::{FirstByteRecorder, drain_into};
use crate::replay::{ReplayMode, ReplayReader};
use crate::source::{Object, ObjectSet};

/// Endpoint recorded for operations read from a replay log.
pub const REPLAY_ENDPOINT: &str = "replay";

/// A historical access log used instead of uploading objects.
#[derive(Clone, Debug)]
pub struct ReplaySource {
    /// Path of the log.
    pub path: PathBuf,
    /// Format of the log.
    pub mode: ReplayMode,
}

/// Downloads objects picked at random from a prepared set.
///
/// The set is either uploaded during Prepare or read from a [`ReplaySource`]. Replayed objects
/// must already exist in the bucket and are never deleted.
#[derive(Debug)]
pub struct Get {
    common: Arc<Common>,
    /// Number of objects uploaded during Prepare.
    pub objects_to_create: usize,
    /// Download random byte ranges instead of whole objects.
    pub random_ranges: bool,
    /// Seed the object set from a log.
    pub replay: Option<ReplaySource>,
    objects: Arc<ObjectSet>,
    created: BTreeSet<String>,
    collector: Option<Collector>,
}

impl Get {
    /// Creates a download workload over `objects_to_create` uploaded objects.
    pub fn new(common: Common, objects_to_create: usize) -> Self {
        Self {
            common: Arc::new(common),
            objects_to_create,
            random_ranges: false,
            replay: None,
            objects: Default::default(),
            created: BTreeSet::new(),
            collector: None,
        }
    }

    /// The objects Start picks from.
    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    async fn prepare_replay(&mut self, replay: ReplaySource, receiver: Receiver) -> Result<()> {
        let mut reader = ReplayReader::open(&replay.path, replay.mode).await?;
        let mut objects = ObjectSet::default();

        while let Some(entry) = reader.next_entry().await? {
            // Nobody executed these calls, so spread them over workers for reporting. The
            // record stands for placing the object into the set, whatever the historical call
            // was, and keeps historical timestamps out of the download statistics.
            let thread = rand::random_range(0..self.common.concurrency) as u16;
            let mut op = Operation::new(OpKind::Put, thread, &entry.name, entry.size, REPLAY_ENDPOINT);
            op.start = entry.start;
            op.end = entry.end;
            receiver.send(op)?;

            objects.push(Object::new(entry.name, entry.size));
        }

        let stats = reader.stats();
        tracing::info!(
            path = %replay.path.display(),
            mode = %replay.mode,
            lines = stats.lines,
            admitted = stats.admitted,
            rejected = stats.rejected,
            malformed = stats.malformed,
            "replayed access log"
        );

        self.objects = Arc::new(objects);
        Ok(())
    }

    async fn prepare_uploads(&mut self, token: &CancellationToken, receiver: Receiver) -> Result<()> {
        let objects = Arc::new(Mutex::new(ObjectSet::default()));
        let prefixes = Arc::new(Mutex::new(BTreeSet::new()));
        let remaining = Arc::new(AtomicUsize::new(self.objects_to_create));
        let short_write = Arc::new(Mutex::new(None));
        let stop = token.child_token();

        let mut workers = JoinSet::new();
        for thread in 0..self.common.concurrency as u16 {
            let common = Arc::clone(&self.common);
            let objects = Arc::clone(&objects);
            let prefixes = Arc::clone(&prefixes);
            let remaining = Arc::clone(&remaining);
            let short_write = Arc::clone(&short_write);
            let receiver = receiver.clone();
            let stop = stop.clone();

            workers.spawn(async move {
                let mut source = (common.source)();

                while !stop.is_cancelled() {
                    let slot = remaining.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        n.checked_sub(1)
                    });
                    if slot.is_err() {
                        break;
                    }

                    prefixes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(source.prefix().to_owned());

                    let uploaded = upload(&common, thread, source.object()).await;
                    let ok = uploaded.op.is_ok();
                    receiver.send(uploaded.op)?;

                    if let Some((want, got)) = uploaded.short {
                        short_write
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(Error::ShortWrite {
                                object: uploaded.object.name,
                                want,
                                got,
                            });
                        stop.cancel();
                        break;
                    }

                    if ok {
                        objects
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(uploaded.object);
                    }
                }

                Ok::<_, Error>(())
            });
        }
        drop(receiver);

        let joined = join_workers(workers, &stop).await;
        self.created = std::mem::take(&mut *prefixes.lock().unwrap_or_else(PoisonError::into_inner));
        self.objects = Arc::new(std::mem::take(
            &mut *objects.lock().unwrap_or_else(PoisonError::into_inner),
        ));
        joined?;

        if let Some(error) = short_write.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(error);
        }

        tracing::info!(
            objects = self.objects.len(),
            requested = self.objects_to_create,
            "uploaded objects"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl Benchmark for Get {
    async fn prepare(&mut self, token: &CancellationToken) -> Result<()> {
        self.common.check_concurrency()?;

        let collector = Collector::new();
        let receiver = collector.receiver();
        self.collector = Some(collector);

        match self.replay.clone() {
            Some(replay) => {
                if self.common.clear_bucket {
                    tracing::warn!("not clearing the bucket since it holds the replayed objects");
                }
                self.common.create_bucket(false).await?;
                self.prepare_replay(replay, receiver).await
            }
            None => {
                self.common.create_bucket(self.common.clear_bucket).await?;
                self.prepare_uploads(token, receiver).await
            }
        }
    }

    async fn start(&mut self, token: &CancellationToken, start: StartSignal) -> Result<Operations> {
        self.common.check_concurrency()?;

        let collector = self.collector.take().unwrap_or_default();
        if self.objects.is_empty() {
            collector.close().await;
            return Err(Error::Config("no objects to download".into()));
        }

        let scope = token.child_token();
        let stop = self.common.start_token(&collector, &scope, OpKind::Get)?;

        let mut workers = JoinSet::new();
        for thread in 0..self.common.concurrency as u16 {
            let common = Arc::clone(&self.common);
            let objects = Arc::clone(&self.objects);
            let receiver = collector.receiver();
            let stop = stop.clone();
            let mut start = start.clone();
            let random_ranges = self.random_ranges;

            workers.spawn(async move {
                let mut rng = SmallRng::seed_from_u64(u64::from(thread));
                start.wait().await;

                while !stop.is_cancelled() {
                    let Some(object) = objects.choose(&mut rng) else {
                        break;
                    };

                    let range = (random_ranges && object.size > 0)
                        .then(|| random_range(&mut rng, object.size));
                    let op = download(&common, thread, object, range).await;
                    receiver.send(op)?;

                    // Clients that never suspend would otherwise starve the run timer.
                    tokio::task::yield_now().await;
                }

                Ok::<_, Error>(())
            });
        }
        drop(start);

        let joined = join_workers(workers, &stop).await;
        scope.cancel();
        let ops = collector.close().await;
        joined.map(|()| ops)
    }

    async fn cleanup(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.close().await;
        }

        let prefixes = std::mem::take(&mut self.created);
        self.common.delete_prefixes(prefixes).await;
    }

    fn common(&self) -> &Common {
        &self.common
    }
}

/// Downloads one object or range, verifying size and, for whole objects, the MD5 digest.
async fn download(
    common: &Common,
    thread: u16,
    object: &Object,
    range: Option<ByteRange>,
) -> Operation {
    let expected = range.map_or(object.size, |r| r.len());
    let options = GetOptions {
        range,
        version_id: object.version_id.clone(),
    };

    let client = common.clients.acquire();
    let mut op = Operation::new(OpKind::Get, thread, &object.name, expected, client.endpoint());
    let mut digest = String::new();

    op.begin();
    match client.get_object(&common.bucket, &object.name, &options).await {
        Err(error) => {
            op.finish();
            op.fail(error);
        }
        Ok(reader) => {
            let mut reader = FirstByteRecorder::new(reader);
            let mut context = md5::Context::new();
            let read = drain_into(&mut reader, &mut context).await;
            op.finish();
            op.first_byte = reader.first_byte();
            digest = format!("{:x}", context.compute());

            match read {
                Err(error) => op.fail(error),
                Ok(got) if got != expected => {
                    op.fail(format!(
                        "unexpected download size. want: {expected}, got: {got}"
                    ));
                }
                Ok(_) => {
                    if let (None, Some(md5)) = (range, &object.md5) {
                        if *md5 != digest {
                            op.fail(format!("checksum mismatch. want: {md5}, got: {digest}"));
                        }
                    }
                }
            }
        }
    }
    drop(client);

    if let Some(err) = &op.err {
        tracing::warn!(thread, object = %object.name, error = %err, "download failed");
    }
    common.log_access(&op, &digest);

    op
}

/// Picks a random byte range of an object with `size > 0` bytes.
///
/// Short ranges are much more likely than long ones. The range always lies within the object.
pub fn random_range<R: Rng>(rng: &mut R, size: u64) -> ByteRange {
    if size <= 1 {
        return ByteRange { start: 0, end: 0 };
    }

    let len = exp_rand_size(rng, size - 1).max(1);
    let start = rng.random_range(0..=size - len);
    ByteRange {
        start,
        end: start + len - 1,
    }
}

/// Draws a length up to `max` whose logarithm is uniformly distributed.
fn exp_rand_size<R: Rng>(rng: &mut R, max: u64) -> u64 {
    if max <= 1 {
        return max;
    }

    let bits = 64 - max.leading_zeros();
    let shift = rng.random_range(0..bits);
    let upper = (1u64 << shift).min(max);
    rng.random_range(upper / 2..=upper).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ranges_stay_within_the_object() {
        for seed in 0..200 {
            let mut rng = SmallRng::seed_from_u64(seed);
            for size in [1, 2, 3, 100, 1024, 1 << 20, 10_000_019] {
                let range = random_range(&mut rng, size);
                assert!(range.start <= range.end, "size {size}: {range:?}");
                assert!(range.end < size, "size {size}: {range:?}");
                assert!(range.len() <= size, "size {size}: {range:?}");
            }
        }
    }

    #[test]
    fn random_ranges_favor_short_lengths() {
        let mut rng = SmallRng::seed_from_u64(42);
        let size = 1 << 30;
        let short = (0..1000)
            .filter(|_| random_range(&mut rng, size).len() < size / 1024)
            .count();
        assert!(short > 500, "only {short} short ranges");
    }
}
