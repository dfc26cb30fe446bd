use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Benchmark, Common, StartSignal, join_workers, upload};
use crate::collector::Collector;
use crate::error::{Error, Result};
use crate::operation::{OpKind, Operations};

/// Uploads synthetic objects as fast as possible.
#[derive(Debug)]
pub struct Put {
    common: Arc<Common>,
    prefixes: Arc<Mutex<BTreeSet<String>>>,
}

impl Put {
    /// Creates an upload workload.
    pub fn new(common: Common) -> Self {
        Self {
            common: Arc::new(common),
            prefixes: Default::default(),
        }
    }

    /// Prefixes that received uploads so far.
    pub fn prefixes(&self) -> BTreeSet<String> {
        self.prefixes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Benchmark for Put {
    async fn prepare(&mut self, _token: &CancellationToken) -> Result<()> {
        self.common.check_concurrency()?;
        self.common.create_bucket(self.common.clear_bucket).await
    }

    async fn start(&mut self, token: &CancellationToken, start: StartSignal) -> Result<Operations> {
        self.common.check_concurrency()?;

        let collector = Collector::new();
        let scope = token.child_token();
        let stop = self.common.start_token(&collector, &scope, OpKind::Put)?;

        let mut workers = JoinSet::new();
        for thread in 0..self.common.concurrency as u16 {
            let common = Arc::clone(&self.common);
            let prefixes = Arc::clone(&self.prefixes);
            let receiver = collector.receiver();
            let stop = stop.clone();
            let mut start = start.clone();

            workers.spawn(async move {
                let mut source = (common.source)();
                let mut registered = false;
                start.wait().await;

                while !stop.is_cancelled() {
                    if !registered {
                        prefixes
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(source.prefix().to_owned());
                        registered = true;
                    }

                    let uploaded = upload(&common, thread, source.object()).await;
                    receiver.send(uploaded.op)?;

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
        let prefixes = std::mem::take(
            &mut *self
                .prefixes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        self.common.delete_prefixes(prefixes).await;
    }

    fn common(&self) -> &Common {
        &self.common
    }
}
