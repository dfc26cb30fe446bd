//! Fan-in of operation records from all workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::autoterm::{self, AutoTermination};
use crate::error::{Error, Result};
use crate::operation::{OpKind, Operation, Operations};

/// Gathers the [`Operation`]s of a run into one sequence.
///
/// Workers obtain a [`Receiver`] and send one record per finished call. A single consumer task
/// appends the records in arrival order. Sends never block and are never dropped while the
/// collector is open.
#[derive(Debug)]
pub struct Collector {
    sender: mpsc::UnboundedSender<Operation>,
    closed: Arc<AtomicBool>,
    ops: Arc<Mutex<Operations>>,
    closing: CancellationToken,
    consumer: JoinHandle<()>,
}

impl Collector {
    /// Creates a collector and spawns its consumer task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let ops = Arc::new(Mutex::new(Operations::new()));
        let closing = CancellationToken::new();

        let consumer = tokio::spawn(consume(receiver, Arc::clone(&ops), closing.clone()));

        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
            ops,
            closing,
            consumer,
        }
    }

    /// Returns a conduit for sending records to this collector.
    pub fn receiver(&self) -> Receiver {
        Receiver {
            sender: self.sender.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Number of records collected so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no record has been collected yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Derives a token that is additionally cancelled once throughput of `kind` converges.
    ///
    /// If `params` disables auto-termination, a clone of `token` is returned and no controller
    /// is started. The controller stops as soon as either token is cancelled.
    pub fn auto_terminate(
        &self,
        token: &CancellationToken,
        kind: OpKind,
        params: &AutoTermination,
    ) -> Result<CancellationToken> {
        if !params.is_enabled() {
            return Ok(token.clone());
        }
        params.validate()?;

        let child = token.child_token();
        tracing::debug!(%kind, ?params, "starting auto-termination controller");
        tokio::spawn(autoterm::watch(
            Arc::clone(&self.ops),
            kind,
            *params,
            child.clone(),
        ));
        Ok(child)
    }

    /// Stops accepting records, drains pending ones and returns everything collected.
    ///
    /// Call this only after all workers have stopped sending.
    pub async fn close(self) -> Operations {
        let Self {
            sender,
            closed,
            ops,
            closing,
            consumer,
        } = self;

        closed.store(true, Ordering::Release);
        closing.cancel();
        drop(sender);

        if let Err(error) = consumer.await {
            tracing::error!(%error, "operation collector failed");
        }

        std::mem::take(&mut *ops.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Operations> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

async fn consume(
    mut receiver: mpsc::UnboundedReceiver<Operation>,
    ops: Arc<Mutex<Operations>>,
    closing: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            op = receiver.recv() => match op {
                Some(op) => ops.lock().unwrap_or_else(PoisonError::into_inner).push(op),
                None => return,
            },
            _ = closing.cancelled() => break,
        }
    }

    // Reject further sends, then take whatever is still queued.
    receiver.close();
    let mut ops = ops.lock().unwrap_or_else(PoisonError::into_inner);
    while let Ok(op) = receiver.try_recv() {
        ops.push(op);
    }
}

/// Write side of a [`Collector`], held by a worker.
#[derive(Clone, Debug)]
pub struct Receiver {
    sender: mpsc::UnboundedSender<Operation>,
    closed: Arc<AtomicBool>,
}

impl Receiver {
    /// Hands a finished record to the collector.
    ///
    /// Fails with [`Error::CollectorClosed`] once the collector has been closed.
    pub fn send(&self, op: Operation) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::CollectorClosed);
        }
        self.sender.send(op).map_err(|_| Error::CollectorClosed)
    }
}
