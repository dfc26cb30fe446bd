use thiserror::Error;

use crate::client::ClientError;

/// Errors that end a benchmark phase.
///
/// Failures of individual operations are not represented here. They are stored on the
/// [`Operation`](crate::Operation) that observed them and the run continues.
#[derive(Debug, Error)]
pub enum Error {
    /// The benchmark was configured in a way that cannot be executed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An operation was sent to a collector that has already been closed.
    #[error("operation collector is closed")]
    CollectorClosed,

    /// The storage acknowledged fewer bytes than were uploaded while preparing objects.
    #[error("short upload of `{object}`: want {want} bytes, got {got}")]
    ShortWrite {
        /// Name of the affected object.
        object: String,
        /// Number of bytes sent.
        want: u64,
        /// Number of bytes acknowledged by the storage.
        got: u64,
    },

    /// A structural client call failed, such as creating the bucket.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Reading a replay log or writing an access log failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker task panicked or was aborted.
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Result type for benchmark phases.
pub type Result<T, E = Error> = std::result::Result<T, E>;
