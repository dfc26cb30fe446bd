//! Load generation engine for S3-style object storage.
//!
//! A benchmark drives many concurrent workers against a single bucket and records every call
//! as an [`Operation`]. Two workloads are provided:
//!
//! - [`Put`](bench::Put) uploads synthetic objects from an [`ObjectSource`].
//! - [`Get`](bench::Get) downloads objects picked at random from a set that was either uploaded
//!   during Prepare or read from a historical access log (see [`replay`]).
//!
//! All records flow through a [`Collector`], which can also stop a run once throughput has
//! stabilized (see [`autoterm`]). The storage itself is reached through the [`ObjectClient`]
//! trait; [`InMemoryClient`](client::InMemoryClient) implements it for tests.
//!
//! ```no_run
//! use objbench_engine::bench::{self, Common, Put, RunOptions};
//! use objbench_engine::client::{ClientPool, InMemoryClient};
//! use objbench_engine::source::{RandomSource, SizeDistribution};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> objbench_engine::Result<()> {
//! let source = RandomSource::factory(SizeDistribution::Fixed(4096))?;
//! let mut common = Common::new("bench", ClientPool::single(InMemoryClient::new()), source);
//! common.concurrency = 8;
//!
//! let options = RunOptions {
//!     duration: std::time::Duration::from_secs(10),
//!     ..Default::default()
//! };
//! let ops = bench::run(&mut Put::new(common), &options, &CancellationToken::new()).await?;
//! println!("{} uploads", ops.len());
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod access_log;
pub mod autoterm;
pub mod bench;
pub mod client;
pub mod collector;
pub mod export;
pub mod operation;
pub mod readers;
pub mod replay;
pub mod source;

mod error;

pub use crate::autoterm::AutoTermination;
pub use crate::client::ObjectClient;
pub use crate::collector::Collector;
pub use crate::error::{Error, Result};
pub use crate::operation::{OpKind, Operation, Operations, Throughput};
pub use crate::replay::ReplayMode;
pub use crate::source::ObjectSource;
