//! Command line front end of the object storage benchmark.
//!
//! `objbench run` executes the benchmark described by the configuration against one or more
//! S3-compatible endpoints and prints a per-kind summary. `objbench convert` turns a gateway
//! access log into the TSV format of recorded operations, so historical traffic can be analyzed
//! with the same tools as benchmark results.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod cli;
mod config;
mod convert;
mod observability;
mod report;
mod s3;

fn main() -> anyhow::Result<()> {
    cli::execute()
}
