//! Test utilities for objbench.
//!
//! See the modules for all available utilities.

pub mod fixtures;
pub mod tracing;
