//! Early termination once measured throughput has stabilized.
//!
//! The controller periodically splits the active time range of all successful records of one
//! kind into equal segments and looks at the trailing few. The most recent segment is the base;
//! the run has converged once every other trailing segment is within `scale` of that base.
//! Nothing is decided before `min_duration` has passed, both in wall-clock time and in the
//! span covered by records.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::operation::{OpKind, Operations, Throughput};

/// Trailing segments compared with each other.
pub const DEFAULT_SAMPLES: usize = 7;
/// Segments the active range is split into.
pub const DEFAULT_SEGMENTS: usize = 25;
/// Time between two convergence checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// Allowed relative deviation from the base segment.
pub const DEFAULT_SCALE: f64 = 0.075;
/// Minimum run time before the controller may stop a run.
pub const DEFAULT_MIN_DURATION: Duration = Duration::from_secs(10);

/// Parameters of the auto-termination controller.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTermination {
    /// Allowed deviation relative to the base segment, e.g. `0.075` for 7.5%.
    pub scale: f64,
    /// Number of trailing segments that must agree.
    pub samples: usize,
    /// Number of equal segments the active range is split into.
    pub segments: usize,
    /// The controller never cancels before this much time has passed.
    ///
    /// A zero duration disables auto-termination.
    #[serde(with = "humantime_serde")]
    pub min_duration: Duration,
    /// Time between two convergence checks.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for AutoTermination {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            samples: DEFAULT_SAMPLES,
            segments: DEFAULT_SEGMENTS,
            min_duration: DEFAULT_MIN_DURATION,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl AutoTermination {
    /// Creates parameters with the default sampling layout.
    pub fn new(min_duration: Duration, scale: f64) -> Self {
        Self {
            scale,
            min_duration,
            ..Default::default()
        }
    }

    /// Returns `false` if the controller should not run at all.
    pub fn is_enabled(&self) -> bool {
        !self.min_duration.is_zero()
    }

    /// Checks that the parameters describe a workable sampling layout.
    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(Error::Config(format!(
                "auto-termination scale must be positive, got {}",
                self.scale
            )));
        }
        if self.samples < 2 || self.segments <= self.samples {
            return Err(Error::Config(format!(
                "auto-termination needs at least 2 samples and more segments than samples, got {} of {}",
                self.samples, self.segments
            )));
        }
        if self.interval.is_zero() {
            return Err(Error::Config(
                "auto-termination interval must not be zero".into(),
            ));
        }
        Ok(())
    }
}

/// Returns `true` if every sample is within `scale` of the last one.
///
/// Rates are compared in bytes per second when the last sample moved any bytes, and in
/// operations per second otherwise. A last sample without any activity never converges.
pub fn converged(samples: &[Throughput], scale: f64) -> bool {
    let Some(base) = samples.last() else {
        return false;
    };

    let rate: fn(&Throughput) -> f64 = if base.bytes > 0 {
        Throughput::bytes_per_sec
    } else if base.ops > 0 {
        Throughput::ops_per_sec
    } else {
        return false;
    };

    let base = rate(base);
    let limit = base * scale;
    samples.iter().all(|sample| (rate(sample) - base).abs() <= limit)
}

/// Watches `ops` and cancels `token` once throughput of `kind` has converged.
///
/// Returns when the token is cancelled, by this controller or anybody else.
pub(crate) async fn watch(
    ops: Arc<Mutex<Operations>>,
    kind: OpKind,
    params: AutoTermination,
    token: CancellationToken,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(params.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if started.elapsed() < params.min_duration {
            continue;
        }

        let samples = {
            let ops = ops.lock().unwrap_or_else(PoisonError::into_inner);
            let Some((from, to)) = ops.active_range(kind) else {
                continue;
            };
            if (to - from).to_std().unwrap_or_default() < params.min_duration {
                continue;
            }
            ops.segment(kind, from, to, params.segments)
        };

        if samples.len() < params.samples {
            continue;
        }
        let window = &samples[samples.len() - params.samples..];
        if !converged(window, params.scale) {
            continue;
        }

        let Some(base) = window.last() else {
            continue;
        };
        tracing::info!(
            kind = %kind,
            elapsed = ?started.elapsed(),
            throughput = %format!("{}/s", ByteSize(base.bytes_per_sec() as u64)),
            ops_per_sec = base.ops_per_sec(),
            "throughput stabilized, stopping benchmark"
        );
        token.cancel();
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ops: u64, bytes: u64) -> Throughput {
        Throughput {
            ops,
            bytes,
            span: Duration::from_secs(1),
        }
    }

    #[test]
    fn constant_samples_converge() {
        let samples = vec![sample(10, 1000); 7];
        assert!(converged(&samples, 0.075));
    }

    #[test]
    fn deviating_sample_prevents_convergence() {
        let mut samples = vec![sample(10, 1000); 7];
        samples[2] = sample(12, 1200);
        assert!(!converged(&samples, 0.075));
        assert!(converged(&samples, 0.25));
    }

    #[test]
    fn ops_are_compared_without_bytes() {
        let samples = vec![sample(100, 0), sample(104, 0), sample(100, 0)];
        assert!(converged(&samples, 0.05));
        assert!(!converged(&samples, 0.01));
    }

    #[test]
    fn idle_base_never_converges() {
        assert!(!converged(&[sample(0, 0); 7], 1.0));
        assert!(!converged(&[], 1.0));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(AutoTermination::default().validate().is_ok());

        let params = AutoTermination {
            samples: 25,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = AutoTermination::new(Duration::from_secs(1), 0.0);
        assert!(params.validate().is_err());
        assert!(!AutoTermination::new(Duration::ZERO, 0.1).is_enabled());
    }
}
