//! Human readable summary of a finished run.

use std::fmt;
use std::time::Duration;

use bytesize::ByteSize;
use objbench_engine::bench::REPLAY_ENDPOINT;
use objbench_engine::{OpKind, Operations};
use sketches_ddsketch::DDSketch;
use yansi::Paint;

/// Aggregated numbers of one operation kind.
#[derive(Default)]
pub struct KindReport {
    pub kind: Option<OpKind>,
    pub ops: u64,
    pub failures: u64,
    /// Records seeded from an access log, excluded from all other numbers.
    pub replayed: u64,
    pub bytes: u64,
    /// Span from the first start to the last end of successful calls.
    pub active: Duration,
    pub latency: DDSketch,
    pub ttfb: DDSketch,
    pub sizes: DDSketch,
}

impl KindReport {
    fn kind_name(&self) -> &'static str {
        self.kind.map_or("UNKNOWN", |kind| kind.as_str())
    }

    pub fn ops_per_sec(&self) -> f64 {
        per_sec(self.ops as f64, self.active)
    }

    pub fn bytes_per_sec(&self) -> u64 {
        per_sec(self.bytes as f64, self.active) as u64
    }
}

fn per_sec(value: f64, span: Duration) -> f64 {
    let secs = span.as_secs_f64();
    if secs > 0.0 { value / secs } else { 0.0 }
}

/// Builds one report per kind present in `ops`.
pub fn summarize(ops: &Operations) -> Vec<KindReport> {
    ops.kinds()
        .into_iter()
        .map(|kind| {
            let mut report = KindReport {
                kind: Some(kind),
                ..Default::default()
            };

            let mut range = None;
            for op in ops.by_kind(kind) {
                if op.endpoint == REPLAY_ENDPOINT {
                    report.replayed += 1;
                    continue;
                }
                if !op.is_ok() {
                    report.failures += 1;
                    continue;
                }

                report.ops += 1;
                report.bytes += op.size;
                report.latency.add(op.duration().as_secs_f64());
                report.sizes.add(op.size as f64);
                if let Some(ttfb) = op.time_to_first_byte() {
                    report.ttfb.add(ttfb.as_secs_f64());
                }

                range = match range {
                    None => Some((op.start, op.end)),
                    Some((start, end)) => Some((op.start.min(start), op.end.max(end))),
                };
            }

            if let Some((start, end)) = range {
                report.active = (end - start).to_std().unwrap_or_default();
            }
            report
        })
        .collect()
}

/// Prints all reports to stdout.
pub fn print(reports: &[KindReport]) {
    for report in reports {
        print_report(report);
    }
}

fn print_report(report: &KindReport) {
    let kind = format!("{}:", report.kind_name());

    if report.ops == 0 {
        if report.failures > 0 {
            println!(
                "{}",
                format!("{} {} FAILURES", report.failures, report.kind_name())
                    .bold()
                    .red()
            );
        } else if report.replayed > 0 {
            println!(
                "{} ({} replayed)",
                kind.bold().green(),
                report.replayed.bold()
            );
        }
        return;
    }

    print!("{} ({} ops", kind.bold().green(), report.ops.bold());
    if report.failures > 0 {
        print!(
            ", {}",
            format!("{} FAILURES", report.failures).bold().red()
        );
    }
    if report.replayed > 0 {
        print!(", {} replayed", report.replayed);
    }
    println!(", {:.2?} active)", report.active);

    print_sizes(&report.sizes);
    print!("  {:.2} operations/s", report.ops_per_sec().bold());
    println!(", {:.2}/s", ByteSize::b(report.bytes_per_sec()).bold());

    print!("  latency");
    print_percentiles(&report.latency, Duration::from_secs_f64);
    if report.ttfb.count() > 0 {
        print!("  ttfb");
        print_percentiles(&report.ttfb, Duration::from_secs_f64);
    }
}

fn print_sizes(sketch: &DDSketch) {
    let Some(stats) = Percentiles::new(sketch, |v| ByteSize::b(v as u64)) else {
        return;
    };
    let Percentiles { avg, p50, p90, p99 } = stats;
    println!(
        "  size avg: {:.2}; p50: {p50:.2}; p90: {p90:.2}; p99: {p99:.2}",
        avg.bold()
    );
}

fn print_percentiles<T: fmt::Debug>(sketch: &DDSketch, map: impl Fn(f64) -> T) {
    let Some(stats) = Percentiles::new(sketch, map) else {
        println!();
        return;
    };
    let Percentiles { avg, p50, p90, p99 } = stats;
    println!(
        " avg: {:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}",
        avg.bold()
    );
}

/// Average and percentiles of a sketch, mapped into a display type.
#[derive(Debug, PartialEq)]
struct Percentiles<T> {
    avg: T,
    p50: T,
    p90: T,
    p99: T,
}

impl<T> Percentiles<T> {
    fn new(sketch: &DDSketch, map: impl Fn(f64) -> T) -> Option<Self> {
        let count = sketch.count();
        if count == 0 {
            return None;
        }

        let quantile = |q| sketch.quantile(q).ok().flatten();
        Some(Self {
            avg: map(sketch.sum()? / count as f64),
            p50: map(quantile(0.5)?),
            p90: map(quantile(0.9)?),
            p99: map(quantile(0.99)?),
        })
    }
}
