//! Progress metrics for the transformation scheduler.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SchedulerMetrics                        │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌───────────────┐   │
//! │  │  Counters    │  │   Gauges         │  │  Histograms   │   │
//! │  │ - polls      │  │ - jobs_pending   │  │ - job_seconds │   │
//! │  │ - admitted   │  │ - jobs_copying   │  │               │   │
//! │  │ - copies     │  │ - jobs_settling  │  │               │   │
//! │  │ - ops/phase  │  │ - busy_shards    │  │               │   │
//! │  └──────────────┘  └──────────────────┘  └───────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, JOB_DURATION_BUCKETS};

use std::fmt::Write;
use std::time::Duration;

/// Counters and gauges updated by the scheduler loop.
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Scheduler loop iterations.
    pub polls: Counter,
    /// Jobs moved from pending to copying.
    pub jobs_admitted: Counter,
    /// Jobs that ran cleanup.
    pub jobs_finished: Counter,
    /// Pending jobs dropped by an interrupt.
    pub jobs_skipped: Counter,
    /// Copy requests sent.
    pub copies_issued: Counter,
    /// Ops applied, by phase.
    pub ops_applied: LabeledCounter,

    pub jobs_pending: Gauge,
    pub jobs_copying: Gauge,
    pub jobs_settling: Gauge,
    /// Busy shards reported by the last poll.
    pub busy_shards: Gauge,

    /// Time from admission to finish.
    pub job_duration: Histogram,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            polls: Counter::new("shardshift_polls_total", "Scheduler loop iterations"),
            jobs_admitted: Counter::new("shardshift_jobs_admitted_total", "Jobs admitted"),
            jobs_finished: Counter::new("shardshift_jobs_finished_total", "Jobs finished"),
            jobs_skipped: Counter::new(
                "shardshift_jobs_skipped_total",
                "Pending jobs dropped by an interrupt",
            ),
            copies_issued: Counter::new("shardshift_copies_issued_total", "Copy requests sent"),
            ops_applied: LabeledCounter::new(
                "shardshift_ops_applied_total",
                "Ops applied",
                "phase",
            ),
            jobs_pending: Gauge::new("shardshift_jobs_pending", "Jobs waiting for admission"),
            jobs_copying: Gauge::new("shardshift_jobs_copying", "Jobs with copies in flight"),
            jobs_settling: Gauge::new("shardshift_jobs_settling", "Jobs waiting to finish"),
            busy_shards: Gauge::new("shardshift_busy_shards", "Busy shards at the last poll"),
            job_duration: Histogram::new(
                "shardshift_job_duration_seconds",
                "Time from admission to finish",
                JOB_DURATION_BUCKETS,
            ),
        }
    }

    /// Record job counts and busy shards after a poll.
    pub fn record_poll(&self, pending: usize, copying: usize, settling: usize, busy: usize) {
        self.polls.inc();
        self.jobs_pending.set(pending as i64);
        self.jobs_copying.set(copying as i64);
        self.jobs_settling.set(settling as i64);
        self.busy_shards.set(busy as i64);
    }

    pub fn record_finished(&self, duration: Duration) {
        self.jobs_finished.inc();
        self.job_duration.observe_duration(duration);
    }

    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            polls: self.polls.get(),
            jobs_admitted: self.jobs_admitted.get(),
            jobs_finished: self.jobs_finished.get(),
            jobs_skipped: self.jobs_skipped.get(),
            copies_issued: self.copies_issued.get(),
            ops_applied: self.ops_applied.get_all(),
            peak_copying: self.jobs_copying.peak(),
            peak_busy_shards: self.busy_shards.peak(),
            job_duration: self.job_duration.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.polls,
            &self.jobs_admitted,
            &self.jobs_finished,
            &self.jobs_skipped,
            &self.copies_issued,
        ] {
            let _ = write!(
                output,
                "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
                counter.help(),
                counter.get(),
                name = counter.name(),
            );
        }

        let ops = &self.ops_applied;
        let _ = write!(
            output,
            "# HELP {name} {}\n# TYPE {name} counter\n",
            ops.help(),
            name = ops.name()
        );
        for (label, value) in ops.get_all() {
            let _ = writeln!(output, "{}{{{}=\"{}\"}} {}", ops.name(), ops.label(), label, value);
        }

        for gauge in [
            &self.jobs_pending,
            &self.jobs_copying,
            &self.jobs_settling,
            &self.busy_shards,
        ] {
            let _ = write!(
                output,
                "# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n",
                gauge.help(),
                gauge.get(),
                name = gauge.name(),
            );
        }

        let duration = self.job_duration.snapshot();
        let _ = write!(
            output,
            "# HELP {name} {}\n# TYPE {name} histogram\n{name}_sum {}\n{name}_count {}\n",
            self.job_duration.help(),
            duration.sum,
            duration.count,
            name = self.job_duration.name(),
        );

        output
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone)]
pub struct SchedulerMetricsSnapshot {
    pub polls: u64,
    pub jobs_admitted: u64,
    pub jobs_finished: u64,
    pub jobs_skipped: u64,
    pub copies_issued: u64,
    pub ops_applied: Vec<(String, u64)>,
    /// Most jobs ever copying at once.
    pub peak_copying: i64,
    /// Most busy shards ever reported by one poll.
    pub peak_busy_shards: i64,
    pub job_duration: HistogramSnapshot,
}
