//! In-process metrics for the coordination core.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         CoreMetrics                           │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────────┐  │
//! │  │     RPC      │  │   Sequencer    │  │    Topology      │  │
//! │  │ - requests   │  │ - submitted    │  │ - applied        │  │
//! │  │ - timeouts   │  │ - completed    │  │ - buffered       │  │
//! │  │ - leavers    │  │ - pending      │  │ - rebalances     │  │
//! │  │ - latency    │  │                │  │ - duration       │  │
//! │  └──────────────┘  └────────────────┘  └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::Counter;
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, DEFAULT_BUCKETS};

use std::fmt::Write as _;
use std::time::Duration;

/// Latency buckets for remote invocations (in seconds).
pub const RPC_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
];

/// Duration buckets for whole rebalances (in seconds).
pub const REBALANCE_DURATION_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0];

/// Metrics shared by all components of a node.
#[derive(Debug)]
pub struct CoreMetrics {
    /// Remote invocations issued.
    pub rpc_requests: Counter,
    /// Invocations that hit their deadline.
    pub rpc_timeouts: Counter,
    /// Synthetic leaver responses produced.
    pub rpc_leaver_responses: Counter,
    /// Invocations that failed with a protocol violation.
    pub rpc_protocol_violations: Counter,
    /// Invocation latency.
    pub rpc_latency: Histogram,

    /// Actions submitted to the sequencer.
    pub sequencer_submitted: Counter,
    /// Actions completed (successfully or not).
    pub sequencer_completed: Counter,
    /// Actions submitted but not yet completed.
    pub sequencer_pending: Gauge,

    /// Topologies applied in order.
    pub topology_applied: Counter,
    /// Topologies held back until their predecessor arrives.
    pub topology_buffered: Counter,
    /// Stale topologies dropped.
    pub topology_rejected: Counter,

    /// Rebalances started.
    pub rebalance_started: Counter,
    /// Rebalances that reached a stable topology.
    pub rebalance_completed: Counter,
    /// Rebalances aborted on a fatal phase failure.
    pub rebalance_aborted: Counter,
    /// Phases reported as stuck.
    pub rebalance_stuck_phases: Counter,
    /// Rebalance duration.
    pub rebalance_duration: Histogram,
}

impl CoreMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            rpc_requests: Counter::new("rpc_requests_total", "Remote invocations issued"),
            rpc_timeouts: Counter::new("rpc_timeouts_total", "Invocations that timed out"),
            rpc_leaver_responses: Counter::new(
                "rpc_leaver_responses_total",
                "Synthetic responses for targets that left",
            ),
            rpc_protocol_violations: Counter::new(
                "rpc_protocol_violations_total",
                "Invocations failed by a protocol violation",
            ),
            rpc_latency: Histogram::with_buckets(
                "rpc_latency_seconds",
                "Remote invocation latency",
                RPC_LATENCY_BUCKETS.to_vec(),
            ),

            sequencer_submitted: Counter::new(
                "sequencer_submitted_total",
                "Actions submitted to the sequencer",
            ),
            sequencer_completed: Counter::new(
                "sequencer_completed_total",
                "Actions completed by the sequencer",
            ),
            sequencer_pending: Gauge::new("sequencer_pending_actions", "Actions not yet completed"),

            topology_applied: Counter::new("topology_applied_total", "Topologies applied"),
            topology_buffered: Counter::new("topology_buffered_total", "Topologies buffered"),
            topology_rejected: Counter::new("topology_rejected_total", "Stale topologies dropped"),

            rebalance_started: Counter::new("rebalance_started_total", "Rebalances started"),
            rebalance_completed: Counter::new("rebalance_completed_total", "Rebalances completed"),
            rebalance_aborted: Counter::new("rebalance_aborted_total", "Rebalances aborted"),
            rebalance_stuck_phases: Counter::new(
                "rebalance_stuck_phases_total",
                "Rebalance phases reported stuck",
            ),
            rebalance_duration: Histogram::with_buckets(
                "rebalance_duration_seconds",
                "Rebalance duration",
                REBALANCE_DURATION_BUCKETS.to_vec(),
            ),
        }
    }

    /// Record a completed invocation.
    pub fn record_rpc(&self, latency: Duration) {
        self.rpc_latency.observe_duration(latency);
    }

    /// Record a finished rebalance.
    pub fn record_rebalance(&self, success: bool, duration: Duration) {
        if success {
            self.rebalance_completed.inc();
        } else {
            self.rebalance_aborted.inc();
        }
        self.rebalance_duration.observe_duration(duration);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rpc_requests: self.rpc_requests.get(),
            rpc_timeouts: self.rpc_timeouts.get(),
            rpc_leaver_responses: self.rpc_leaver_responses.get(),
            sequencer_pending: self.sequencer_pending.get(),
            topology_applied: self.topology_applied.get(),
            topology_rejected: self.topology_rejected.get(),
            rebalance_started: self.rebalance_started.get(),
            rebalance_completed: self.rebalance_completed.get(),
            rebalance_aborted: self.rebalance_aborted.get(),
            rpc_latency: self.rpc_latency.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = [
            &self.rpc_requests,
            &self.rpc_timeouts,
            &self.rpc_leaver_responses,
            &self.rpc_protocol_violations,
            &self.sequencer_submitted,
            &self.sequencer_completed,
            &self.topology_applied,
            &self.topology_buffered,
            &self.topology_rejected,
            &self.rebalance_started,
            &self.rebalance_completed,
            &self.rebalance_aborted,
            &self.rebalance_stuck_phases,
        ];
        for counter in counters {
            counter.expose(&mut output);
        }
        self.sequencer_pending.expose(&mut output);

        for histogram in [&self.rpc_latency, &self.rebalance_duration] {
            let snapshot = histogram.snapshot();
            let _ = writeln!(
                output,
                "# HELP {name} {help}\n# TYPE {name} histogram",
                name = histogram.name(),
                help = histogram.help()
            );
            for (upper, count) in snapshot.buckets.iter().zip(&snapshot.bucket_counts) {
                let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", histogram.name(), upper, count);
            }
            let _ = writeln!(
                output,
                "{}_bucket{{le=\"+Inf\"}} {}",
                histogram.name(),
                snapshot.count
            );
            let _ = writeln!(output, "{}_sum {}", histogram.name(), snapshot.sum);
            let _ = writeln!(output, "{}_count {}", histogram.name(), snapshot.count);
        }

        output
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the most watched metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub rpc_requests: u64,
    pub rpc_timeouts: u64,
    pub rpc_leaver_responses: u64,
    pub sequencer_pending: i64,
    pub topology_applied: u64,
    pub topology_rejected: u64,
    pub rebalance_started: u64,
    pub rebalance_completed: u64,
    pub rebalance_aborted: u64,
    pub rpc_latency: HistogramSnapshot,
}
