//! # Metrics
//!
//! Counters and gauges are recorded through the `metrics` facade. No exporter
//! is installed here; the host process decides where they go (Prometheus,
//! statsd, nothing). With no recorder installed every call is a no-op.
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `cairn_replica_attempts_total` | counter | `endpoint`, `outcome` |
//! | `cairn_replica_parallel_fallbacks_total` | counter | |
//! | `cairn_refresh_passes_total` | counter | `result` |
//! | `cairn_snapshot_version` | gauge | |
//! | `cairn_snapshot_keys` | gauge | |
//!
//! Endpoint labels use the replica host name. Pools are small and stable, so
//! label cardinality stays bounded.

use crate::replica::{endpoint::Endpoint, errors::FailureClass};
use metrics::{counter, gauge};

/// Outcome of one attempt against one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(FailureClass),
}

/// Maps a state to its metric label.
pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
}

impl MetricsState for FailureClass {
    fn as_metric_str(&self) -> &'static str {
        self.as_str()
    }
}

impl MetricsState for AttemptOutcome {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed(class) => class.as_metric_str(),
        }
    }
}

/// Result of one refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Unchanged,
    Published,
    Failed,
}

impl MetricsState for PassResult {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }
}

pub fn record_attempt(endpoint: &Endpoint, outcome: AttemptOutcome) {
    counter!(
        "cairn_replica_attempts_total",
        "endpoint" => endpoint.host().to_string(),
        "outcome" => outcome.as_metric_str()
    )
    .increment(1);
}

pub fn record_parallel_fallback() {
    counter!("cairn_replica_parallel_fallbacks_total").increment(1);
}

pub fn record_refresh_pass(result: PassResult) {
    counter!("cairn_refresh_passes_total", "result" => result.as_metric_str()).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub fn record_snapshot(version: u64, keys: usize) {
    gauge!("cairn_snapshot_version").set(version as f64);
    gauge!("cairn_snapshot_keys").set(keys as f64);
}
