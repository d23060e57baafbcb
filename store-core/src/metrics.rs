//! Metrics for the transaction executor
//!
//! # Metrics
//!
//! - `core_tx_commits_total` - Committed transactions
//! - `core_tx_conflicts_total` - Serialization conflicts detected
//! - `core_tx_retries_total` - Conflict retries performed
//! - `core_tx_exhausted_total` - Transactions that spent their retry budget
//! - `core_tx_commit_seconds` - Histogram of commit latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector for the executor
#[derive(Clone)]
pub struct StoreMetrics {
    /// Committed transactions
    pub commits: IntCounter,

    /// Serialization conflicts detected
    pub conflicts: IntCounter,

    /// Conflict retries performed
    pub retries: IntCounter,

    /// Transactions that exhausted the retry budget
    pub exhausted: IntCounter,

    /// Commit latency histogram
    pub commit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl StoreMetrics {
    /// Create a new collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let commits = IntCounter::new("core_tx_commits_total", "Committed transactions")?;
        registry.register(Box::new(commits.clone()))?;

        let conflicts = IntCounter::new(
            "core_tx_conflicts_total",
            "Serialization conflicts detected",
        )?;
        registry.register(Box::new(conflicts.clone()))?;

        let retries = IntCounter::new("core_tx_retries_total", "Conflict retries performed")?;
        registry.register(Box::new(retries.clone()))?;

        let exhausted = IntCounter::new(
            "core_tx_exhausted_total",
            "Transactions that exhausted the retry budget",
        )?;
        registry.register(Box::new(exhausted.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("core_tx_commit_seconds", "Histogram of commit latencies").buckets(
                vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0],
            ),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            commits,
            conflicts,
            retries,
            exhausted,
            commit_duration,
            registry,
        })
    }

    /// Get the registry (for scrape endpoints owned by callers)
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
