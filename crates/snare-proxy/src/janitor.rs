//! Cache janitor.
//!
//! Reclaims pending transactions whose response never arrived (connection
//! reset, upstream failure, engine-level drop). It is the only component
//! that deletes pending entries out of band.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::{FlowStore, SweepReport};

/// Default time between sweeps.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Default age after which a pending transaction is considered lost.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Periodic sweeper for the pending maps of a [`FlowStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheJanitor {
    period: Duration,
    max_age: Duration,
}

impl Default for CacheJanitor {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_PERIOD, DEFAULT_MAX_AGE)
    }
}

impl CacheJanitor {
    pub fn new(period: Duration, max_age: Duration) -> Self {
        Self { period, max_age }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Runs one sweep as of `now`.
    pub fn sweep(&self, store: &FlowStore, now: DateTime<Utc>) -> SweepReport {
        let max_age = chrono::Duration::from_std(self.max_age)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let report = store.sweep_expired(now, max_age);
        if report.is_empty() {
            tracing::debug!("Janitor sweep: nothing to evict");
        } else {
            tracing::info!(
                "Janitor evicted {} stale summaries and {} orphaned raw requests",
                report.expired_summaries,
                report.orphaned_raw_requests
            );
        }
        report
    }

    /// Returns the sweep loop. Spawn it as a background task.
    pub fn start_sweeping(self, store: Arc<FlowStore>) -> impl std::future::Future<Output = ()> + Send {
        async move {
            loop {
                tokio::time::sleep(self.period).await;
                self.sweep(&store, Utc::now());
            }
        }
    }

    /// Spawns the sweep loop on the current runtime.
    pub fn spawn(self, store: Arc<FlowStore>) -> tokio::task::JoinHandle<()> {
        tracing::debug!(
            "Starting cache janitor (period {:?}, max age {:?})",
            self.period,
            self.max_age
        );
        tokio::spawn(self.start_sweeping(store))
    }
}
