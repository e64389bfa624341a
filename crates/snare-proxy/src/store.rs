//! Flow transaction store.
//!
//! Bridges the request and response callbacks of one transaction, which run
//! as independent tasks. Pending state is keyed by flow id and consumed with
//! take semantics; finished transactions move to a permanent id-keyed store
//! that lives until an operator clears it.
//!
//! ```text
//! on_request ──put──► summaries[flow]      ──take──► on_response
//!            ──put──► raw_requests[flow]   ──take──►     │
//!                                                        ▼
//!                                     bodies[id], url_index[url]
//! ```
//!
//! Only the janitor deletes pending entries out of band.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use snare_core::{HttpBody, HttpHistory};

/// Entry counts, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub pending_summaries: usize,
    pub pending_raw_requests: usize,
    pub permanent: usize,
}

/// What one janitor sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_summaries: usize,
    pub orphaned_raw_requests: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_summaries == 0 && self.orphaned_raw_requests == 0
    }
}

/// Concurrent store of pending and finished transactions.
#[derive(Debug)]
pub struct FlowStore {
    summaries: DashMap<String, HttpHistory>,
    raw_requests: DashMap<String, String>,
    bodies: DashMap<i64, HttpBody>,
    url_index: DashMap<String, i64>,
    next_id: AtomicI64,
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStore {
    /// Creates an empty store. Ids start at 1.
    pub fn new() -> Self {
        Self {
            summaries: DashMap::new(),
            raw_requests: DashMap::new(),
            bodies: DashMap::new(),
            url_index: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Allocates the next surrogate id. Ids are never reused, even after a
    /// clear.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ==================== Pending summaries ====================

    /// Stores a pending summary, replacing any previous one for the flow.
    pub fn put_summary(&self, flow_id: &str, summary: HttpHistory) {
        if self.summaries.insert(flow_id.to_string(), summary).is_some() {
            tracing::warn!("Replaced pending summary for flow {}", flow_id);
        }
    }

    /// Removes and returns the pending summary of a flow.
    pub fn take_summary(&self, flow_id: &str) -> Option<HttpHistory> {
        self.summaries.remove(flow_id).map(|(_, summary)| summary)
    }

    /// Updates a pending summary in place. Returns false if there is none.
    pub fn update_summary(&self, flow_id: &str, f: impl FnOnce(&mut HttpHistory)) -> bool {
        match self.summaries.get_mut(flow_id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Copy of a pending summary.
    pub fn summary(&self, flow_id: &str) -> Option<HttpHistory> {
        self.summaries.get(flow_id).map(|entry| entry.value().clone())
    }

    // ==================== Pending raw requests ====================

    /// Stores or overwrites the raw request of a flow.
    pub fn put_raw_request(&self, flow_id: &str, raw: String) {
        self.raw_requests.insert(flow_id.to_string(), raw);
    }

    /// Removes and returns the raw request of a flow.
    pub fn take_raw_request(&self, flow_id: &str) -> Option<String> {
        self.raw_requests.remove(flow_id).map(|(_, raw)| raw)
    }

    /// Copy of the raw request of a flow.
    pub fn peek_raw_request(&self, flow_id: &str) -> Option<String> {
        self.raw_requests.get(flow_id).map(|entry| entry.value().clone())
    }

    /// Removes and returns both pending entries of a flow, or nothing if
    /// either is missing.
    ///
    /// The raw request goes first: a sweep only evicts raw requests whose
    /// summary is gone, so it cannot orphan one between the two removals.
    pub fn take_pending(&self, flow_id: &str) -> Option<(HttpHistory, String)> {
        let raw = self.take_raw_request(flow_id);
        let summary = self.take_summary(flow_id);
        summary.zip(raw)
    }

    /// Drops all pending state of a flow.
    pub fn purge_flow(&self, flow_id: &str) {
        self.summaries.remove(flow_id);
        self.raw_requests.remove(flow_id);
    }

    // ==================== Permanent store ====================

    /// Stores a finished transaction and indexes it by URL.
    pub fn store_permanent(&self, body: HttpBody) {
        self.url_index.insert(body.target_url.clone(), body.id);
        self.bodies.insert(body.id, body);
    }

    /// Raw record by id.
    pub fn body(&self, id: i64) -> Option<HttpBody> {
        self.bodies.get(&id).map(|entry| entry.value().clone())
    }

    /// Latest record id for a URL.
    pub fn id_for_url(&self, url: &str) -> Option<i64> {
        self.url_index.get(url).map(|entry| *entry.value())
    }

    /// Clears finished transactions. Pending flows are kept.
    pub fn clear_permanent(&self) {
        self.bodies.clear();
        self.url_index.clear();
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            pending_summaries: self.summaries.len(),
            pending_raw_requests: self.raw_requests.len(),
            permanent: self.bodies.len(),
        }
    }

    // ==================== Eviction ====================

    /// Evicts pending summaries older than `max_age`, then raw requests
    /// whose flow has no pending summary.
    pub fn sweep_expired(&self, now: DateTime<Utc>, max_age: Duration) -> SweepReport {
        let cutoff = now - max_age;

        let before = self.summaries.len();
        self.summaries.retain(|flow_id, summary| {
            let keep = summary.timestamp >= cutoff;
            if !keep {
                tracing::debug!("Evicting stale flow {} ({})", flow_id, summary.full_url);
            }
            keep
        });
        let expired_summaries = before.saturating_sub(self.summaries.len());

        let before = self.raw_requests.len();
        self.raw_requests
            .retain(|flow_id, _| self.summaries.contains_key(flow_id));
        let orphaned_raw_requests = before.saturating_sub(self.raw_requests.len());

        SweepReport {
            expired_summaries,
            orphaned_raw_requests,
        }
    }
}
