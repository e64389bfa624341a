//! Interactive interception.
//!
//! When interception is enabled for a direction, the pipeline parks the
//! transaction until an operator decides to forward (possibly with edited
//! content) or drop it, or until the timeout elapses.
//!
//! ## Rendezvous
//!
//! ```text
//! wait()                                   submit_decision()
//!   │ register slot[flow] (capacity 1)
//!   │ emit Intercept* event ──────────────► observer
//!   │ await recv (timeout)                      │
//!   │ ◄──────────────────────── send_timeout ◄──┘
//!   │ re-check switch
//!   ▼ deregister slot (every exit path)
//! ```
//!
//! The slot is registered before the event goes out, so a decision can
//! never arrive before anyone is listening. The guard that removes it only
//! removes its own registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use snare_core::{Direction, InterceptAction, InterceptDecision, InterceptStats, ProxyEvent};
use tokio::sync::mpsc;

use crate::events::EventSink;

/// What happens when no decision arrives in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterceptTimeoutPolicy {
    /// Forward the original message.
    #[default]
    FailOpen,
    /// Drop the transaction.
    FailClosed,
}

impl From<InterceptAction> for InterceptTimeoutPolicy {
    fn from(action: InterceptAction) -> Self {
        match action {
            InterceptAction::Forward => Self::FailOpen,
            InterceptAction::Drop => Self::FailClosed,
        }
    }
}

/// Result of one rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// Interception was off, or was switched off while waiting.
    Skipped,
    /// Forward, with replacement raw text if the operator edited it.
    Forward(Option<String>),
    /// No decision in time; forward the original.
    TimedOut,
    /// Abort the transaction.
    Drop,
}

impl InterceptOutcome {
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Drop)
    }

    /// Replacement text, if any.
    pub fn replacement(&self) -> Option<&str> {
        match self {
            Self::Forward(Some(raw)) => Some(raw),
            _ => None,
        }
    }
}

struct Slot {
    token: u64,
    tx: mpsc::Sender<InterceptDecision>,
}

struct SlotGuard<'a> {
    slots: &'a DashMap<String, Slot>,
    flow_id: &'a str,
    token: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .remove_if(self.flow_id, |_, slot| slot.token == self.token);
    }
}

#[derive(Debug, Default)]
struct Counters {
    intercepted_requests: AtomicU64,
    intercepted_responses: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

/// Per-direction intercept switches and the table of pending rendezvous.
pub struct Interceptor {
    request_enabled: AtomicBool,
    response_enabled: AtomicBool,
    slots: DashMap<String, Slot>,
    next_token: AtomicU64,
    timeout: Duration,
    send_timeout: Duration,
    policy: InterceptTimeoutPolicy,
    counters: Counters,
    events: EventSink,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("request_enabled", &self.is_enabled(Direction::Request))
            .field("response_enabled", &self.is_enabled(Direction::Response))
            .field("pending", &self.slots.len())
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Interceptor {
    /// Creates an interceptor with both directions disabled.
    pub fn new(
        events: EventSink,
        timeout: Duration,
        send_timeout: Duration,
        policy: InterceptTimeoutPolicy,
    ) -> Self {
        Self {
            request_enabled: AtomicBool::new(false),
            response_enabled: AtomicBool::new(false),
            slots: DashMap::new(),
            next_token: AtomicU64::new(1),
            timeout,
            send_timeout,
            policy,
            counters: Counters::default(),
            events,
        }
    }

    fn switch(&self, direction: Direction) -> &AtomicBool {
        match direction {
            Direction::Request => &self.request_enabled,
            Direction::Response => &self.response_enabled,
        }
    }

    /// Turns interception on or off. Takes effect for the next transaction
    /// and for any rendezvous that wakes afterwards.
    pub fn set_enabled(&self, direction: Direction, enabled: bool) {
        let previous = self.switch(direction).swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            tracing::info!(
                "{} interception {}",
                direction,
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }

    pub fn is_enabled(&self, direction: Direction) -> bool {
        self.switch(direction).load(Ordering::SeqCst)
    }

    /// Returns true if a rendezvous is waiting for this flow.
    pub fn is_pending(&self, flow_id: &str) -> bool {
        self.slots.contains_key(flow_id)
    }

    /// Number of rendezvous currently waiting.
    pub fn pending_count(&self) -> usize {
        self.slots.len()
    }

    /// Parks the caller until a decision for `flow_id` arrives or the
    /// timeout elapses. `event` is emitted once the slot is registered.
    pub async fn wait(&self, flow_id: &str, direction: Direction, event: ProxyEvent) -> InterceptOutcome {
        if !self.is_enabled(direction) {
            return InterceptOutcome::Skipped;
        }

        let (tx, mut rx) = mpsc::channel(1);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if self.slots.insert(flow_id.to_string(), Slot { token, tx }).is_some() {
            tracing::warn!("Replaced pending {} intercept for flow {}", direction, flow_id);
        }
        let _guard = SlotGuard {
            slots: &self.slots,
            flow_id,
            token,
        };

        let counter = match direction {
            Direction::Request => &self.counters.intercepted_requests,
            Direction::Response => &self.counters.intercepted_responses,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("Waiting for {} decision on flow {}", direction, flow_id);
        self.events.emit(event).await;

        match tokio::time::timeout(self.timeout, rx.recv()).await {
            Ok(Some(decision)) => {
                if !self.is_enabled(direction) {
                    tracing::info!(
                        "{} interception was disabled while flow {} waited, forwarding original",
                        direction,
                        flow_id
                    );
                    return InterceptOutcome::Skipped;
                }
                match decision.action {
                    InterceptAction::Forward => {
                        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                        InterceptOutcome::Forward(decision.replacement().map(str::to_string))
                    }
                    InterceptAction::Drop => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        InterceptOutcome::Drop
                    }
                }
            }
            Ok(None) => {
                // Our slot was replaced by a newer rendezvous for the same flow.
                tracing::warn!("Intercept slot for flow {} closed without a decision", flow_id);
                InterceptOutcome::Skipped
            }
            Err(_) => match self.policy {
                InterceptTimeoutPolicy::FailOpen => {
                    tracing::warn!(
                        "No {} decision for flow {} within {:?}, forwarding original",
                        direction,
                        flow_id,
                        self.timeout
                    );
                    InterceptOutcome::TimedOut
                }
                InterceptTimeoutPolicy::FailClosed => {
                    tracing::warn!(
                        "No {} decision for flow {} within {:?}, dropping",
                        direction,
                        flow_id,
                        self.timeout
                    );
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    InterceptOutcome::Drop
                }
            },
        }
    }

    /// Hands a decision to the waiting rendezvous.
    ///
    /// Returns false, with a warning, if nothing is waiting for the flow or
    /// the slot could not take the decision in time. Never retried.
    pub async fn submit_decision(&self, decision: InterceptDecision) -> bool {
        let tx = match self.slots.get(&decision.flow_id) {
            Some(slot) => slot.tx.clone(),
            None => {
                tracing::warn!("No pending intercept for flow {}", decision.flow_id);
                return false;
            }
        };

        let flow_id = decision.flow_id.clone();
        match tx.send_timeout(decision, self.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Decision for flow {} discarded: {}", flow_id, e);
                false
            }
        }
    }

    pub fn stats(&self) -> InterceptStats {
        InterceptStats {
            intercepted_requests: self.counters.intercepted_requests.load(Ordering::Relaxed),
            intercepted_responses: self.counters.intercepted_responses.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.intercepted_requests.store(0, Ordering::Relaxed);
        self.counters.intercepted_responses.store(0, Ordering::Relaxed);
        self.counters.forwarded.store(0, Ordering::Relaxed);
        self.counters.dropped.store(0, Ordering::Relaxed);
    }
}
