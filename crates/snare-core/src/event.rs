//! Observer events, intercept decisions and operator commands.
//!
//! The proxy pushes [`ProxyEvent`]s to an external observer (a UI, or the
//! JSON-lines bridge of the `snare` binary). The observer answers pending
//! intercepts with an [`InterceptDecision`] and drives the rest of the
//! system with [`ControlCommand`]s.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::HttpHistory;

/// Which half of a transaction an intercept applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    /// Returns the direction as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown intercept action.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown intercept action: {0}")]
pub struct UnknownAction(pub String);

/// What to do with an intercepted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptAction {
    /// Let it through, optionally with replacement content.
    Forward,
    /// Abort the transaction.
    Drop,
}

impl InterceptAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Drop => "drop",
        }
    }
}

impl FromStr for InterceptAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "drop" => Ok(Self::Drop),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for InterceptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human decision for one pending intercept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptDecision {
    /// Flow the decision is for.
    pub flow_id: String,
    /// Replacement raw request/response text, if the user edited it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    pub action: InterceptAction,
}

impl InterceptDecision {
    /// Forward the original, unmodified content.
    pub fn forward(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            modified: None,
            action: InterceptAction::Forward,
        }
    }

    /// Forward with user-edited raw content.
    pub fn forward_modified(flow_id: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            modified: Some(raw.into()),
            action: InterceptAction::Forward,
        }
    }

    /// Drop the transaction.
    pub fn drop(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            modified: None,
            action: InterceptAction::Drop,
        }
    }

    /// Returns the replacement content, treating an empty string as none.
    pub fn replacement(&self) -> Option<&str> {
        self.modified.as_deref().filter(|raw| !raw.is_empty())
    }
}

/// Snapshot of intercept counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptStats {
    pub intercepted_requests: u64,
    pub intercepted_responses: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Event pushed to the external observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ProxyEvent {
    /// A request is waiting for a decision.
    InterceptRequest {
        id: String,
        /// Raw dump of the request as it would be sent.
        data: String,
    },
    /// A response is waiting for a decision.
    InterceptResponse {
        id: String,
        /// Raw dump of the request that produced it.
        request: String,
        /// Raw dump of the response, body decoded for display.
        response: String,
    },
    /// A transaction completed and was recorded.
    HttpHistory(HttpHistory),
    /// Reply to a [`ControlCommand::Stats`].
    InterceptStats(InterceptStats),
}

impl ProxyEvent {
    /// Returns the flow id for intercept events.
    pub fn flow_id(&self) -> Option<&str> {
        match self {
            Self::InterceptRequest { id, .. } | Self::InterceptResponse { id, .. } => Some(id),
            Self::HttpHistory(history) => Some(&history.flow_id),
            Self::InterceptStats(_) => None,
        }
    }
}

/// Command sent by the operator to a running proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Resolve a pending intercept.
    Decision(InterceptDecision),
    /// Turn interception on or off for one direction.
    Intercept { direction: Direction, enabled: bool },
    /// Drop every recorded transaction.
    Clear,
    /// Ask for an [`ProxyEvent::InterceptStats`] event.
    Stats,
    /// Zero the intercept counters.
    ResetStats,
}
