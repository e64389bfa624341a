//! Transaction history records.
//!
//! A transaction is tracked in two shapes:
//!
//! - [`HttpHistory`]: the lightweight summary row shown in a history table.
//!   Created when the request arrives, completed when the response leaves.
//! - [`HttpBody`]: the full raw request and response text, loaded only when
//!   an observer opens a single record.
//!
//! Both share the same surrogate `id`, which is assigned once at request
//! time and never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::{extract_extension, mime_category};

/// Summary of one proxied HTTP transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHistory {
    /// Surrogate id, monotonically increasing per process.
    pub id: i64,
    /// Flow identifier minted by the proxy engine.
    pub flow_id: String,
    /// Host (with port if one was given).
    pub host: String,
    /// Request method.
    pub method: String,
    /// Absolute request URL.
    pub full_url: String,
    /// Path and query.
    pub path: String,
    /// Response status code, once known.
    pub status: Option<u16>,
    /// Delivered response body length, once known.
    pub length: Option<u64>,
    /// Response Content-Type header.
    pub content_type: String,
    /// Coarse MIME category derived from the content type.
    pub mime_type: String,
    /// File extension derived from the path.
    pub extension: String,
    /// HTML page title, if any.
    pub title: String,
    /// Resolved IP of the host.
    pub ip: String,
    /// Free-form operator note.
    pub note: String,
    /// Operator highlight color.
    pub color: String,
    /// When the request was received.
    pub timestamp: DateTime<Utc>,
    /// When the response was received.
    pub response_timestamp: Option<DateTime<Utc>>,
}

/// Response-side facts used to complete a pending [`HttpHistory`].
#[derive(Debug, Clone, Default)]
pub struct ResponseFacts {
    pub status: u16,
    pub length: u64,
    pub content_type: String,
    pub title: String,
    pub ip: String,
}

impl HttpHistory {
    /// Creates a pending summary for a request that has just arrived.
    pub fn pending(
        id: i64,
        flow_id: impl Into<String>,
        method: impl Into<String>,
        full_url: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            flow_id: flow_id.into(),
            host: host.into(),
            method: method.into(),
            full_url: full_url.into(),
            path: path.into(),
            status: None,
            length: None,
            content_type: String::new(),
            mime_type: String::new(),
            extension: String::new(),
            title: String::new(),
            ip: String::new(),
            note: String::new(),
            color: String::new(),
            timestamp,
            response_timestamp: None,
        }
    }

    /// Rewrites the request identity after the user edited the request.
    pub fn apply_request_edit(
        &mut self,
        method: impl Into<String>,
        full_url: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
    ) {
        self.method = method.into();
        self.full_url = full_url.into();
        self.host = host.into();
        self.path = path.into();
    }

    /// Completes the summary with response-side facts.
    pub fn complete(mut self, facts: ResponseFacts, received_at: DateTime<Utc>) -> Self {
        self.mime_type = mime_category(&facts.content_type);
        self.extension = extract_extension(&self.path);
        self.status = Some(facts.status);
        self.length = Some(facts.length);
        self.content_type = facts.content_type;
        self.title = facts.title;
        self.ip = facts.ip;
        self.response_timestamp = Some(received_at);
        self
    }

    /// Returns true once the response side has been recorded.
    pub fn is_complete(&self) -> bool {
        self.response_timestamp.is_some()
    }

    /// Time between request and response, in milliseconds.
    pub fn duration_ms(&self) -> Option<f64> {
        self.response_timestamp
            .map(|at| (at - self.timestamp).num_microseconds().unwrap_or(0) as f64 / 1000.0)
    }
}

/// Full raw request and response text of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpBody {
    /// Same id as the matching [`HttpHistory`].
    pub id: i64,
    pub flow_id: String,
    pub title: String,
    pub target_url: String,
    /// Request exactly as it was sent upstream.
    pub request_raw: String,
    /// Response with its body decoded for readability.
    pub response_raw: String,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub server_duration_ms: f64,
}

impl HttpBody {
    /// Builds the raw record for a completed summary.
    pub fn for_history(
        history: &HttpHistory,
        request_raw: impl Into<String>,
        response_raw: impl Into<String>,
    ) -> Self {
        Self {
            id: history.id,
            flow_id: history.flow_id.clone(),
            title: history.title.clone(),
            target_url: history.full_url.clone(),
            request_raw: request_raw.into(),
            response_raw: response_raw.into(),
            response_timestamp: history.response_timestamp,
            server_duration_ms: history.duration_ms().unwrap_or(0.0),
        }
    }
}
