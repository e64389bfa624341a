//! Error types for the proxy.

use snare_core::Direction;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The transaction was dropped and must not be delivered.
    ///
    /// This is a normal outcome, not a fault.
    #[error("flow {flow_id} dropped at {direction}")]
    Dropped { flow_id: String, direction: Direction },

    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

impl ProxyError {
    /// Creates a drop error.
    pub fn dropped(flow_id: impl Into<String>, direction: Direction) -> Self {
        Self::Dropped {
            flow_id: flow_id.into(),
            direction,
        }
    }

    /// Returns true for a drop.
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }
}

/// CA loading error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Certificate or key file missing.
    #[error("CA file not found: {0}")]
    NotFound(String),

    /// Failed to read CA file.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate or key.
    #[error("Failed to parse CA: {0}")]
    Parse(String),
}

/// Error parsing a raw HTTP message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The head is not terminated by an empty line.
    #[error("incomplete message head")]
    Incomplete,

    /// httparse rejected the head.
    #[error("invalid message head: {0}")]
    Invalid(String),

    /// The head parsed but could not be turned into a message.
    #[error("invalid {field}: {value}")]
    Field { field: &'static str, value: String },
}

/// Body encoding error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Content coding not implemented.
    #[error("unsupported content encoding: {0}")]
    Unsupported(String),

    /// Corrupt compressed data, or an encoder failure.
    #[error("{encoding} codec failed: {source}")]
    Io {
        encoding: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
