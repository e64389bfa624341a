//! Snare Core - Transaction records, observer events, scope and configuration.
//!
//! This crate holds the data model shared by the proxy pipeline and its
//! observers. It has no networking or async code.
//!
//! ## Modules
//!
//! - [`history`]: summary and raw records of proxied transactions
//! - [`event`]: events pushed to the observer, decisions and commands it sends back
//! - [`scope`]: include/exclude host filtering
//! - [`extract`]: derived fields (MIME category, extension, title)
//! - [`config`]: JSON file configuration
//!
//! ## Data Flow
//!
//! ```text
//! request ──► HttpHistory::pending ──► (intercept?) ──► response
//!                                                         │
//!                      ProxyEvent::HttpHistory ◄── HttpHistory::complete
//!                                                         │
//!                                                         ▼
//!                                                  HttpBody (raw dumps)
//! ```

pub mod config;
pub mod event;
pub mod extract;
pub mod history;
pub mod scope;

pub use config::{
    ConfigError, HistorySection, InterceptSection, JanitorSection, ProxySection, SnareConfig,
    DEFAULT_PROXY_PORT,
};
pub use event::{
    ControlCommand, Direction, InterceptAction, InterceptDecision, InterceptStats, ProxyEvent,
    UnknownAction,
};
pub use history::{HttpBody, HttpHistory, ResponseFacts};
pub use scope::{Scope, ScopeConfig, ScopeError, ScopeRule};
