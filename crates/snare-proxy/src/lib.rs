//! Snare Proxy - intercepting MITM proxy pipeline.
//!
//! This crate drives every HTTP(S) transaction the proxy engine sees through
//! a fixed pipeline: record, optionally hold for an operator decision, run
//! registered processors, decode, record again and report to the observer.
//!
//! ## Features
//!
//! - Per-host certificates signed by an operator-supplied CA
//! - Host scope filtering (out-of-scope traffic passes through untouched)
//! - Request and response interception with forward, edit and drop
//! - Read-only and modifying processors for each direction
//! - gzip/deflate decoding with re-encoding of modified bodies
//! - Permanent history of summaries and raw request/response dumps
//! - Background janitor for transactions that never got a response
//!
//! ## Architecture
//!
//! ```text
//! Client ──► hudsucker ──► FlowHandler ──► Pipeline::on_request
//!                                              │
//!                      ┌───────────────────────┤
//!                      │ bypass                │ in scope
//!                      ▼                       ▼
//!                 Passthrough        FlowStore (pending) ──► Interceptor
//!                                                               │
//!                                         ┌─────────────────────┴──┐
//!                                         │ forward / edit         │ drop
//!                                         ▼                        ▼
//!                                 ProcessorRegistry            502 to client
//!                                         │
//!                                         ▼
//!                                     Upstream ──► Pipeline::on_response
//!                                                         │
//!                                                         ▼
//!                               FlowStore (permanent) + ProxyEvent::HttpHistory
//! ```

mod ca;
pub mod codec;
mod error;
mod events;
mod handler;
pub mod intercept;
mod janitor;
pub mod message;
mod pipeline;
pub mod processor;
mod proxy;
pub mod store;

pub use ca::{CaError, CaManager};
pub use codec::DecodedBody;
pub use error::{CodecError, ParseError, ProxyError, Result};
pub use events::EventSink;
pub use handler::{dropped_response, FlowHandler, DROPPED_HEADER};
pub use intercept::{InterceptOutcome, InterceptTimeoutPolicy, Interceptor};
pub use janitor::{CacheJanitor, DEFAULT_MAX_AGE, DEFAULT_SWEEP_PERIOD};
pub use message::ORIGINAL_ENCODING_HEADER;
pub use pipeline::{Pipeline, PipelineConfig};
pub use processor::{ProcessorMode, ProcessorRegistry, RequestProcessor, ResponseProcessor};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use store::{FlowStore, StoreCounts, SweepReport};

pub use snare_core::DEFAULT_PROXY_PORT;
