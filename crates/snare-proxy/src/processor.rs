//! Processor registry.
//!
//! Features plug into the pipeline by registering request or response
//! processors. Each is tagged with a [`ProcessorMode`] at registration:
//!
//! - `Modifying` processors run in registration order on the live message
//!   and report whether they changed it.
//! - `ReadOnly` processors each get their own deep copy; their changes and
//!   return values are discarded.
//!
//! All `Modifying` processors finish before any `ReadOnly` one starts, so
//! read-only observers see the message exactly as it will be sent.

use std::fmt;
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::{Request, Response};
use parking_lot::RwLock;

use crate::message::{clone_request, clone_response};

/// Request processor. Returns true if it changed the request.
pub type RequestProcessor = Arc<dyn Fn(&mut Request<Bytes>) -> bool + Send + Sync>;

/// Response processor. Returns true if it changed the response.
pub type ResponseProcessor = Arc<dyn Fn(&mut Response<Bytes>) -> bool + Send + Sync>;

/// How a processor is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProcessorMode {
    /// Observes a private copy.
    #[default]
    ReadOnly,
    /// Mutates the live message.
    Modifying,
}

struct Entry<F> {
    processor: F,
    mode: ProcessorMode,
}

fn snapshot<F: Clone>(entries: &RwLock<Vec<Entry<F>>>, mode: ProcessorMode) -> Vec<F> {
    entries
        .read()
        .iter()
        .filter(|entry| entry.mode == mode)
        .map(|entry| entry.processor.clone())
        .collect()
}

/// Ordered request and response processor lists.
#[derive(Default)]
pub struct ProcessorRegistry {
    requests: RwLock<Vec<Entry<RequestProcessor>>>,
    responses: RwLock<Vec<Entry<ResponseProcessor>>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("requests", &self.requests.read().len())
            .field("responses", &self.responses.read().len())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request processor.
    pub fn register_request<F>(&self, processor: F, mode: ProcessorMode)
    where
        F: Fn(&mut Request<Bytes>) -> bool + Send + Sync + 'static,
    {
        self.requests.write().push(Entry {
            processor: Arc::new(processor),
            mode,
        });
    }

    /// Appends a response processor.
    pub fn register_response<F>(&self, processor: F, mode: ProcessorMode)
    where
        F: Fn(&mut Response<Bytes>) -> bool + Send + Sync + 'static,
    {
        self.responses.write().push(Entry {
            processor: Arc::new(processor),
            mode,
        });
    }

    /// Removes every processor.
    pub fn clear(&self) {
        self.requests.write().clear();
        self.responses.write().clear();
    }

    /// Number of registered (request, response) processors.
    pub fn len(&self) -> (usize, usize) {
        (self.requests.read().len(), self.responses.read().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }

    /// Runs the `Modifying` request processors on the live request.
    pub fn modify_request(&self, req: &mut Request<Bytes>) -> bool {
        let mut modified = false;
        for processor in snapshot(&self.requests, ProcessorMode::Modifying) {
            modified |= processor(req);
        }
        modified
    }

    /// Runs the `ReadOnly` request processors, each on its own copy.
    pub fn observe_request(&self, req: &Request<Bytes>) {
        for processor in snapshot(&self.requests, ProcessorMode::ReadOnly) {
            let mut copy = clone_request(req);
            processor(&mut copy);
        }
    }

    /// Runs the `Modifying` response processors on the live response.
    pub fn modify_response(&self, res: &mut Response<Bytes>) -> bool {
        let mut modified = false;
        for processor in snapshot(&self.responses, ProcessorMode::Modifying) {
            modified |= processor(res);
        }
        modified
    }

    /// Runs the `ReadOnly` response processors, each on its own copy.
    pub fn observe_response(&self, res: &Response<Bytes>) {
        for processor in snapshot(&self.responses, ProcessorMode::ReadOnly) {
            let mut copy = clone_response(res);
            processor(&mut copy);
        }
    }
}
