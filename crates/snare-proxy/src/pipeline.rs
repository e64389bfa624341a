//! Transaction lifecycle.
//!
//! [`Pipeline`] owns all shared state (flow store, processor registry,
//! interceptor, scope) and exposes the two callbacks the proxy engine calls
//! once per request and once per response of a flow.
//!
//! ## Request phase
//!
//! ```text
//! bypass? ──yes──► pass through untouched
//!    │ no
//!    ▼
//! fix framing ─► pending summary + raw dump ─► intercept ─► modifying
//!                                                │ drop       processors
//!                                                ▼               │
//!                                          purge, Err(Dropped)   ▼
//!                                                  re-dump raw ─► read-only
//!                                                                processors
//! ```
//!
//! ## Response phase
//!
//! ```text
//! intercept ─► modifying ─► decode ─► read-only ─► re-encode ─► record
//!    │ drop    processors             processors                  │
//!    ▼                                                            ▼
//! purge, Err(Dropped)                        HttpBody + ProxyEvent::HttpHistory
//! ```
//!
//! No lock is held across the intercept wait or while processors run.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hyper::body::Bytes;
use hyper::{Method, Request, Response};
use parking_lot::RwLock;
use snare_core::extract::{extract_title, split_host_port};
use snare_core::{
    ControlCommand, Direction, HttpBody, HttpHistory, InterceptDecision, InterceptStats,
    ProxyEvent, ResponseFacts, Scope, SnareConfig,
};
use tokio::sync::mpsc;

use crate::codec::DecodedBody;
use crate::error::{ProxyError, Result};
use crate::events::EventSink;
use crate::intercept::{InterceptOutcome, InterceptTimeoutPolicy, Interceptor};
use crate::janitor::{CacheJanitor, DEFAULT_MAX_AGE, DEFAULT_SWEEP_PERIOD};
use crate::message::{
    content_type, dump_request, dump_response, full_url, normalize_request_framing, parse_request,
    parse_response, request_host, request_path, sync_content_length,
};
use crate::processor::ProcessorRegistry;
use crate::store::FlowStore;

/// Upper bound on a host lookup for the history IP column.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pipeline policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// How long an intercepted transaction waits for a decision.
    pub intercept_timeout: Duration,
    /// What a timeout turns into.
    pub timeout_policy: InterceptTimeoutPolicy,
    /// How long a decision submission may wait for its slot.
    pub decision_send_timeout: Duration,
    pub janitor_period: Duration,
    pub janitor_max_age: Duration,
    /// Observer channel capacity.
    pub event_capacity: usize,
    /// Resolve host IPs for history rows.
    pub resolve_ip: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intercept_timeout: Duration::from_secs(5 * 60),
            timeout_policy: InterceptTimeoutPolicy::FailOpen,
            decision_send_timeout: Duration::from_secs(2),
            janitor_period: DEFAULT_SWEEP_PERIOD,
            janitor_max_age: DEFAULT_MAX_AGE,
            event_capacity: 1024,
            resolve_ip: true,
        }
    }
}

impl PipelineConfig {
    /// Builds the policies from file configuration.
    pub fn from_settings(config: &SnareConfig) -> Self {
        Self {
            intercept_timeout: Duration::from_secs(config.intercept.timeout_secs),
            timeout_policy: config.intercept.on_timeout.into(),
            decision_send_timeout: Duration::from_secs(config.intercept.decision_send_timeout_secs),
            janitor_period: Duration::from_secs(config.janitor.period_secs),
            janitor_max_age: Duration::from_secs(config.janitor.max_age_secs),
            event_capacity: config.history.event_capacity,
            resolve_ip: config.history.resolve_ip,
        }
    }

    /// Sets the intercept timeout.
    pub fn with_intercept_timeout(mut self, timeout: Duration) -> Self {
        self.intercept_timeout = timeout;
        self
    }

    /// Sets the timeout policy.
    pub fn with_timeout_policy(mut self, policy: InterceptTimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Sets the decision send timeout.
    pub fn with_decision_send_timeout(mut self, timeout: Duration) -> Self {
        self.decision_send_timeout = timeout;
        self
    }

    /// Sets the janitor period and max age.
    pub fn with_janitor(mut self, period: Duration, max_age: Duration) -> Self {
        self.janitor_period = period;
        self.janitor_max_age = max_age;
        self
    }

    /// Sets the observer channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Enables or disables IP resolution.
    pub fn with_resolve_ip(mut self, resolve_ip: bool) -> Self {
        self.resolve_ip = resolve_ip;
        self
    }
}

/// The transaction pipeline.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<FlowStore>,
    processors: ProcessorRegistry,
    interceptor: Interceptor,
    scope: RwLock<Scope>,
    events: EventSink,
}

impl Pipeline {
    /// Creates a pipeline and the receiver for its observer events.
    pub fn new(config: PipelineConfig) -> (Arc<Self>, mpsc::Receiver<ProxyEvent>) {
        let (events, rx) = EventSink::channel(config.event_capacity);
        let interceptor = Interceptor::new(
            events.clone(),
            config.intercept_timeout,
            config.decision_send_timeout,
            config.timeout_policy,
        );
        let pipeline = Self {
            config,
            store: Arc::new(FlowStore::new()),
            processors: ProcessorRegistry::new(),
            interceptor,
            scope: RwLock::new(Scope::allow_all()),
            events,
        };
        (Arc::new(pipeline), rx)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    /// Register processors here.
    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Replaces the host scope.
    pub fn set_scope(&self, scope: Scope) {
        *self.scope.write() = scope;
    }

    pub fn set_intercept(&self, direction: Direction, enabled: bool) {
        self.interceptor.set_enabled(direction, enabled);
    }

    /// Resolves a pending intercept. See [`Interceptor::submit_decision`].
    pub async fn submit_decision(&self, decision: InterceptDecision) -> bool {
        self.interceptor.submit_decision(decision).await
    }

    pub fn stats(&self) -> InterceptStats {
        self.interceptor.stats()
    }

    /// Drops every recorded transaction. Flows in progress are unaffected.
    pub fn clear_history(&self) {
        self.store.clear_permanent();
        tracing::info!("History cleared");
    }

    /// Applies an operator command.
    pub async fn handle_command(&self, command: ControlCommand) {
        match command {
            ControlCommand::Decision(decision) => {
                self.submit_decision(decision).await;
            }
            ControlCommand::Intercept { direction, enabled } => {
                self.set_intercept(direction, enabled);
            }
            ControlCommand::Clear => self.clear_history(),
            ControlCommand::Stats => {
                self.events
                    .emit(ProxyEvent::InterceptStats(self.stats()))
                    .await;
            }
            ControlCommand::ResetStats => {
                self.interceptor.reset_stats();
                tracing::info!("Intercept stats reset");
            }
        }
    }

    /// Spawns the cache janitor for this pipeline's store.
    pub fn spawn_janitor(&self) -> tokio::task::JoinHandle<()> {
        CacheJanitor::new(self.config.janitor_period, self.config.janitor_max_age)
            .spawn(self.store.clone())
    }

    /// Returns true if a request is left alone entirely: tunnels, preflights
    /// and out-of-scope hosts.
    pub fn bypasses<B>(&self, req: &Request<B>) -> bool {
        if req.method() == Method::CONNECT || req.method() == Method::OPTIONS {
            return true;
        }
        self.scope.read().is_filtered(&request_host(req))
    }

    // ==================== Request phase ====================

    /// Request callback. Returns the request to send upstream, or
    /// [`ProxyError::Dropped`] if it must not be sent.
    pub async fn on_request(&self, flow_id: &str, mut req: Request<Bytes>) -> Result<Request<Bytes>> {
        if self.bypasses(&req) {
            return Ok(req);
        }

        normalize_request_framing(&mut req);

        let id = self.store.next_id();
        let summary = HttpHistory::pending(
            id,
            flow_id,
            req.method().as_str(),
            full_url(&req),
            request_host(&req),
            request_path(&req),
            Utc::now(),
        );
        self.store.put_summary(flow_id, summary);
        let raw = dump_request(&req);
        self.store.put_raw_request(flow_id, raw.clone());

        let event = ProxyEvent::InterceptRequest {
            id: flow_id.to_string(),
            data: raw.clone(),
        };
        match self.interceptor.wait(flow_id, Direction::Request, event).await {
            InterceptOutcome::Drop => {
                self.store.purge_flow(flow_id);
                tracing::info!("Dropped request {} {}", flow_id, full_url(&req));
                return Err(ProxyError::dropped(flow_id, Direction::Request));
            }
            // Dumps are lossy for non-UTF-8 bodies; an untouched dump keeps the original.
            InterceptOutcome::Forward(Some(edited)) if edited != raw => {
                req = self.apply_request_edit(flow_id, req, &edited);
            }
            InterceptOutcome::Forward(_) | InterceptOutcome::TimedOut | InterceptOutcome::Skipped => {}
        }

        if self.processors.modify_request(&mut req) {
            let len = req.body().len();
            sync_content_length(req.headers_mut(), len);
        }

        self.store.put_raw_request(flow_id, dump_request(&req));

        self.processors.observe_request(&req);
        Ok(req)
    }

    fn apply_request_edit(&self, flow_id: &str, req: Request<Bytes>, edited: &str) -> Request<Bytes> {
        match parse_request(edited, req.uri()) {
            Ok(mut edited) => {
                *edited.version_mut() = req.version();
                let method = edited.method().to_string();
                let url = full_url(&edited);
                let host = request_host(&edited);
                let path = request_path(&edited);
                self.store.update_summary(flow_id, |summary| {
                    summary.apply_request_edit(method, url, host, path)
                });
                self.store.put_raw_request(flow_id, dump_request(&edited));
                tracing::debug!("Flow {} forwarded with edited request", flow_id);
                edited
            }
            Err(e) => {
                tracing::warn!(
                    "Edited request for flow {} does not parse, forwarding original: {}",
                    flow_id,
                    e
                );
                req
            }
        }
    }

    // ==================== Response phase ====================

    /// Response callback. Returns the response to deliver to the client, or
    /// [`ProxyError::Dropped`] if it must not be delivered.
    pub async fn on_response(&self, flow_id: &str, mut res: Response<Bytes>) -> Result<Response<Bytes>> {
        let mut modified = false;

        if self.interceptor.is_enabled(Direction::Response) {
            match self.store.peek_raw_request(flow_id) {
                Some(request) => {
                    let readable = DecodedBody::decode(res.headers(), res.body().clone()).readable(&res);
                    let shown = dump_response(&readable);
                    let event = ProxyEvent::InterceptResponse {
                        id: flow_id.to_string(),
                        request,
                        response: shown.clone(),
                    };
                    match self.interceptor.wait(flow_id, Direction::Response, event).await {
                        InterceptOutcome::Drop => {
                            self.store.purge_flow(flow_id);
                            tracing::info!("Dropped response for flow {}", flow_id);
                            return Err(ProxyError::dropped(flow_id, Direction::Response));
                        }
                        InterceptOutcome::Forward(Some(edited)) if edited != shown => match parse_response(&edited) {
                            Ok(mut edited) => {
                                *edited.version_mut() = res.version();
                                res = edited;
                                modified = true;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "Edited response for flow {} does not parse, forwarding original: {}",
                                    flow_id,
                                    e
                                );
                            }
                        },
                        InterceptOutcome::Forward(_)
                        | InterceptOutcome::TimedOut
                        | InterceptOutcome::Skipped => {}
                    }
                }
                None => {
                    tracing::debug!("No pending request for flow {}, not intercepting response", flow_id);
                }
            }
        }

        modified |= self.processors.modify_response(&mut res);

        let mut body = DecodedBody::decode(res.headers(), res.body().clone());
        let readable = body.readable(&res);
        self.processors.observe_response(&readable);

        if modified {
            body.mark_modified();
        }
        body.apply_to(&mut res);

        self.record(flow_id, &res, &readable, &body).await;
        Ok(res)
    }

    /// Completes and persists the transaction, then notifies the observer.
    async fn record(
        &self,
        flow_id: &str,
        res: &Response<Bytes>,
        readable: &Response<Bytes>,
        body: &DecodedBody,
    ) {
        let Some((summary, request_raw)) = self.store.take_pending(flow_id) else {
            tracing::debug!("No pending transaction for flow {}, not recording", flow_id);
            return;
        };

        let content_type = content_type(res.headers()).to_string();
        let title = if body.is_text {
            extract_title(&body.text(), &content_type)
        } else {
            String::new()
        };
        let ip = if self.config.resolve_ip {
            resolve_ip(&summary.host).await
        } else {
            String::new()
        };

        let history = summary.complete(
            ResponseFacts {
                status: res.status().as_u16(),
                length: res.body().len() as u64,
                content_type,
                title,
                ip,
            },
            Utc::now(),
        );
        self.store
            .store_permanent(HttpBody::for_history(&history, request_raw, dump_response(readable)));

        tracing::debug!(
            "Recorded #{} {} {} -> {}",
            history.id,
            history.method,
            history.full_url,
            res.status()
        );
        self.events.emit(ProxyEvent::HttpHistory(history)).await;
    }
}

/// Resolves a host for display. Literal IPs are returned as-is, IPv4 is
/// preferred, and failures yield "".
async fn resolve_ip(host: &str) -> String {
    let (hostname, _) = split_host_port(host);
    if hostname.is_empty() {
        return String::new();
    }
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return ip.to_string();
    }

    match tokio::time::timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host((hostname, 0))).await {
        Ok(Ok(addrs)) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first())
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default()
        }
        Ok(Err(e)) => {
            tracing::debug!("Failed to resolve {}: {}", hostname, e);
            String::new()
        }
        Err(_) => {
            tracing::debug!("Timed out resolving {}", hostname);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::processor::ProcessorMode;
    use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
    use hyper::{StatusCode, Uri};
    use parking_lot::Mutex;
    use snare_core::{ScopeConfig, ScopeRule};

    fn setup() -> (Arc<Pipeline>, mpsc::Receiver<ProxyEvent>) {
        Pipeline::new(PipelineConfig::default().with_resolve_ip(false))
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder()
            .uri(uri)
            .header(HOST, "example.com")
            .body(Bytes::new())
            .unwrap()
    }

    fn ok(content_type: &str, body: &'static [u8]) -> Response<Bytes> {
        Response::builder()
            .status(200)
            .header(CONTENT_TYPE, content_type)
            .body(Bytes::from_static(body))
            .unwrap()
    }

    fn gzip_ok(text: &[u8]) -> Response<Bytes> {
        Response::builder()
            .status(200)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .header(CONTENT_ENCODING, "gzip")
            .body(Bytes::from(codec::encode("gzip", text).unwrap()))
            .unwrap()
    }

    fn rewrite_a_to_b(req: &mut Request<Bytes>) -> bool {
        if req.uri().path() != "/a" {
            return false;
        }
        *req.uri_mut() = Uri::from_static("http://example.com/b");
        true
    }

    async fn next_history(rx: &mut mpsc::Receiver<ProxyEvent>) -> HttpHistory {
        loop {
            match rx.recv().await {
                Some(ProxyEvent::HttpHistory(history)) => return history,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    // ==================== Normal completion ====================

    #[tokio::test]
    async fn completed_flow_is_recorded_exactly_once() {
        let (pipeline, mut rx) = setup();

        let req = pipeline.on_request("f1", get("http://example.com/index.html")).await.unwrap();
        assert_eq!(pipeline.store().counts().pending_summaries, 1);
        assert_eq!(req.uri().path(), "/index.html");

        let res = ok("text/html", b"<html><title>Home</title></html>");
        pipeline.on_response("f1", res).await.unwrap();

        let history = next_history(&mut rx).await;
        assert_eq!(history.flow_id, "f1");
        assert_eq!(history.status, Some(200));
        assert_eq!(history.title, "Home");
        assert_eq!(history.mime_type, "html");
        assert_eq!(history.extension, "html");
        assert!(history.is_complete());

        let counts = pipeline.store().counts();
        assert_eq!(counts.pending_summaries, 0);
        assert_eq!(counts.pending_raw_requests, 0);
        assert_eq!(counts.permanent, 1);

        let body = pipeline.store().body(history.id).unwrap();
        assert_eq!(body.id, history.id);
        assert!(body.request_raw.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(body.response_raw.ends_with("<html><title>Home</title></html>"));
        assert_eq!(
            pipeline.store().id_for_url("http://example.com/index.html"),
            Some(history.id)
        );

        // a duplicate response callback records nothing more
        pipeline.on_response("f1", ok("text/plain", b"again")).await.unwrap();
        assert_eq!(pipeline.store().counts().permanent, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ids_increase_across_flows() {
        let (pipeline, mut rx) = setup();
        for flow in ["a", "b"] {
            pipeline.on_request(flow, get("http://example.com/")).await.unwrap();
            pipeline.on_response(flow, ok("text/plain", b"x")).await.unwrap();
        }
        let first = next_history(&mut rx).await;
        let second = next_history(&mut rx).await;
        assert!(second.id > first.id);
    }

    // ==================== Processor ordering ====================

    #[tokio::test]
    async fn read_only_observes_rewritten_request() {
        let (pipeline, _rx) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = seen.clone();
        pipeline.processors().register_request(
            move |req: &mut Request<Bytes>| {
                seen_inner.lock().push(req.uri().path().to_string());
                false
            },
            ProcessorMode::ReadOnly,
        );
        pipeline
            .processors()
            .register_request(rewrite_a_to_b, ProcessorMode::Modifying);

        let req = pipeline.on_request("f1", get("http://example.com/a")).await.unwrap();
        assert_eq!(req.uri().path(), "/b");
        assert_eq!(*seen.lock(), vec!["/b".to_string()]);

        let raw = pipeline.store().peek_raw_request("f1").unwrap();
        assert!(raw.starts_with("GET /b HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn modified_request_body_updates_length() {
        let (pipeline, _rx) = setup();
        pipeline.processors().register_request(
            |req: &mut Request<Bytes>| {
                *req.body_mut() = Bytes::from_static(b"longer body");
                true
            },
            ProcessorMode::Modifying,
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri("http://example.com/submit")
            .header(TRANSFER_ENCODING, "chunked")
            .body(Bytes::from_static(b"short"))
            .unwrap();

        let req = pipeline.on_request("f1", req).await.unwrap();
        assert_eq!(req.headers()[CONTENT_LENGTH], "11");
        assert!(!req.headers().contains_key(TRANSFER_ENCODING));
    }

    #[tokio::test]
    async fn read_only_response_processor_sees_decoded_body() {
        let (pipeline, _rx) = setup();
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_inner = seen.clone();
        pipeline.processors().register_response(
            move |res: &mut Response<Bytes>| {
                *seen_inner.lock() = String::from_utf8_lossy(res.body()).into_owned();
                false
            },
            ProcessorMode::ReadOnly,
        );

        pipeline.on_request("f1", get("http://example.com/")).await.unwrap();
        pipeline.on_response("f1", gzip_ok(b"<p>hello</p>")).await.unwrap();
        assert_eq!(*seen.lock(), "<p>hello</p>");
    }

    // ==================== Codec ====================

    #[tokio::test]
    async fn unmodified_gzip_response_is_byte_identical() {
        let (pipeline, mut rx) = setup();
        let res = gzip_ok(b"<title>Zipped</title>");
        let wire = res.body().clone();

        pipeline.on_request("f1", get("http://example.com/")).await.unwrap();
        let delivered = pipeline.on_response("f1", res).await.unwrap();
        assert_eq!(delivered.body(), &wire);
        assert_eq!(delivered.headers()[CONTENT_ENCODING], "gzip");

        let history = next_history(&mut rx).await;
        assert_eq!(history.title, "Zipped");
        let body = pipeline.store().body(history.id).unwrap();
        assert!(body.response_raw.contains("x-snare-original-encoding: gzip\r\n"));
        assert!(!body.response_raw.contains("content-encoding"));
        assert!(body.response_raw.ends_with("<title>Zipped</title>"));
    }

    #[tokio::test]
    async fn modified_gzip_response_decompresses_to_new_content() {
        let (pipeline, _rx) = setup();
        pipeline.processors().register_response(
            |res: &mut Response<Bytes>| {
                match codec::encode("gzip", b"<p>modified</p>") {
                    Ok(packed) => {
                        *res.body_mut() = Bytes::from(packed);
                        true
                    }
                    Err(_) => false,
                }
            },
            ProcessorMode::Modifying,
        );

        pipeline.on_request("f1", get("http://example.com/")).await.unwrap();
        let delivered = pipeline.on_response("f1", gzip_ok(b"<p>original</p>")).await.unwrap();
        assert_eq!(
            codec::decode("gzip", delivered.body()).unwrap(),
            b"<p>modified</p>"
        );
        assert_eq!(
            delivered.headers()[CONTENT_LENGTH],
            delivered.body().len().to_string().as_str()
        );
    }

    #[tokio::test]
    async fn head_response_framing_is_forwarded_unchanged() {
        let (pipeline, mut rx) = setup();
        let req = Request::builder()
            .method(Method::HEAD)
            .uri("http://example.com/big.bin")
            .header(HOST, "example.com")
            .body(Bytes::new())
            .unwrap();
        pipeline.on_request("f1", req).await.unwrap();

        let res = Response::builder()
            .status(200)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, "123456")
            .body(Bytes::new())
            .unwrap();
        let delivered = pipeline.on_response("f1", res).await.unwrap();
        assert_eq!(delivered.headers()[CONTENT_LENGTH], "123456");

        let history = next_history(&mut rx).await;
        assert_eq!(history.method, "HEAD");
    }

    #[tokio::test]
    async fn not_modified_response_is_forwarded_unchanged() {
        let (pipeline, _rx) = setup();
        pipeline.on_request("f1", get("http://example.com/")).await.unwrap();

        let res = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(CONTENT_TYPE, "text/html")
            .header(CONTENT_LENGTH, "512")
            .body(Bytes::new())
            .unwrap();
        let delivered = pipeline.on_response("f1", res).await.unwrap();
        assert_eq!(delivered.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(delivered.headers()[CONTENT_LENGTH], "512");
    }

    // ==================== Scope ====================

    #[tokio::test]
    async fn filtered_host_is_passed_through_untouched() {
        let (pipeline, mut rx) = setup();
        let scope = Scope::compile(&ScopeConfig {
            include: vec![],
            exclude: vec![ScopeRule::host("example.com")],
        })
        .unwrap();
        pipeline.set_scope(scope);
        pipeline
            .processors()
            .register_request(rewrite_a_to_b, ProcessorMode::Modifying);
        pipeline.set_intercept(Direction::Request, true);

        let req = Request::builder()
            .method(Method::POST)
            .uri("http://example.com/a")
            .header(TRANSFER_ENCODING, "chunked")
            .body(Bytes::from_static(b"data"))
            .unwrap();
        let req = pipeline.on_request("f1", req).await.unwrap();

        assert_eq!(req.uri().path(), "/a");
        assert!(req.headers().contains_key(TRANSFER_ENCODING));
        assert_eq!(pipeline.store().counts().pending_summaries, 0);
        assert_eq!(pipeline.store().next_id(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_and_options_bypass() {
        let (pipeline, _rx) = setup();
        for method in [Method::CONNECT, Method::OPTIONS] {
            let req = Request::builder()
                .method(method)
                .uri("http://example.com/")
                .body(Bytes::new())
                .unwrap();
            assert!(pipeline.bypasses(&req));
            pipeline.on_request("f1", req).await.unwrap();
        }
        assert_eq!(pipeline.store().counts().pending_summaries, 0);
    }

    // ==================== Interception ====================

    #[tokio::test(start_paused = true)]
    async fn request_drop_purges_and_response_records_nothing() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Request, true);

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_request("f3", get("http://example.com/a")).await })
        };
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ProxyEvent::InterceptRequest { ref id, .. } if id == "f3"));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(pipeline.submit_decision(InterceptDecision::drop("f3")).await);

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_drop());
        assert_eq!(pipeline.store().counts().pending_summaries, 0);
        assert_eq!(pipeline.store().counts().pending_raw_requests, 0);

        let res = pipeline.on_response("f3", ok("text/plain", b"late")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(pipeline.store().counts().permanent, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn response_drop_purges() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Response, true);
        pipeline.on_request("f1", get("http://example.com/")).await.unwrap();

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_response("f1", ok("text/plain", b"secret")).await })
        };
        match rx.recv().await.unwrap() {
            ProxyEvent::InterceptResponse { id, request, response } => {
                assert_eq!(id, "f1");
                assert!(request.starts_with("GET / HTTP/1.1"));
                assert!(response.ends_with("secret"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        pipeline.submit_decision(InterceptDecision::drop("f1")).await;

        assert!(task.await.unwrap().unwrap_err().is_drop());
        assert_eq!(pipeline.store().counts(), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_forwards_original() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Response, true);
        pipeline.on_request("f2", get("http://example.com/")).await.unwrap();

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let res = Response::builder()
                    .status(404)
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Bytes::from_static(b"not here"))
                    .unwrap();
                pipeline.on_response("f2", res).await
            })
        };
        assert!(matches!(
            rx.recv().await.unwrap(),
            ProxyEvent::InterceptResponse { .. }
        ));

        let started = tokio::time::Instant::now();
        let res = task.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.body().as_ref(), b"not here");

        let history = next_history(&mut rx).await;
        assert_eq!(history.status, Some(404));
        assert_eq!(pipeline.stats().intercepted_responses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_fails_closed_when_configured() {
        let (pipeline, mut rx) = Pipeline::new(
            PipelineConfig::default()
                .with_resolve_ip(false)
                .with_intercept_timeout(Duration::from_secs(10))
                .with_timeout_policy(InterceptTimeoutPolicy::FailClosed),
        );
        pipeline.set_intercept(Direction::Request, true);

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_request("f1", get("http://example.com/")).await })
        };
        rx.recv().await.unwrap();
        assert!(task.await.unwrap().unwrap_err().is_drop());
        assert_eq!(pipeline.store().counts().pending_summaries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn edited_request_is_sent_and_recorded() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Request, true);

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_request("f1", get("http://example.com/a")).await })
        };
        rx.recv().await.unwrap();
        let edited = "POST /edited?x=1 HTTP/1.1\nHost: example.com\nContent-Type: text/plain\n\nnew body";
        pipeline
            .submit_decision(InterceptDecision::forward_modified("f1", edited))
            .await;

        let req = task.await.unwrap().unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().to_string(), "http://example.com/edited?x=1");
        assert_eq!(req.body().as_ref(), b"new body");

        pipeline.on_response("f1", ok("text/plain", b"done")).await.unwrap();
        let history = next_history(&mut rx).await;
        assert_eq!(history.method, "POST");
        assert_eq!(history.path, "/edited?x=1");
        let body = pipeline.store().body(history.id).unwrap();
        assert!(body.request_raw.starts_with("POST /edited?x=1 HTTP/1.1\r\n"));
        assert!(body.request_raw.ends_with("new body"));
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_edit_forwards_original() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Request, true);

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_request("f1", get("http://example.com/a")).await })
        };
        rx.recv().await.unwrap();
        pipeline
            .submit_decision(InterceptDecision::forward_modified("f1", "definitely not http"))
            .await;

        let req = task.await.unwrap().unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().path(), "/a");
    }

    #[tokio::test(start_paused = true)]
    async fn untouched_dump_keeps_binary_request_body() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Request, true);

        let payload: &'static [u8] = &[0xff, 0xfe, 0x00, 0xc4, 0xe3];
        let req = Request::builder()
            .method(Method::POST)
            .uri("http://example.com/upload")
            .header(HOST, "example.com")
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, "5")
            .body(Bytes::from_static(payload))
            .unwrap();
        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_request("f1", req).await })
        };
        let shown = match rx.recv().await.unwrap() {
            ProxyEvent::InterceptRequest { data, .. } => data,
            other => panic!("unexpected event {:?}", other),
        };
        pipeline
            .submit_decision(InterceptDecision::forward_modified("f1", shown))
            .await;

        let req = task.await.unwrap().unwrap();
        assert_eq!(req.body().as_ref(), payload);
        assert_eq!(req.headers()[CONTENT_LENGTH], "5");
    }

    #[tokio::test(start_paused = true)]
    async fn untouched_dump_keeps_binary_response_body() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Response, true);
        pipeline.on_request("f1", get("http://example.com/page")).await.unwrap();

        let payload: &'static [u8] = &[0xb0, 0xa1, 0xc4, 0xe3, 0xba, 0xc3];
        let res = Response::builder()
            .status(200)
            .header(CONTENT_TYPE, "text/html; charset=gbk")
            .header(CONTENT_LENGTH, "6")
            .body(Bytes::from_static(payload))
            .unwrap();
        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_response("f1", res).await })
        };
        let shown = match rx.recv().await.unwrap() {
            ProxyEvent::InterceptResponse { response, .. } => response,
            other => panic!("unexpected event {:?}", other),
        };
        pipeline
            .submit_decision(InterceptDecision::forward_modified("f1", shown))
            .await;

        let res = task.await.unwrap().unwrap();
        assert_eq!(res.body().as_ref(), payload);
        assert_eq!(res.headers()[CONTENT_LENGTH], "6");
    }

    #[tokio::test(start_paused = true)]
    async fn edited_response_is_delivered() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Response, true);
        pipeline.on_request("f1", get("http://example.com/")).await.unwrap();

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_response("f1", gzip_ok(b"<p>original</p>")).await })
        };
        let response = match rx.recv().await.unwrap() {
            ProxyEvent::InterceptResponse { response, .. } => response,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(response.ends_with("<p>original</p>"));

        let edited = response.replace("<p>original</p>", "<p>edited!!</p>");
        pipeline
            .submit_decision(InterceptDecision::forward_modified("f1", edited))
            .await;

        let res = task.await.unwrap().unwrap();
        assert_eq!(res.body().as_ref(), b"<p>edited!!</p>");
        assert!(!res.headers().contains_key(CONTENT_ENCODING));
        assert_eq!(res.headers()[CONTENT_LENGTH], "15");
    }

    #[tokio::test]
    async fn orphan_response_is_delivered_without_record() {
        let (pipeline, mut rx) = setup();
        let res = pipeline.on_response("ghost", ok("text/plain", b"hi")).await.unwrap();
        assert_eq!(res.body().as_ref(), b"hi");
        assert_eq!(pipeline.store().counts().permanent, 0);
        assert!(rx.try_recv().is_err());
    }

    // ==================== Commands ====================

    #[tokio::test]
    async fn commands_toggle_clear_and_report() {
        let (pipeline, mut rx) = setup();
        pipeline.on_request("f1", get("http://example.com/")).await.unwrap();
        pipeline.on_response("f1", ok("text/plain", b"x")).await.unwrap();
        next_history(&mut rx).await;

        pipeline
            .handle_command(ControlCommand::Intercept {
                direction: Direction::Response,
                enabled: true,
            })
            .await;
        assert!(pipeline.interceptor().is_enabled(Direction::Response));

        pipeline.handle_command(ControlCommand::Clear).await;
        assert_eq!(pipeline.store().counts().permanent, 0);

        pipeline.handle_command(ControlCommand::Stats).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            ProxyEvent::InterceptStats(InterceptStats::default())
        );

        // nothing is waiting, so the decision is discarded
        pipeline
            .handle_command(ControlCommand::Decision(InterceptDecision::forward("nope")))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn reset_stats_command_zeroes_counters() {
        let (pipeline, mut rx) = setup();
        pipeline.set_intercept(Direction::Request, true);

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_request("f1", get("http://example.com/")).await })
        };
        assert!(matches!(
            rx.recv().await,
            Some(ProxyEvent::InterceptRequest { .. })
        ));
        pipeline.submit_decision(InterceptDecision::forward("f1")).await;
        task.await.unwrap().unwrap();

        assert_eq!(pipeline.stats().intercepted_requests, 1);
        assert_eq!(pipeline.stats().forwarded, 1);

        pipeline.handle_command(ControlCommand::ResetStats).await;
        assert_eq!(pipeline.stats(), InterceptStats::default());
    }

    // ==================== Config ====================

    #[test]
    fn config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.intercept_timeout, Duration::from_secs(300));
        assert_eq!(config.timeout_policy, InterceptTimeoutPolicy::FailOpen);
        assert_eq!(config.decision_send_timeout, Duration::from_secs(2));
        assert_eq!(config.janitor_period, Duration::from_secs(300));
        assert_eq!(config.janitor_max_age, Duration::from_secs(600));
        assert_eq!(config.event_capacity, 1024);
        assert!(config.resolve_ip);
    }

    #[test]
    fn config_from_settings() {
        let mut settings = SnareConfig::default();
        settings.intercept.timeout_secs = 30;
        settings.intercept.on_timeout = snare_core::InterceptAction::Drop;
        settings.history.resolve_ip = false;
        let config = PipelineConfig::from_settings(&settings);
        assert_eq!(config.intercept_timeout, Duration::from_secs(30));
        assert_eq!(config.timeout_policy, InterceptTimeoutPolicy::FailClosed);
        assert!(!config.resolve_ip);
    }

    #[tokio::test]
    async fn literal_ip_is_not_looked_up() {
        assert_eq!(resolve_ip("10.1.2.3:8080").await, "10.1.2.3");
        assert_eq!(resolve_ip("[::1]:443").await, "::1");
        assert_eq!(resolve_ip("").await, "");
    }
}
