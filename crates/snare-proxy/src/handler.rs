//! hudsucker handler that feeds traffic through the [`Pipeline`].
//!
//! hudsucker clones the handler for every request and calls
//! `handle_response` on the same clone, so the flow id minted in
//! `handle_request` is carried on `self`.

use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::pipeline::Pipeline;

/// Header set on the synthetic response sent for a dropped transaction.
pub const DROPPED_HEADER: &str = "x-snare-dropped";

const DROPPED_BODY: &[u8] = b"Transaction dropped by snare\n";

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Reads a whole engine body. A read failure yields an empty body.
async fn buffer_body(body: Body) -> Bytes {
    match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("Failed to read body: {}", e);
            Bytes::new()
        }
    }
}

/// Response sent to the client instead of a dropped transaction.
///
/// hudsucker cannot abort a connection from a handler.
pub fn dropped_response() -> Response<Body> {
    let mut res = Response::new(bytes_to_body(Bytes::from_static(DROPPED_BODY)));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(DROPPED_HEADER, HeaderValue::from_static("true"));
    res
}

/// Per-connection handler.
#[derive(Clone)]
pub struct FlowHandler {
    pipeline: Arc<Pipeline>,
    flow_id: Option<String>,
}

impl std::fmt::Debug for FlowHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandler")
            .field("flow_id", &self.flow_id)
            .finish()
    }
}

impl FlowHandler {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            flow_id: None,
        }
    }

    /// Flow id of the request this clone is handling, if it was processed.
    pub fn flow_id(&self) -> Option<&str> {
        self.flow_id.as_deref()
    }

    fn failure_response(flow_id: &str, err: ProxyError) -> Response<Body> {
        if err.is_drop() {
            tracing::debug!("{}", err);
        } else {
            tracing::error!("Flow {} failed: {}", flow_id, err);
        }
        dropped_response()
    }
}

impl HttpHandler for FlowHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        if self.pipeline.bypasses(&req) {
            return RequestOrResponse::Request(req);
        }

        let flow_id = Uuid::new_v4().to_string();
        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, buffer_body(body).await);

        match self.pipeline.on_request(&flow_id, req).await {
            Ok(req) => {
                self.flow_id = Some(flow_id);
                let (parts, body) = req.into_parts();
                RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(body)))
            }
            Err(e) => RequestOrResponse::Response(Self::failure_response(&flow_id, e)),
        }
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        // Bypassed and dropped requests have no flow.
        let Some(flow_id) = self.flow_id.take() else {
            return res;
        };

        let (parts, body) = res.into_parts();
        let res = Response::from_parts(parts, buffer_body(body).await);

        match self.pipeline.on_response(&flow_id, res).await {
            Ok(res) => {
                let (parts, body) = res.into_parts();
                Response::from_parts(parts, bytes_to_body(body))
            }
            Err(e) => Self::failure_response(&flow_id, e),
        }
    }
}
