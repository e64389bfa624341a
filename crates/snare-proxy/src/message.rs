//! Buffered HTTP messages: cloning, raw dumps and parsing edited text.
//!
//! The pipeline works on fully buffered `Request<Bytes>` / `Response<Bytes>`
//! values. Raw dumps are HTTP/1.1 text, the form shown to the user during
//! interception and kept in history.

use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

use crate::error::ParseError;

/// Marker header carried by readable response dumps whose wire body was
/// compressed. Removed when a dump is parsed back.
pub const ORIGINAL_ENCODING_HEADER: &str = "x-snare-original-encoding";

const MAX_HEADERS: usize = 128;

/// Deep copy of a buffered request: own header map, own body handle.
///
/// Extensions are not copied.
pub fn clone_request(req: &Request<Bytes>) -> Request<Bytes> {
    let mut out = Request::new(req.body().clone());
    *out.method_mut() = req.method().clone();
    *out.uri_mut() = req.uri().clone();
    *out.version_mut() = req.version();
    *out.headers_mut() = req.headers().clone();
    out
}

/// Deep copy of a buffered response. Extensions are not copied.
pub fn clone_response(res: &Response<Bytes>) -> Response<Bytes> {
    let mut out = Response::new(res.body().clone());
    *out.status_mut() = res.status();
    *out.version_mut() = res.version();
    *out.headers_mut() = res.headers().clone();
    out
}

/// Returns true if the message is framed with chunked transfer coding.
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Replaces any Transfer-Encoding with a Content-Length matching `len`.
///
/// A message that had no framing headers and an empty body is left
/// without a Content-Length.
pub fn sync_content_length(headers: &mut HeaderMap, len: usize) {
    let had_framing = headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING);
    headers.remove(TRANSFER_ENCODING);
    if len > 0 || had_framing {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    } else {
        headers.remove(CONTENT_LENGTH);
    }
}

/// Rewrites chunked framing into a fixed Content-Length once the body is
/// fully buffered.
pub fn normalize_request_framing(req: &mut Request<Bytes>) {
    if is_chunked(req.headers()) {
        let len = req.body().len();
        sync_content_length(req.headers_mut(), len);
    }
}

/// Returns a header as a string, or "" if absent or not visible ASCII.
pub fn header_str<'a>(headers: &'a HeaderMap, name: impl hyper::header::AsHeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Content-Type of a message, or "".
pub fn content_type(headers: &HeaderMap) -> &str {
    header_str(headers, CONTENT_TYPE)
}

/// Host of a request (with port if given): URI authority, then Host header.
pub fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.to_string();
    }
    header_str(req.headers(), HOST).to_string()
}

/// Path and query of a request.
pub fn request_path<B>(req: &Request<B>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Absolute URL of a request.
pub fn full_url<B>(req: &Request<B>) -> String {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }
    format!("http://{}{}", request_host(req), request_path(req))
}

fn version_label(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

fn push_headers(out: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
}

/// Dumps a request as HTTP/1.1 text with origin-form target.
pub fn dump_request(req: &Request<Bytes>) -> String {
    let mut out = format!(
        "{} {} {}\r\n",
        req.method(),
        request_path(req),
        version_label(req.version())
    );
    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            out.push_str(&format!("host: {}\r\n", authority));
        }
    }
    push_headers(&mut out, req.headers());
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(req.body()));
    out
}

/// Dumps a response as HTTP/1.1 text.
pub fn dump_response(res: &Response<Bytes>) -> String {
    let status = res.status();
    let mut out = format!(
        "{} {} {}\r\n",
        version_label(res.version()),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    push_headers(&mut out, res.headers());
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(res.body()));
    out
}

/// Splits raw text at the first empty line, normalizing head line endings
/// to CRLF. The body is returned verbatim. Text without an empty line is
/// all head.
fn split_raw(raw: &str) -> (String, &str) {
    let mut head = String::with_capacity(raw.len().min(8192));
    let mut rest = raw.trim_start_matches(['\r', '\n']);
    loop {
        match rest.split_once('\n') {
            Some((line, tail)) => {
                let line = line.strip_suffix('\r').unwrap_or(line);
                rest = tail;
                head.push_str(line);
                head.push_str("\r\n");
                if line.is_empty() {
                    return (head, rest);
                }
            }
            None => {
                let line = rest.strip_suffix('\r').unwrap_or(rest);
                if !line.is_empty() {
                    head.push_str(line);
                    head.push_str("\r\n");
                }
                head.push_str("\r\n");
                return (head, "");
            }
        }
    }
}

fn build_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| ParseError::Field {
            field: "header name",
            value: header.name.to_string(),
        })?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| ParseError::Field {
            field: "header value",
            value: String::from_utf8_lossy(header.value).into_owned(),
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn parsed_version(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn map_httparse<T>(status: httparse::Result<T>) -> Result<(), ParseError> {
    match status {
        Ok(httparse::Status::Complete(_)) => Ok(()),
        Ok(httparse::Status::Partial) => Err(ParseError::Incomplete),
        Err(e) => Err(ParseError::Invalid(e.to_string())),
    }
}

/// Parses user-edited request text.
///
/// An origin-form target is made absolute with the Host header, falling
/// back to `base`'s authority. The scheme comes from `base`. Everything
/// after the empty line is the body, and Content-Length is recomputed.
pub fn parse_request(raw: &str, base: &Uri) -> Result<Request<Bytes>, ParseError> {
    let (head, body) = split_raw(raw);
    let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut parsed_headers);
    map_httparse(parsed.parse(head.as_bytes()))?;

    let method_str = parsed.method.ok_or(ParseError::Incomplete)?;
    let method = Method::from_bytes(method_str.as_bytes()).map_err(|_| ParseError::Field {
        field: "method",
        value: method_str.to_string(),
    })?;
    let target = parsed.path.ok_or(ParseError::Incomplete)?;
    let mut headers = build_headers(parsed.headers)?;

    let uri_text = if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        let host = match header_str(&headers, HOST) {
            "" => base.authority().map(|a| a.to_string()).unwrap_or_default(),
            host => host.to_string(),
        };
        if host.is_empty() {
            return Err(ParseError::Field {
                field: "host",
                value: String::new(),
            });
        }
        let scheme = base.scheme_str().unwrap_or("http");
        format!("{}://{}{}", scheme, host, target)
    };
    let uri: Uri = uri_text.parse().map_err(|_| ParseError::Field {
        field: "target",
        value: uri_text.clone(),
    })?;

    let body = Bytes::copy_from_slice(body.as_bytes());
    sync_content_length(&mut headers, body.len());

    let mut req = Request::new(body);
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.version_mut() = parsed_version(parsed.version);
    *req.headers_mut() = headers;
    Ok(req)
}

/// Parses user-edited response text. The readable-dump marker is removed
/// and Content-Length is recomputed.
pub fn parse_response(raw: &str) -> Result<Response<Bytes>, ParseError> {
    let (head, body) = split_raw(raw);
    let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut parsed_headers);
    map_httparse(parsed.parse(head.as_bytes()))?;

    let code = parsed.code.ok_or(ParseError::Incomplete)?;
    let status = StatusCode::from_u16(code).map_err(|_| ParseError::Field {
        field: "status",
        value: code.to_string(),
    })?;
    let mut headers = build_headers(parsed.headers)?;
    headers.remove(ORIGINAL_ENCODING_HEADER);

    let body = Bytes::copy_from_slice(body.as_bytes());
    sync_content_length(&mut headers, body.len());

    let mut res = Response::new(body);
    *res.status_mut() = status;
    *res.version_mut() = parsed_version(parsed.version);
    *res.headers_mut() = headers;
    Ok(res)
}
