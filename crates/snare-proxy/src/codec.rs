//! Response body content-coding.
//!
//! Bodies are decoded once for display, title extraction and read-only
//! processors, then restored on the way out. An unmodified body is sent as
//! the exact bytes that came off the wire; a modified one is re-encoded.

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_ENCODING};
use hyper::{HeaderMap, Response};
use snare_core::extract::is_text_content;

use crate::error::CodecError;
use crate::message::{clone_response, content_type, sync_content_length, ORIGINAL_ENCODING_HEADER};

/// Splits a Content-Encoding value into lower-cased codings, in the order
/// they were applied. `identity` is skipped.
pub fn codings(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty() && c != "identity")
        .collect()
}

fn io_error(encoding: &str) -> impl FnOnce(std::io::Error) -> CodecError + '_ {
    move |source| CodecError::Io {
        encoding: encoding.to_string(),
        source,
    }
}

fn decode_one(coding: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    match coding {
        "gzip" | "x-gzip" => {
            MultiGzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(io_error(coding))?;
        }
        "deflate" => {
            // Servers disagree on whether "deflate" means zlib or raw DEFLATE.
            if ZlibDecoder::new(data).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(io_error(coding))?;
            }
        }
        other => return Err(CodecError::Unsupported(other.to_string())),
    }
    Ok(out)
}

fn encode_one(coding: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    match coding {
        "gzip" | "x-gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).map_err(io_error(coding))?;
            encoder.finish().map_err(io_error(coding))
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).map_err(io_error(coding))?;
            encoder.finish().map_err(io_error(coding))
        }
        other => Err(CodecError::Unsupported(other.to_string())),
    }
}

/// Decodes `data` according to a full Content-Encoding value.
pub fn decode(encoding: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut buf = data.to_vec();
    for coding in codings(encoding).iter().rev() {
        buf = decode_one(coding, &buf)?;
    }
    Ok(buf)
}

/// Encodes `data` according to a full Content-Encoding value.
pub fn encode(encoding: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut buf = data.to_vec();
    for coding in codings(encoding).iter() {
        buf = encode_one(coding, &buf)?;
    }
    Ok(buf)
}

/// A response body in its canonical decoded form, plus what is needed to
/// restore the wire form.
#[derive(Debug, Clone)]
pub struct DecodedBody {
    /// Decoded content, or the wire bytes if nothing was decoded.
    pub content: Bytes,
    /// Content-Encoding as received.
    pub encoding: Option<String>,
    /// True if `content` is the result of decoding `original`.
    pub decoded: bool,
    /// Wire bytes as received.
    pub original: Bytes,
    pub is_text: bool,
    /// Set when anything touched the response; disables reuse of `original`.
    pub modified: bool,
}

impl DecodedBody {
    /// Decodes a body given its message headers.
    ///
    /// Non-text content is passed through undecoded. An unsupported or
    /// corrupt coding is logged and the body is treated as opaque.
    pub fn decode(headers: &HeaderMap, body: Bytes) -> Self {
        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let is_text = is_text_content(content_type(headers));

        let mut decoded = Self {
            content: body.clone(),
            encoding,
            decoded: false,
            original: body,
            is_text,
            modified: false,
        };

        let Some(encoding) = decoded.encoding.as_deref() else {
            return decoded;
        };
        if !is_text || codings(encoding).is_empty() {
            return decoded;
        }

        match decode(encoding, &decoded.original) {
            Ok(content) => {
                decoded.content = Bytes::from(content);
                decoded.decoded = true;
            }
            Err(e) => {
                tracing::warn!("Passing body through undecoded: {}", e);
            }
        }
        decoded
    }

    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    /// Returns the wire body and the Content-Encoding to send with it.
    pub fn encode(&self) -> (Bytes, Option<String>) {
        if !self.decoded {
            return (self.content.clone(), self.encoding.clone());
        }
        if !self.modified {
            return (self.original.clone(), self.encoding.clone());
        }

        let encoding = self.encoding.as_deref().unwrap_or("");
        match encode(encoding, &self.content) {
            Ok(body) => (Bytes::from(body), self.encoding.clone()),
            Err(e) => {
                tracing::warn!("Re-encoding failed, sending plain body: {}", e);
                (self.content.clone(), None)
            }
        }
    }

    /// Installs the wire body into `res` with matching framing headers.
    ///
    /// An unmodified response keeps its body and headers as received, so
    /// HEAD and 304 framing is not rewritten.
    pub fn apply_to(&self, res: &mut Response<Bytes>) {
        if !self.modified {
            return;
        }
        let (body, encoding) = self.encode();
        let headers = res.headers_mut();
        match encoding.and_then(|e| HeaderValue::from_str(&e).ok()) {
            Some(value) => {
                headers.insert(CONTENT_ENCODING, value);
            }
            None => {
                headers.remove(CONTENT_ENCODING);
            }
        }
        sync_content_length(headers, body.len());
        *res.body_mut() = body;
    }

    /// Copy of `res` with the decoded body, no Content-Encoding, a matching
    /// Content-Length and, if decoded, the original-encoding marker.
    pub fn readable(&self, res: &Response<Bytes>) -> Response<Bytes> {
        let mut view = clone_response(res);
        *view.body_mut() = self.content.clone();
        if self.decoded {
            let headers = view.headers_mut();
            headers.remove(CONTENT_ENCODING);
            if let Some(value) = self
                .encoding
                .as_deref()
                .and_then(|e| HeaderValue::from_str(e).ok())
            {
                headers.insert(ORIGINAL_ENCODING_HEADER, value);
            }
        }
        sync_content_length(view.headers_mut(), self.content.len());
        view
    }

    /// Decoded content as text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}
