//! The single response produced by a scatter/gather episode, and how it is written out.

use std::io;

use axum::response::IntoResponse;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::{outcome::ShardResponse, snapshot::is_hop_by_hop_header};

#[derive(Debug, Clone)]
/// Transport-agnostic HTTP response returned to the inbound caller.
pub struct ReducedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub character_encoding: Option<String>,
    pub body: Option<Bytes>,
    /// Set when the response reports a failure of the episode rather than shard data.
    pub is_error: bool,
}

impl ReducedResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            content_type: None,
            character_encoding: None,
            body: None,
            is_error: false,
        }
    }

    /// Plain text error response (`text/plain; charset=utf-8`, `is_error = true`).
    pub fn error(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            content_type: Some("text/plain".to_string()),
            character_encoding: Some("utf-8".to_string()),
            body: Some(Bytes::from(msg.into())),
            is_error: true,
        }
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Returned when the reducer fails. The reducer's error is logged, never echoed.
    pub fn aggregation_failure() -> Self {
        Self::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to aggregate shard responses",
        )
    }

    /// Returned when the service resolves to no shards, so routing failures stand apart from
    /// shard failures.
    pub fn no_targets(service: &str) -> Self {
        Self::error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("no targets for service {service}"),
        )
    }

    /// Returned when the episode is cancelled before its shard calls were dispatched.
    pub fn cancelled() -> Self {
        Self::error(StatusCode::SERVICE_UNAVAILABLE, "request cancelled")
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::error(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {limit} bytes"),
        )
    }

    /// Copy a shard response verbatim. The `Content-Type` header is split into content type and
    /// character encoding; framing headers are dropped since the body is re-framed on write.
    pub fn from_shard_response(resp: &ShardResponse) -> Self {
        let content_type = resp.headers.get(header::CONTENT_TYPE);
        let mut headers = HeaderMap::with_capacity(resp.headers.len());
        for (name, value) in resp.headers.iter() {
            if name == header::CONTENT_TYPE
                || name == header::CONTENT_LENGTH
                || is_hop_by_hop_header(name)
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let (content_type, character_encoding) = match content_type.and_then(|v| v.to_str().ok())
        {
            Some(value) => {
                let (ty, charset) = split_content_type(value);
                (Some(ty), charset)
            }
            None => (None, None),
        };

        Self {
            status: resp.status,
            headers,
            content_type,
            character_encoding,
            body: Some(resp.body.clone()),
            is_error: false,
        }
    }

    /// Write this response onto `sink`: status, content type, character encoding and headers
    /// first, then the body, then flush. Consumes the response; it is applied once.
    pub fn apply_to<S: ResponseSink + ?Sized>(self, sink: &mut S) -> io::Result<()> {
        sink.set_status(self.status);
        if let Some(content_type) = &self.content_type {
            sink.set_content_type(content_type);
        }
        if let Some(encoding) = &self.character_encoding {
            sink.set_character_encoding(encoding);
        }
        for (name, value) in self.headers.iter() {
            sink.append_header(name, value);
        }

        match &self.body {
            Some(body) => {
                sink.set_content_length(body.len() as u64);
                sink.write_body(body)?;
            }
            None => sink.set_content_length(0),
        }
        sink.flush()
    }
}

fn split_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';').map(str::trim);
    let mut ty = parts.next().unwrap_or_default().to_string();
    let mut charset = None;
    for param in parts.filter(|p| !p.is_empty()) {
        match param.split_once('=') {
            Some((k, v)) if k.trim().eq_ignore_ascii_case("charset") => {
                charset = Some(v.trim().trim_matches('"').to_string());
            }
            _ => {
                ty.push_str("; ");
                ty.push_str(param);
            }
        }
    }
    (ty, charset)
}

/// Outbound response being written for the inbound caller.
pub trait ResponseSink {
    fn set_status(&mut self, status: StatusCode);
    fn set_content_type(&mut self, content_type: &str);
    /// Must be called before any body bytes are written.
    fn set_character_encoding(&mut self, encoding: &str);
    fn append_header(&mut self, name: &HeaderName, value: &HeaderValue);
    fn set_content_length(&mut self, len: u64);
    fn write_body(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

#[derive(Debug, Default)]
/// In-memory sink that can be turned into an axum response.
pub struct BufferedSink {
    status: StatusCode,
    content_type: Option<String>,
    character_encoding: Option<String>,
    headers: HeaderMap,
    content_length: Option<u64>,
    body: BytesMut,
    flushed: bool,
}

impl BufferedSink {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn content_type_header(&self) -> Option<HeaderValue> {
        let ty = self.content_type.as_deref()?;
        let value = match self.character_encoding.as_deref() {
            Some(encoding) => format!("{ty}; charset={encoding}"),
            None => ty.to_string(),
        };
        match HeaderValue::from_str(&value) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(content_type = %value, "dropping invalid content-type");
                None
            }
        }
    }
}

impl ResponseSink for BufferedSink {
    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    fn set_character_encoding(&mut self, encoding: &str) {
        self.character_encoding = Some(encoding.to_string());
    }

    fn append_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers.append(name.clone(), value.clone());
    }

    fn set_content_length(&mut self, len: u64) {
        self.content_length = Some(len);
    }

    fn write_body(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.flushed {
            return Err(io::Error::other("response already flushed"));
        }
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushed = true;
        Ok(())
    }
}

impl IntoResponse for BufferedSink {
    fn into_response(self) -> axum::response::Response {
        let mut headers = self.headers.clone();
        if let Some(value) = self.content_type_header() {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Some(len) = self.content_length {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }

        let mut res = axum::response::Response::new(axum::body::Body::from(self.body.freeze()));
        *res.status_mut() = self.status;
        *res.headers_mut() = headers;
        res
    }
}

impl IntoResponse for ReducedResponse {
    fn into_response(self) -> axum::response::Response {
        let mut sink = BufferedSink::default();
        if let Err(err) = self.apply_to(&mut sink) {
            tracing::error!(error = %err, "failed to write reduced response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        sink.into_response()
    }
}
