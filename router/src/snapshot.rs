//! Replayable capture of an inbound request.
//!
//! An inbound body can only be read once, but a scatter episode needs to send it to every shard.
//! [`RequestSnapshot`] reads it eagerly into memory and shares the bytes between all outbound
//! calls. Bodies without a declared length are rejected rather than treated as empty.

use std::collections::HashSet;

use axum::body::{to_bytes, Body, HttpBody};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, Method, Request};

use crate::config::ForwardHeadersConfig;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("invalid content-length header")]
    InvalidContentLength,
    #[error("request body has no declared content-length")]
    UnknownLength,
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("request body unreadable: {0}")]
    Unreadable(String),
}

#[derive(Clone, Default)]
/// Which inbound headers are captured into a snapshot.
pub struct HeaderForwardPolicy {
    allow: Option<HashSet<HeaderName>>,
    deny: HashSet<HeaderName>,
}

impl HeaderForwardPolicy {
    pub fn try_from_cfg(cfg: &ForwardHeadersConfig) -> anyhow::Result<Self> {
        let allow = if cfg.allow.is_empty() {
            None
        } else {
            let mut set = HashSet::with_capacity(cfg.allow.len());
            for name in &cfg.allow {
                set.insert(HeaderName::from_bytes(name.as_bytes())?);
            }
            Some(set)
        };

        let mut deny = HashSet::with_capacity(cfg.deny.len());
        for name in &cfg.deny {
            deny.insert(HeaderName::from_bytes(name.as_bytes())?);
        }

        Ok(Self { allow, deny })
    }

    pub fn should_forward(&self, name: &HeaderName) -> bool {
        if is_hop_by_hop_header(name) || name == header::HOST {
            return false;
        }
        if self.deny.contains(name) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.contains(name),
            None => true,
        }
    }
}

pub(crate) fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    // https://datatracker.ietf.org/doc/html/rfc2616#section-13.5.1
    // (plus `TE` per common implementations)
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[derive(Debug, Clone)]
/// Immutable copy of an inbound request: method, path+query, headers and body.
pub struct RequestSnapshot {
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RequestSnapshot {
    /// Capture `req`, reading its body into memory. The length comes from `Content-Length`, or
    /// from the body's exact size hint when the header is absent.
    pub async fn build(
        req: Request<Body>,
        policy: &HeaderForwardPolicy,
        max_body_bytes: usize,
    ) -> Result<Self, SnapshotError> {
        let (parts, body) = req.into_parts();
        // Without a Content-Length the body itself must know its exact size.
        let declared_len = match declared_body_length(&parts.headers)? {
            Some(len) => len,
            None => body
                .size_hint()
                .exact()
                .ok_or(SnapshotError::UnknownLength)?,
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in parts.headers.iter() {
            if policy.should_forward(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let body = match declared_len {
            0 => None,
            len => {
                if len > max_body_bytes as u64 {
                    return Err(SnapshotError::TooLarge {
                        limit: max_body_bytes,
                    });
                }
                let bytes = to_bytes(body, max_body_bytes)
                    .await
                    .map_err(|err| SnapshotError::Unreadable(err.to_string()))?;
                if bytes.len() as u64 != len {
                    return Err(SnapshotError::Unreadable(format!(
                        "declared {len} bytes, read {}",
                        bytes.len()
                    )));
                }
                Some(bytes)
            }
        };

        Ok(Self {
            method: parts.method,
            path_and_query,
            headers,
            body,
        })
    }

    /// Build a snapshot from already-captured parts.
    pub fn from_parts(
        method: Method,
        path_and_query: impl Into<String>,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

fn declared_body_length(headers: &HeaderMap) -> Result<Option<u64>, SnapshotError> {
    let mut values = headers.get_all(header::CONTENT_LENGTH).iter();
    let Some(first) = values.next() else {
        // Chunked/streamed bodies have no length to replay against.
        if headers.contains_key(header::TRANSFER_ENCODING) {
            return Err(SnapshotError::UnknownLength);
        }
        return Ok(None);
    };

    let len = first
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or(SnapshotError::InvalidContentLength)?;
    if values.any(|other| other != first) {
        return Err(SnapshotError::InvalidContentLength);
    }
    Ok(Some(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)], body: &'static str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/v1/items?x=1&y=2");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn captures_method_path_query_and_body() {
        let req = request(&[("content-length", "2"), ("x-foo", "bar")], "hi");
        let snap = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap();

        assert_eq!(snap.method(), Method::POST);
        assert_eq!(snap.path_and_query(), "/v1/items?x=1&y=2");
        assert_eq!(snap.body().unwrap().as_ref(), b"hi");
        assert_eq!(snap.headers()["x-foo"], "bar");
    }

    #[tokio::test]
    async fn duplicate_headers_are_preserved_in_order() {
        let req = request(
            &[("x-tag", "one"), ("x-tag", "two"), ("x-tag", "three")],
            "",
        );
        let snap = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap();

        let tags: Vec<_> = snap
            .headers()
            .get_all("x-tag")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn missing_content_length_uses_exact_body_size() {
        let req = request(&[], r#"{"q":1}"#);
        let snap = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap();
        assert_eq!(snap.body().unwrap().as_ref(), br#"{"q":1}"#);

        let req = request(&[], "");
        let snap = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap();
        assert!(snap.body().is_none());
    }

    #[tokio::test]
    async fn missing_content_length_still_honours_the_limit() {
        let req = request(&[], "too-big");
        let err = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::TooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn streamed_body_without_length_is_rejected() {
        let stream = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"hi"))]);
        let req = Request::builder()
            .method("POST")
            .uri("/v1/items")
            .body(Body::from_stream(stream))
            .unwrap();

        let err = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownLength));
    }

    #[tokio::test]
    async fn zero_content_length_means_no_body() {
        let req = request(&[("content-length", "0")], "");
        let snap = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap();
        assert!(snap.body().is_none());
    }

    #[tokio::test]
    async fn chunked_body_without_length_is_rejected() {
        let req = request(&[("transfer-encoding", "chunked")], "hi");
        let err = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownLength));
    }

    #[tokio::test]
    async fn negative_content_length_is_rejected() {
        let req = request(&[("content-length", "-1")], "");
        let err = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidContentLength));
    }

    #[tokio::test]
    async fn body_over_limit_is_rejected() {
        let req = request(&[("content-length", "7")], "too-big");
        let err = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::TooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn short_body_is_unreadable() {
        let req = request(&[("content-length", "10")], "short");
        let err = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Unreadable(_)));
    }

    #[tokio::test]
    async fn hop_by_hop_and_host_headers_are_not_captured() {
        let req = request(
            &[
                ("host", "router.local"),
                ("connection", "close"),
                ("x-keep", "1"),
            ],
            "",
        );
        let snap = RequestSnapshot::build(req, &HeaderForwardPolicy::default(), 1024)
            .await
            .unwrap();
        assert!(snap.headers().get("host").is_none());
        assert!(snap.headers().get("connection").is_none());
        assert_eq!(snap.headers()["x-keep"], "1");
    }

    #[test]
    fn allow_and_deny_lists_are_applied() {
        let policy = HeaderForwardPolicy::try_from_cfg(&ForwardHeadersConfig {
            allow: vec!["x-allow".to_string(), "x-deny".to_string()],
            deny: vec!["x-deny".to_string()],
        })
        .unwrap();

        assert!(policy.should_forward(&HeaderName::from_static("x-allow")));
        assert!(!policy.should_forward(&HeaderName::from_static("x-deny")));
        assert!(!policy.should_forward(&HeaderName::from_static("x-other")));
        assert!(!policy.should_forward(&header::TRANSFER_ENCODING));
    }
}
