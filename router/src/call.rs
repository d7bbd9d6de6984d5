//! Construction of per-shard outbound calls from one request snapshot.

use std::fmt;

use anyhow::Context;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;
use uuid::Uuid;

use crate::{outcome::ShardError, snapshot::RequestSnapshot, targets::TargetMap};

/// Marker carried by every scattered sub-request, so shards can tell fanned-out traffic apart
/// from direct calls.
pub const SCATTER_MARKER_HEADER: HeaderName =
    HeaderName::from_static("x-spinnaker-scatteredrequest");
pub const SCATTER_MARKER_VALUE: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Identifier of one scatter/gather episode.
pub struct WorkId(String);

impl WorkId {
    pub fn new() -> Self {
        Self(format!("w-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for WorkId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Label of one call within an episode, displayed as `workId:shardName`.
pub struct CallTag {
    pub work_id: WorkId,
    pub shard: String,
}

impl fmt::Display for CallTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.work_id, self.shard)
    }
}

#[derive(Debug, Clone)]
/// A fully built request to one shard.
pub struct OutboundCall {
    pub tag: CallTag,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug)]
pub enum PreparedCall {
    /// Ready to execute.
    Ready(OutboundCall),
    /// The target couldn't be addressed; recorded as a failure without being executed.
    Rejected { tag: CallTag, error: ShardError },
}

impl PreparedCall {
    pub fn tag(&self) -> &CallTag {
        match self {
            Self::Ready(call) => &call.tag,
            Self::Rejected { tag, .. } => tag,
        }
    }
}

/// Build one call per target, in target iteration order.
///
/// Every call gets the snapshot's method, headers (duplicates included) and body, plus the
/// scatter marker header. A target with an unusable base URL yields [`PreparedCall::Rejected`]
/// and doesn't affect the others.
pub fn create_calls(
    work_id: &WorkId,
    targets: &TargetMap,
    snapshot: &RequestSnapshot,
) -> Vec<PreparedCall> {
    let mut headers = snapshot.headers().clone();
    headers.insert(
        SCATTER_MARKER_HEADER,
        HeaderValue::from_static(SCATTER_MARKER_VALUE),
    );

    targets
        .iter()
        .map(|(shard, base_url)| {
            let tag = CallTag {
                work_id: work_id.clone(),
                shard: shard.clone(),
            };
            match shard_url(base_url, snapshot.path_and_query()) {
                Ok(url) => PreparedCall::Ready(OutboundCall {
                    tag,
                    method: snapshot.method().clone(),
                    url,
                    headers: headers.clone(),
                    body: snapshot.body().cloned(),
                }),
                Err(err) => {
                    tracing::warn!(
                        event = "target_rejected",
                        call = %tag,
                        base_url = %base_url,
                        error = %format!("{err:#}"),
                        "invalid target"
                    );
                    PreparedCall::Rejected {
                        tag,
                        error: ShardError::InvalidTarget(format!("{err:#}")),
                    }
                }
            }
        })
        .collect()
}

fn shard_url(base_url: &str, path_and_query: &str) -> anyhow::Result<Url> {
    let base = Url::parse(base_url).with_context(|| format!("parse base url {base_url:?}"))?;
    if !matches!(base.scheme(), "http" | "https") {
        anyhow::bail!("unsupported scheme {:?} in {base_url:?}", base.scheme());
    }
    let joined = format!("{}{}", base_url.trim_end_matches('/'), path_and_query);
    Url::parse(&joined).with_context(|| format!("parse shard url {joined:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(headers: &[(&str, &str)]) -> RequestSnapshot {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        RequestSnapshot::from_parts(
            Method::POST,
            "/v1/items?x=1",
            map,
            Some(Bytes::from_static(b"payload")),
        )
    }

    fn targets(pairs: &[(&str, &str)]) -> TargetMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ready(call: &PreparedCall) -> &OutboundCall {
        match call {
            PreparedCall::Ready(call) => call,
            PreparedCall::Rejected { tag, error } => panic!("{tag} rejected: {error}"),
        }
    }

    #[test]
    fn builds_one_call_per_target_in_order() {
        let work_id = WorkId::from("w-1".to_string());
        let calls = create_calls(
            &work_id,
            &targets(&[("b", "http://b.local/"), ("a", "http://a.local")]),
            &snapshot(&[]),
        );

        assert_eq!(calls.len(), 2);
        let a = ready(&calls[0]);
        let b = ready(&calls[1]);
        assert_eq!(a.url.as_str(), "http://a.local/v1/items?x=1");
        assert_eq!(b.url.as_str(), "http://b.local/v1/items?x=1");
        assert_eq!(a.tag.to_string(), "w-1:a");
        assert_eq!(a.method, Method::POST);
        assert_eq!(a.body.as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn base_url_path_prefix_is_kept() {
        let calls = create_calls(
            &WorkId::new(),
            &targets(&[("a", "https://a.local/api")]),
            &snapshot(&[]),
        );
        assert_eq!(
            ready(&calls[0]).url.as_str(),
            "https://a.local/api/v1/items?x=1"
        );
    }

    #[test]
    fn every_call_copies_all_headers_including_duplicates() {
        let snap = snapshot(&[
            ("x-tag", "one"),
            ("x-tag", "two"),
            ("content-type", "application/json"),
        ]);
        let calls = create_calls(
            &WorkId::new(),
            &targets(&[("a", "http://a"), ("b", "http://b"), ("c", "http://c")]),
            &snap,
        );

        for call in &calls {
            let call = ready(call);
            for name in snap.headers().keys() {
                let sent: Vec<_> = call.headers.get_all(name).iter().collect();
                let captured: Vec<_> = snap.headers().get_all(name).iter().collect();
                assert_eq!(sent, captured, "header {name} on {}", call.tag);
            }
        }
    }

    #[test]
    fn marker_header_is_always_set() {
        let many: Vec<(String, String)> = (0..50)
            .map(|i| (format!("x-h{i}"), i.to_string()))
            .collect();
        let refs: Vec<(&str, &str)> = many
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        for snap in [snapshot(&[]), snapshot(&refs)] {
            let calls = create_calls(
                &WorkId::new(),
                &targets(&[("a", "http://a"), ("b", "http://b")]),
                &snap,
            );
            for call in &calls {
                let values: Vec<_> = ready(call)
                    .headers
                    .get_all("x-spinnaker-scatteredrequest")
                    .iter()
                    .collect();
                assert_eq!(values, vec!["1"]);
            }
        }
    }

    #[test]
    fn inbound_marker_value_is_replaced() {
        let calls = create_calls(
            &WorkId::new(),
            &targets(&[("a", "http://a")]),
            &snapshot(&[("x-spinnaker-scatteredrequest", "0")]),
        );
        let values: Vec<_> = ready(&calls[0])
            .headers
            .get_all(SCATTER_MARKER_HEADER)
            .iter()
            .collect();
        assert_eq!(values, vec!["1"]);
    }

    #[test]
    fn malformed_target_is_rejected_without_blocking_others() {
        let calls = create_calls(
            &WorkId::new(),
            &targets(&[
                ("a", "http://a"),
                ("b", "not a url"),
                ("c", "ftp://c"),
                ("d", "http://d"),
            ]),
            &snapshot(&[]),
        );

        assert_eq!(calls.len(), 4);
        assert!(matches!(calls[0], PreparedCall::Ready(_)));
        assert!(matches!(
            &calls[1],
            PreparedCall::Rejected {
                error: ShardError::InvalidTarget(_),
                ..
            }
        ));
        assert!(matches!(calls[2], PreparedCall::Rejected { .. }));
        assert!(matches!(calls[3], PreparedCall::Ready(_)));
        assert_eq!(calls[1].tag().shard, "b");
    }
}
