//! Reduction of per-shard outcomes into one response.

use std::fmt::Write as _;

use http::StatusCode;

use crate::{outcome::ShardOutcome, response::ReducedResponse};

/// Turns the outcomes of one episode into the response sent to the caller.
///
/// `outcomes` holds exactly one entry per target, in target order. Implementations must be
/// deterministic and must handle all-success, all-failure and mixed inputs. An `Err` (or a
/// panic) is reported to the caller as a generic aggregation failure.
pub trait ResponseReducer: Send + Sync {
    fn reduce(&self, outcomes: &[ShardOutcome]) -> anyhow::Result<ReducedResponse>;
}

impl<F> ResponseReducer for F
where
    F: Fn(&[ShardOutcome]) -> anyhow::Result<ReducedResponse> + Send + Sync,
{
    fn reduce(&self, outcomes: &[ShardOutcome]) -> anyhow::Result<ReducedResponse> {
        self(outcomes)
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Returns the first successful shard response verbatim; if every shard failed, a 502 listing
/// each shard's failure.
pub struct FirstSuccessReducer;

impl ResponseReducer for FirstSuccessReducer {
    fn reduce(&self, outcomes: &[ShardOutcome]) -> anyhow::Result<ReducedResponse> {
        if let Some(resp) = outcomes.iter().find_map(ShardOutcome::response) {
            return Ok(ReducedResponse::from_shard_response(resp));
        }

        let mut msg = format!("{} of {} shards failed", outcomes.len(), outcomes.len());
        for outcome in outcomes {
            if let Some(err) = outcome.error() {
                let _ = write!(msg, "\n{}: {err}", outcome.shard);
            }
        }
        Ok(ReducedResponse::error(StatusCode::BAD_GATEWAY, msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ShardError, ShardResponse};
    use bytes::Bytes;
    use http::HeaderMap;

    fn ok(shard: &str, body: &'static str) -> ShardOutcome {
        ShardOutcome::success(
            shard,
            ShardResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(body.as_bytes()),
            },
        )
    }

    #[test]
    fn returns_first_success_in_target_order() {
        let outcomes = vec![
            ShardOutcome::failure("a", ShardError::Timeout),
            ok("b", "from b"),
            ok("c", "from c"),
        ];
        let reduced = FirstSuccessReducer.reduce(&outcomes).unwrap();
        assert_eq!(reduced.status, StatusCode::OK);
        assert_eq!(reduced.body.as_deref(), Some(&b"from b"[..]));
        assert!(!reduced.is_error);
    }

    #[test]
    fn all_failed_is_an_error_summary() {
        let outcomes = vec![
            ShardOutcome::failure("a", ShardError::Transport("connection refused".to_string())),
            ShardOutcome::failure("b", ShardError::Timeout),
            ShardOutcome::failure("c", ShardError::InvalidTarget("bad url".to_string())),
        ];
        let reduced = FirstSuccessReducer.reduce(&outcomes).unwrap();
        assert!(reduced.is_error);
        assert!(!reduced.status.is_success());

        let body = String::from_utf8(reduced.body.unwrap().to_vec()).unwrap();
        assert!(body.starts_with("3 of 3 shards failed"));
        assert!(body.contains("a: transport error: connection refused"));
        assert!(body.contains("b: timed out"));
    }

    #[test]
    fn no_outcomes_is_an_error() {
        let reduced = FirstSuccessReducer.reduce(&[]).unwrap();
        assert!(reduced.is_error);
    }

    #[test]
    fn closures_are_reducers() {
        let count = |outcomes: &[ShardOutcome]| -> anyhow::Result<ReducedResponse> {
            let ok = outcomes.iter().filter(|o| o.is_success()).count();
            let mut resp = ReducedResponse::new(StatusCode::OK);
            resp.body = Some(Bytes::from(ok.to_string()));
            Ok(resp)
        };
        let reduced = count
            .reduce(&[ok("a", ""), ShardOutcome::failure("b", ShardError::Cancelled)])
            .unwrap();
        assert_eq!(reduced.body.as_deref(), Some(&b"1"[..]));
    }
}
