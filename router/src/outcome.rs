//! Per-shard results collected during one scatter/gather episode.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

#[derive(Debug, Clone)]
/// HTTP response received from a single shard.
pub struct ShardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, thiserror::Error)]
/// Why a shard did not contribute a successful response.
pub enum ShardError {
    /// The target's base URL could not be turned into a request URL. The call was never issued.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// Connection, TLS or body-read failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The shard answered with a non-2xx status. The response is kept for reducers that care.
    #[error("shard responded with {}", .0.status)]
    Status(ShardResponse),
    /// The episode deadline elapsed before the shard answered.
    #[error("timed out waiting for shard")]
    Timeout,
    /// The episode was cancelled while the call was in flight.
    #[error("cancelled")]
    Cancelled,
    /// The task driving the call exited without producing a result.
    #[error("call aborted")]
    Aborted,
}

#[derive(Debug, Clone)]
/// Outcome of one shard call. Exactly one exists per target per episode.
pub struct ShardOutcome {
    pub shard: String,
    pub result: Result<ShardResponse, ShardError>,
}

impl ShardOutcome {
    pub fn success(shard: impl Into<String>, response: ShardResponse) -> Self {
        Self {
            shard: shard.into(),
            result: Ok(response),
        }
    }

    pub fn failure(shard: impl Into<String>, error: ShardError) -> Self {
        Self {
            shard: shard.into(),
            result: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn response(&self) -> Option<&ShardResponse> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ShardError> {
        self.result.as_ref().err()
    }
}
