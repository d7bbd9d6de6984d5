use std::time::Duration;

use async_trait::async_trait;

use crate::{call::OutboundCall, outcome::ShardResponse};

/// Issues one call to one shard.
///
/// Implementations return any HTTP response the shard produced, whatever its status; the
/// dispatcher decides what counts as a failure. `Err` is reserved for calls that produced no
/// response at all. Dropping the returned future must abandon the call.
#[async_trait]
pub trait ShardClient: Send + Sync {
    async fn execute(&self, call: OutboundCall) -> anyhow::Result<ShardResponse>;
}

#[derive(Clone)]
/// Shared, long-lived `reqwest` client. Build once at startup and share across episodes.
pub struct ReqwestShardClient {
    http: reqwest::Client,
}

impl ReqwestShardClient {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ShardClient for ReqwestShardClient {
    async fn execute(&self, call: OutboundCall) -> anyhow::Result<ShardResponse> {
        let mut req = self.http.request(call.method, call.url).headers(call.headers);
        if let Some(body) = call.body {
            req = req.body(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;

        Ok(ShardResponse {
            status,
            headers,
            body,
        })
    }
}
