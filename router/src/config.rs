//! Router configuration loaded from YAML.
//!
//! The config names the shards behind every logical service and the limits applied to each
//! scatter/gather episode. Placeholders like `${SHARD_A_URL}` are rendered from the environment
//! before parsing (see [`crate::template`]).

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf};

use serde::Deserialize;

use crate::targets::TargetMap;

fn default_deadline_ms() -> u64 {
    5_000
}

fn default_max_inflight_calls() -> usize {
    64
}

fn default_max_inflight_requests() -> usize {
    256
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Deserialize)]
/// Inbound header filtering applied when a request is captured for fan-out.
///
/// Hop-by-hop headers and `Host` are never forwarded, regardless of this config.
pub struct ForwardHeadersConfig {
    #[serde(default)]
    /// If non-empty, only these header names are forwarded.
    pub allow: Vec<String>,
    #[serde(default)]
    /// Header names that are never forwarded.
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
/// Top-level router configuration.
pub struct RouterConfig {
    /// Address the router listens on (e.g. `127.0.0.1:3000`).
    pub listen_addr: SocketAddr,
    /// Path to the route spec YAML file.
    pub spec_path: PathBuf,

    #[serde(default)]
    /// Logical service name -> shard name -> base URL.
    pub targets: BTreeMap<String, TargetMap>,

    #[serde(default = "default_deadline_ms")]
    /// Episode deadline used when a route doesn't specify `x-scatter.timeoutMs`.
    pub default_deadline_ms: u64,

    #[serde(default = "default_max_inflight_calls")]
    /// Maximum number of concurrent shard calls across all episodes.
    pub max_inflight_calls: usize,

    #[serde(default = "default_max_inflight_requests")]
    /// Maximum number of inbound requests being scattered at once. Excess requests get 429.
    pub max_inflight_requests: usize,

    #[serde(default = "default_max_body_bytes")]
    /// Maximum inbound body size. The body is held in memory for the whole episode.
    pub max_body_bytes: usize,

    #[serde(default = "default_connect_timeout_ms")]
    /// TCP connect timeout for shard calls.
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub forward_headers: ForwardHeadersConfig,
}

impl RouterConfig {
    /// Parse a YAML router config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_slice(bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.default_deadline_ms == 0 {
            anyhow::bail!("default_deadline_ms must be > 0");
        }
        if self.max_inflight_calls == 0 {
            anyhow::bail!("max_inflight_calls must be > 0");
        }
        if self.max_inflight_requests == 0 {
            anyhow::bail!("max_inflight_requests must be > 0");
        }
        for (service, shards) in &self.targets {
            if shards.is_empty() {
                anyhow::bail!("service {service} has no shards");
            }
        }
        Ok(())
    }
}
