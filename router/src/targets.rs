//! Resolution of a logical service name to the shards behind it.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;

/// Shard name -> base URL. Keys are unique; iteration order is the shard order used for the
/// outcome list handed to reducers.
pub type TargetMap = BTreeMap<String, String>;

#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Return every shard of `service`. An empty map means the service has no targets.
    async fn resolve_targets(&self, service: &str) -> anyhow::Result<TargetMap>;
}

#[derive(Debug, Clone, Default)]
/// Resolver backed by the `targets` section of the router config.
pub struct StaticTargetResolver {
    services: BTreeMap<String, TargetMap>,
}

impl StaticTargetResolver {
    pub fn new(services: BTreeMap<String, TargetMap>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

#[async_trait]
impl TargetResolver for StaticTargetResolver {
    async fn resolve_targets(&self, service: &str) -> anyhow::Result<TargetMap> {
        self.services
            .get(service)
            .cloned()
            .with_context(|| format!("unknown service: {service}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> StaticTargetResolver {
        StaticTargetResolver::new(BTreeMap::from([(
            "clouddriver".to_string(),
            TargetMap::from([
                ("b".to_string(), "http://b".to_string()),
                ("a".to_string(), "http://a".to_string()),
            ]),
        )]))
    }

    #[tokio::test]
    async fn resolves_known_service_in_shard_order() {
        let targets = resolver().resolve_targets("clouddriver").await.unwrap();
        let shards: Vec<_> = targets.keys().map(String::as_str).collect();
        assert_eq!(shards, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unknown_service_is_an_error() {
        let err = resolver().resolve_targets("front50").await.unwrap_err();
        assert!(err.to_string().contains("front50"));
    }
}
