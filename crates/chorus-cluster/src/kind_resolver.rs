//! Kind to API resource resolution through cluster discovery

use async_trait::async_trait;
use dashmap::DashMap;
use kube::discovery::{ApiResource, Discovery};
use kube::Client;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Resolves a kind name to the API resource that serves it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KindResolver: Send + Sync {
    /// Look up the preferred API resource for `kind`
    ///
    /// Returns `None` when no served group knows the kind or discovery failed.
    async fn resolve(&self, kind: &str) -> Option<ApiResource>;
}

/// Discovery-backed resolver with a process-lifetime cache
pub struct DiscoveryKindResolver {
    client: Client,
    cache: DashMap<String, ApiResource>,
}

impl DiscoveryKindResolver {
    /// Create a resolver with an empty cache
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl KindResolver for DiscoveryKindResolver {
    async fn resolve(&self, kind: &str) -> Option<ApiResource> {
        if let Some(ar) = self.cache.get(kind) {
            return Some(ar.clone());
        }

        let discovery = match Discovery::new(self.client.clone()).run().await {
            Ok(d) => d,
            Err(e) => {
                warn!(kind = %kind, error = %e, "API discovery failed");
                return None;
            }
        };

        let mut found = None;
        for group in discovery.groups() {
            for (ar, _caps) in group.recommended_resources() {
                if found.is_none() && ar.kind == kind {
                    found = Some(ar.clone());
                }
                self.cache.entry(ar.kind.clone()).or_insert(ar);
            }
        }

        match &found {
            Some(ar) => debug!(kind = %kind, api_version = %ar.api_version, plural = %ar.plural, "resolved kind"),
            None => debug!(kind = %kind, "kind not served by the cluster"),
        }
        found
    }
}
