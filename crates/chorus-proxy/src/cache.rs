//! Lazily built reverse proxies per workbench
//!
//! Entries are created on first use and live until an upstream failure or a
//! failed health probe evicts them. Outside the cluster each entry owns a
//! port-forward tunnel, stopped on eviction. A tunnel's local listener always
//! accepts, so probes go through the transport to the workbench itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, Response};
use axum::response::IntoResponse;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use chorus_cluster::{ClusterAdapter, ClusterError, Tunnel, TunnelOpener, WorkbenchRef, WORKBENCH_PORT};
use chorus_common::metrics;

use crate::error::ProxyError;
use crate::reverse::ReverseProxy;
use crate::transport::{OutboundRequest, RoundTrip};

/// Route cache key
///
/// Routes are scoped by tenant so a cached route never answers a lookup from
/// another tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// Tenant the route was resolved for
    pub tenant_id: u64,
    /// Workbench ID
    pub workbench_id: u64,
}

impl RouteKey {
    /// Key for `workbench_id` as seen by `tenant_id`
    pub fn new(tenant_id: u64, workbench_id: u64) -> Self {
        Self {
            tenant_id,
            workbench_id,
        }
    }
}

/// Tenant-scoped workbench ID to cluster location, shared with the control service
pub type RouteCache = DashMap<RouteKey, WorkbenchRef>;

/// Write-lock waits longer than this are logged
const LOCK_WAIT_WARN: Duration = Duration::from_millis(100);

/// Limit on a single health probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Finds the pod serving a workbench
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLocator: Send + Sync {
    /// Name of a pod running the workbench
    async fn workbench_pod(&self, namespace: &str, name: &str) -> Result<String, ClusterError>;
}

#[async_trait]
impl PodLocator for ClusterAdapter {
    async fn workbench_pod(&self, namespace: &str, name: &str) -> Result<String, ClusterError> {
        self.workbench_pod_name(namespace, name).await
    }
}

/// Why an entry left the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictReason {
    /// Forwarding through the entry failed
    ProxyError,
    /// The target stopped answering probes
    HealthCheck,
}

impl EvictReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::ProxyError => "proxy_error",
            Self::HealthCheck => "health_check",
        }
    }
}

/// One cached route to a workbench
pub struct ProxyEntry {
    key: WorkbenchRef,
    proxy: ReverseProxy,
    pod: Option<String>,
    tunnel: Option<Tunnel>,
    last_healthy: Mutex<Instant>,
}

impl ProxyEntry {
    /// Workbench this entry routes to
    pub fn key(&self) -> &WorkbenchRef {
        &self.key
    }

    /// Upstream base URL
    pub fn target(&self) -> &str {
        self.proxy.target()
    }

    /// Pod behind the tunnel, `None` in-cluster
    pub fn pod(&self) -> Option<&str> {
        self.pod.as_deref()
    }

    /// Local tunnel port, `None` in-cluster
    pub fn local_port(&self) -> Option<u16> {
        self.tunnel.as_ref().map(Tunnel::local_port)
    }

    /// Last time the target answered a probe (or entry creation)
    pub fn last_healthy(&self) -> Instant {
        *self.last_healthy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_healthy(&self) {
        *self.last_healthy.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn stop(&self) {
        if let Some(tunnel) = &self.tunnel {
            tunnel.stop();
        }
    }
}

/// Cache of reverse proxies keyed by workbench location
pub struct ProxyCache {
    entries: RwLock<HashMap<WorkbenchRef, Arc<ProxyEntry>>>,
    in_cluster: bool,
    pods: Arc<dyn PodLocator>,
    tunnels: Arc<dyn TunnelOpener>,
    transport: Arc<dyn RoundTrip>,
    routes: Arc<RouteCache>,
}

impl ProxyCache {
    /// Create an empty cache
    ///
    /// With `in_cluster` set, workbenches are reached by service DNS and no
    /// tunnels are opened.
    pub fn new(
        in_cluster: bool,
        pods: Arc<dyn PodLocator>,
        tunnels: Arc<dyn TunnelOpener>,
        transport: Arc<dyn RoundTrip>,
        routes: Arc<RouteCache>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_cluster,
            pods,
            tunnels,
            transport,
            routes,
        }
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Get the proxy for a workbench, creating it on first use
    #[instrument(skip(self))]
    pub async fn get_proxy(&self, namespace: &str, name: &str) -> Result<Arc<ProxyEntry>, ClusterError> {
        let key = WorkbenchRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        if let Some(entry) = self.entries.read().await.get(&key) {
            return Ok(entry.clone());
        }

        let waited = Instant::now();
        let mut entries = self.entries.write().await;
        let wait = waited.elapsed();
        if wait > LOCK_WAIT_WARN {
            warn!(wait_ms = wait.as_millis() as u64, "proxy cache write lock was slow to acquire");
        }

        if let Some(entry) = entries.get(&key) {
            return Ok(entry.clone());
        }

        let entry = Arc::new(self.build_entry(key.clone()).await?);
        info!(upstream = %entry.target(), "proxy cache entry created");
        entries.insert(key, entry.clone());
        Ok(entry)
    }

    async fn build_entry(&self, key: WorkbenchRef) -> Result<ProxyEntry, ClusterError> {
        let (url, pod, tunnel) = if self.in_cluster {
            let url = format!("http://{}.{}:{}", key.name, key.namespace, WORKBENCH_PORT);
            (url, None, None)
        } else {
            let pod = self.pods.workbench_pod(&key.namespace, &key.name).await?;
            let tunnel = self.tunnels.open(&key.namespace, &pod, WORKBENCH_PORT).await?;
            (tunnel.url(), Some(pod), Some(tunnel))
        };

        Ok(ProxyEntry {
            key,
            proxy: ReverseProxy::new(url, self.transport.clone()),
            pod,
            tunnel,
            last_healthy: Mutex::new(Instant::now()),
        })
    }

    /// Forward a request to a workbench, evicting its entry when the upstream fails
    pub async fn forward(&self, target: &WorkbenchRef, request: Request<Body>) -> Response<Body> {
        let entry = match self.get_proxy(&target.namespace, &target.name).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(workbench = %target, error = %e, "failed to build workbench proxy");
                return ProxyError::from(e).into_response();
            }
        };

        match entry.proxy.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(workbench = %target, error = %e, "proxy error");
                if e.is_upstream_failure() {
                    self.evict(&target.namespace, &target.name, EvictReason::ProxyError).await;
                }
                e.into_response()
            }
        }
    }

    /// Drop a workbench's entry, stop its tunnel and forget its route
    ///
    /// Returns whether an entry was present.
    pub async fn evict(&self, namespace: &str, name: &str, reason: EvictReason) -> bool {
        let key = WorkbenchRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let removed = self.entries.write().await.remove(&key);
        self.routes.retain(|_, route| *route != key);

        match removed {
            Some(entry) => {
                entry.stop();
                metrics::record_eviction(reason.as_str());
                info!(workbench = %key, reason = reason.as_str(), "proxy cache entry evicted");
                true
            }
            None => false,
        }
    }

    /// Probe every entry once, evicting those that don't answer
    ///
    /// Returns the number of evicted entries.
    pub async fn sweep_once(&self) -> usize {
        let snapshot: Vec<Arc<ProxyEntry>> = self.entries.read().await.values().cloned().collect();
        let mut evicted = 0;
        for entry in snapshot {
            if self.probe(&entry).await {
                entry.mark_healthy();
            } else if self
                .evict(&entry.key.namespace, &entry.key.name, EvictReason::HealthCheck)
                .await
            {
                evicted += 1;
            }
        }
        evicted
    }

    /// Probe entries every `interval` until cancelled
    pub async fn run_health_sweep(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "starting proxy health sweep");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.sweep_once().await;
                    if evicted > 0 {
                        debug!(evicted, "health sweep evicted proxy entries");
                    }
                }
            }
        }
        info!("proxy health sweep stopped");
    }

    /// Whether the workbench behind `entry` still answers
    ///
    /// A tunnel entry is dead once its pod is no longer the one serving the
    /// workbench. Any HTTP response counts as alive; a transport error or
    /// timeout does not.
    async fn probe(&self, entry: &ProxyEntry) -> bool {
        if let Some(pod) = entry.pod() {
            match self.pods.workbench_pod(&entry.key.namespace, &entry.key.name).await {
                Ok(current) if current == pod => {}
                Ok(current) => {
                    debug!(workbench = %entry.key, pod, current = %current, "workbench pod was replaced");
                    return false;
                }
                Err(e) => {
                    debug!(workbench = %entry.key, pod, error = %e, "workbench pod lookup failed");
                    return false;
                }
            }
        }

        let request = OutboundRequest {
            method: Method::GET,
            url: format!("{}/", entry.target()),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        match tokio::time::timeout(PROBE_TIMEOUT, self.transport.round_trip(request)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(workbench = %entry.key, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(workbench = %entry.key, "health probe timed out");
                false
            }
        }
    }
}
