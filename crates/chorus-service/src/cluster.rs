//! Cluster-facing seams of the control service

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};

#[cfg(test)]
use mockall::automock;

use chorus_cluster::{ClusterAdapter, ClusterApp, ClusterError, ClusterWorkbench, WorkbenchRef};
use chorus_proxy::ProxyCache;

/// Desired-state writes the service issues to the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkbenchCluster: Send + Sync {
    /// Create or converge a workbench with no apps
    async fn create_workbench(&self, workbench: &ClusterWorkbench) -> Result<(), ClusterError>;

    /// Converge a workbench to exactly `apps`
    async fn update_workbench(&self, workbench: &ClusterWorkbench, apps: &[ClusterApp]) -> Result<(), ClusterError>;

    /// Delete a workbench; absent is success
    async fn delete_workbench(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Add one app to a workbench
    async fn create_app_instance(&self, namespace: &str, name: &str, app: &ClusterApp) -> Result<(), ClusterError>;

    /// Upsert one app of a workbench
    async fn update_app_instance(&self, namespace: &str, name: &str, app: &ClusterApp) -> Result<(), ClusterError>;

    /// Remove one app from a workbench; absent is success
    async fn delete_app_instance(&self, namespace: &str, name: &str, app: &ClusterApp) -> Result<(), ClusterError>;
}

#[async_trait]
impl WorkbenchCluster for ClusterAdapter {
    async fn create_workbench(&self, workbench: &ClusterWorkbench) -> Result<(), ClusterError> {
        ClusterAdapter::create_workbench(self, workbench).await.map(|_| ())
    }

    async fn update_workbench(&self, workbench: &ClusterWorkbench, apps: &[ClusterApp]) -> Result<(), ClusterError> {
        ClusterAdapter::update_workbench(self, workbench, apps)
            .await
            .map(|_| ())
    }

    async fn delete_workbench(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        ClusterAdapter::delete_workbench(self, namespace, name).await
    }

    async fn create_app_instance(&self, namespace: &str, name: &str, app: &ClusterApp) -> Result<(), ClusterError> {
        ClusterAdapter::create_app_instance(self, namespace, name, app).await
    }

    async fn update_app_instance(&self, namespace: &str, name: &str, app: &ClusterApp) -> Result<(), ClusterError> {
        ClusterAdapter::update_app_instance(self, namespace, name, app).await
    }

    async fn delete_app_instance(&self, namespace: &str, name: &str, app: &ClusterApp) -> Result<(), ClusterError> {
        ClusterAdapter::delete_app_instance(self, namespace, name, app).await
    }
}

/// Forwards requests to a workbench's stream endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamProxy: Send + Sync {
    /// Forward one request; failures are already rendered as responses
    async fn forward(&self, target: &WorkbenchRef, request: Request<Body>) -> Response<Body>;
}

#[async_trait]
impl StreamProxy for ProxyCache {
    async fn forward(&self, target: &WorkbenchRef, request: Request<Body>) -> Response<Body> {
        ProxyCache::forward(self, target, request).await
    }
}
