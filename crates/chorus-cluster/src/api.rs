//! Object-level Kubernetes operations used by the adapter
//!
//! [`ClusterApi`] is deliberately narrow: it knows nothing about workbenches,
//! only about dynamic objects addressed by [`ObjectKey`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use chorus_common::kube_utils::is_not_found;

use crate::error::ClusterError;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "chorus-backend";

/// Address of one object in the cluster
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectKey {
    /// API resource serving the object
    pub resource: ApiResource,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(resource: ApiResource, namespace: &str, name: &str) -> Self {
        Self {
            resource,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster_scoped(resource: ApiResource, name: &str) -> Self {
        Self {
            resource,
            namespace: None,
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource.kind, ns, self.name),
            None => write!(f, "{} {}", self.resource.kind, self.name),
        }
    }
}

/// Trait abstracting dynamic object access
///
/// Allows the adapter to be tested without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get an object, `None` if it doesn't exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ClusterError>;

    /// Create an object
    async fn create(&self, key: &ObjectKey, object: &DynamicObject) -> Result<(), ClusterError>;

    /// Apply an RFC 7386 merge patch
    async fn merge_patch(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<(), ClusterError>;

    /// Apply an RFC 6902 JSON patch
    async fn json_patch(&self, key: &ObjectKey, patch: &json_patch::Patch)
        -> Result<(), ClusterError>;

    /// Delete an object, returning `false` if it was already gone
    async fn delete(&self, key: &ObjectKey) -> Result<bool, ClusterError>;

    /// Names of pods in `namespace` matching `label_selector`
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, ClusterError>;
}

/// [`ClusterApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, key: &ObjectKey) -> Api<DynamicObject> {
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &key.resource),
            None => Api::all_with(self.client.clone(), &key.resource),
        }
    }
}

/// Merge and JSON patches are not server-side apply, so only the field manager is set.
fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ClusterError> {
        self.dynamic(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| ClusterError::kube(format!("get {key}"), e))
    }

    async fn create(&self, key: &ObjectKey, object: &DynamicObject) -> Result<(), ClusterError> {
        self.dynamic(key)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| ClusterError::kube(format!("create {key}"), e))?;
        trace!(object = %key, "created");
        Ok(())
    }

    async fn merge_patch(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<(), ClusterError> {
        self.dynamic(key)
            .patch(&key.name, &patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClusterError::kube(format!("merge patch {key}"), e))?;
        trace!(object = %key, "merge patched");
        Ok(())
    }

    async fn json_patch(
        &self,
        key: &ObjectKey,
        patch: &json_patch::Patch,
    ) -> Result<(), ClusterError> {
        self.dynamic(key)
            .patch(
                &key.name,
                &patch_params(),
                &Patch::<()>::Json(patch.clone()),
            )
            .await
            .map_err(|e| ClusterError::kube(format!("json patch {key}"), e))?;
        trace!(object = %key, "json patched");
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, ClusterError> {
        match self.dynamic(key).delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(ClusterError::kube(format!("delete {key}"), e)),
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| ClusterError::kube("list pods", e))?;
        Ok(list.items.iter().map(|p| p.name_any()).collect())
    }
}
