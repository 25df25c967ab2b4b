//! Idempotent workbench synchronization against the cluster
//!
//! Every operation here is safe to repeat. Syncs only write when the target
//! field differs from the desired value, app instances are added and removed
//! with single targeted JSON patches, and deletes treat "already gone" as
//! success.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use json_patch::{AddOperation, PatchOperation, RemoveOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use chorus_common::config::{ImagePullSecret, K8sClientConfig};
use chorus_common::kube_utils::poll_until;
use chorus_common::metrics::record_sync;

use crate::api::{ClusterApi, ObjectKey};
use crate::codec::{ClusterApp, ClusterWorkbench, CodecConfig};
use crate::crd::{Workbench, CREATED_BY_LABEL, CREATED_BY_VALUE, TENANT_ID_LABEL, WORKBENCH_KIND};
use crate::error::ClusterError;
use crate::kind_resolver::KindResolver;
use crate::merge::{is_empty_patch, merge_diff};
use crate::watch::{run_workbench_watch, WatchHandlers, WorkbenchEventHandler};

/// Interval between existence checks while waiting for a delete
pub const DELETE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound on waiting for a delete to complete
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(300);

/// Label selecting the pods of a workbench
pub const WORKBENCH_POD_LABEL: &str = "workbench";

const SECRET_KIND: &str = "Secret";
const DOCKER_CONFIG_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// What a sync did to the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Object did not exist and was created
    Created,
    /// Object existed and the target field was patched
    Patched,
    /// Object already matched
    Unchanged,
}

/// Cluster adapter for workbenches and their workspaces
pub struct ClusterAdapter {
    api: Arc<dyn ClusterApi>,
    resolver: Arc<dyn KindResolver>,
    codec: CodecConfig,
    pull_secrets: Vec<ImagePullSecret>,
    pull_secret_name: String,
    handlers: Arc<WatchHandlers>,
    delete_timeout: Duration,
    delete_poll_interval: Duration,
}

impl ClusterAdapter {
    /// Create an adapter from the cluster client configuration
    pub fn new(
        api: Arc<dyn ClusterApi>,
        resolver: Arc<dyn KindResolver>,
        config: &K8sClientConfig,
    ) -> Self {
        Self {
            api,
            resolver,
            codec: CodecConfig::from_client_config(config),
            pull_secrets: config.image_pull_secrets.clone(),
            pull_secret_name: config.image_pull_secret_name.clone(),
            handlers: Arc::new(WatchHandlers::new()),
            delete_timeout: DELETE_TIMEOUT,
            delete_poll_interval: DELETE_POLL_INTERVAL,
        }
    }

    /// Override delete polling (tests use millisecond values)
    pub fn with_delete_polling(mut self, timeout: Duration, interval: Duration) -> Self {
        self.delete_timeout = timeout;
        self.delete_poll_interval = interval;
        self
    }

    /// Codec settings used for encoding
    pub fn codec(&self) -> &CodecConfig {
        &self.codec
    }

    // =========================================================================
    // Watch handler registration
    // =========================================================================

    /// Register a handler for newly observed workbenches
    pub fn on_new_workbench(&self, handler: Arc<dyn WorkbenchEventHandler>) {
        self.handlers.on_add(handler);
    }

    /// Register a handler for updated workbenches
    pub fn on_update_workbench(&self, handler: Arc<dyn WorkbenchEventHandler>) {
        self.handlers.on_update(handler);
    }

    /// Register a handler for deleted workbenches
    pub fn on_delete_workbench(&self, handler: Arc<dyn WorkbenchEventHandler>) {
        self.handlers.on_delete(handler);
    }

    /// Run the workbench watch with the registered handlers until cancelled
    pub async fn run_watch(
        &self,
        client: Client,
        cancel: CancellationToken,
    ) -> Result<(), ClusterError> {
        run_workbench_watch(
            client,
            self.resolver.clone(),
            self.handlers.clone(),
            self.codec.clone(),
            cancel,
        )
        .await
    }

    // =========================================================================
    // Workspace namespaces
    // =========================================================================

    /// Make sure the workspace namespace exists; existing namespaces are left alone
    #[instrument(skip(self))]
    pub async fn sync_namespace(&self, tenant_id: u64, namespace: &str) -> Result<SyncOutcome, ClusterError> {
        let ar = ApiResource::erase::<Namespace>(&());
        let key = ObjectKey::cluster_scoped(ar.clone(), namespace);
        if self.api.get(&key).await?.is_some() {
            return Ok(SyncOutcome::Unchanged);
        }

        let mut ns = DynamicObject::new(namespace, &ar);
        ns.metadata.labels = Some(chorus_labels(tenant_id));
        match self.api.create(&key, &ns).await {
            Ok(()) => {
                info!(namespace = %namespace, "created workspace namespace");
                Ok(SyncOutcome::Created)
            }
            Err(e) if e.is_conflict() => Ok(SyncOutcome::Unchanged),
            Err(e) => Err(e),
        }
    }

    /// Delete a namespace and wait until it is gone
    #[instrument(skip(self))]
    pub async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let key = ObjectKey::cluster_scoped(ApiResource::erase::<Namespace>(&()), namespace);
        self.delete_and_wait(&key).await
    }

    // =========================================================================
    // Image pull secret
    // =========================================================================

    /// Sync the registry pull secret into a namespace
    ///
    /// No-op when no registries are configured. Only the secret's `data` is
    /// reconciled.
    #[instrument(skip(self))]
    pub async fn sync_image_pull_secret(&self, namespace: &str) -> Result<SyncOutcome, ClusterError> {
        if self.pull_secrets.is_empty() {
            return Ok(SyncOutcome::Unchanged);
        }

        let docker_config = docker_config_json(&self.pull_secrets)?;
        let b64 = base64::engine::general_purpose::STANDARD;
        let secret = json!({
            "apiVersion": "v1",
            "kind": SECRET_KIND,
            "metadata": { "name": self.pull_secret_name, "namespace": namespace },
            "type": DOCKER_CONFIG_TYPE,
            "data": { DOCKER_CONFIG_KEY: b64.encode(docker_config.as_bytes()) },
        });
        let desired: DynamicObject = serde_json::from_value(secret)
            .map_err(|e| ClusterError::serialization(SECRET_KIND, e))?;

        self.sync_resource(&desired, SECRET_KIND, &self.pull_secret_name, namespace, "data")
            .await
    }

    // =========================================================================
    // Generic sync primitive
    // =========================================================================

    /// Create `desired` if absent, otherwise merge-patch `field` to its desired value
    ///
    /// The patch contains only the differences, so an unchanged field issues
    /// no write at all.
    #[instrument(skip(self, desired))]
    pub async fn sync_resource(
        &self,
        desired: &DynamicObject,
        kind: &str,
        name: &str,
        namespace: &str,
        field: &str,
    ) -> Result<SyncOutcome, ClusterError> {
        let ar = self.resolve(kind).await?;
        let key = ObjectKey::namespaced(ar, namespace, name);

        let Some(existing) = self.api.get(&key).await? else {
            self.api.create(&key, desired).await?;
            debug!(object = %key, "created");
            return Ok(SyncOutcome::Created);
        };

        let Some(desired_field) = desired.data.get(field) else {
            return Ok(SyncOutcome::Unchanged);
        };

        let field_patch = match existing.data.get(field) {
            Some(current) => merge_diff(current, desired_field),
            None => desired_field.clone(),
        };
        if is_empty_patch(&field_patch) {
            debug!(object = %key, field = %field, "already in sync");
            return Ok(SyncOutcome::Unchanged);
        }

        let mut patch = serde_json::Map::new();
        patch.insert(field.to_string(), field_patch);
        self.api.merge_patch(&key, &Value::Object(patch)).await?;
        debug!(object = %key, field = %field, "patched");
        Ok(SyncOutcome::Patched)
    }

    // =========================================================================
    // Workbenches
    // =========================================================================

    /// Sync the namespace, pull secret and spec of an encoded workbench
    #[instrument(skip(self, resource), fields(namespace = tracing::field::Empty, workbench = %resource.name_any()))]
    pub async fn sync_workbench(&self, resource: &Workbench) -> Result<SyncOutcome, ClusterError> {
        let result = self.sync_workbench_inner(resource).await;
        record_sync("sync", result.is_ok());
        result
    }

    async fn sync_workbench_inner(&self, resource: &Workbench) -> Result<SyncOutcome, ClusterError> {
        let name = resource.name_any();
        let namespace = resource.namespace().ok_or_else(|| {
            ClusterError::serialization(WORKBENCH_KIND, format!("workbench {name} has no namespace"))
        })?;
        tracing::Span::current().record("namespace", namespace.as_str());

        let tenant_id = resource
            .labels()
            .get(TENANT_ID_LABEL)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ClusterError::MissingLabel {
                label: TENANT_ID_LABEL.to_string(),
            })?;

        self.sync_namespace(tenant_id, &namespace).await?;

        if let Err(e) = self.sync_image_pull_secret(&namespace).await {
            warn!(
                namespace = %namespace,
                workbench = %name,
                secret = %self.pull_secret_name,
                error = %e,
                "failed to sync image pull secret, continuing"
            );
        }

        let desired: DynamicObject = serde_json::to_value(resource)
            .and_then(serde_json::from_value)
            .map_err(|e| ClusterError::serialization(WORKBENCH_KIND, e))?;
        self.sync_resource(&desired, WORKBENCH_KIND, &name, &namespace, "spec")
            .await
    }

    /// Encode and sync a new workbench with no apps
    pub async fn create_workbench(&self, workbench: &ClusterWorkbench) -> Result<SyncOutcome, ClusterError> {
        self.update_workbench(workbench, &[]).await
    }

    /// Encode and sync a workbench with the given app instances
    pub async fn update_workbench(
        &self,
        workbench: &ClusterWorkbench,
        apps: &[ClusterApp],
    ) -> Result<SyncOutcome, ClusterError> {
        let with_apps = ClusterWorkbench {
            apps: apps.to_vec(),
            ..workbench.clone()
        };
        let resource = self.codec.to_cluster_workbench(&with_apps)?;
        self.sync_workbench(&resource).await
    }

    /// Delete a workbench and wait until it is gone
    #[instrument(skip(self))]
    pub async fn delete_workbench(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let result = async {
            let key = ObjectKey::namespaced(self.resolve(WORKBENCH_KIND).await?, namespace, name);
            self.delete_and_wait(&key).await
        }
        .await;
        record_sync("delete", result.is_ok());
        result
    }

    // =========================================================================
    // App instances
    // =========================================================================

    /// Add one app instance to a workbench with a single JSON patch
    #[instrument(skip(self, app), fields(app_uid = %app.uid()))]
    pub async fn create_app_instance(
        &self,
        namespace: &str,
        name: &str,
        app: &ClusterApp,
    ) -> Result<(), ClusterError> {
        let key = self.workbench_key(namespace, name).await?;
        let existing = self.require_workbench(&key).await?;

        let uid = app.uid().to_string();
        let entry = value_of(self.codec.to_cluster_app(app)?)?;

        let op = match existing.data.get("spec") {
            None | Some(Value::Null) => add(&["spec"], json!({ "apps": { uid.as_str(): entry } })),
            Some(spec) if spec.get("apps").map_or(true, Value::is_null) => {
                add(&["spec", "apps"], json!({ uid.as_str(): entry }))
            }
            Some(_) => add(&["spec", "apps", uid.as_str()], entry),
        };

        self.api.json_patch(&key, &json_patch::Patch(vec![op])).await?;
        info!(namespace = %namespace, workbench = %name, app_uid = %uid, "added app instance");
        Ok(())
    }

    /// Upsert one app instance entry, e.g. to flip its desired state
    #[instrument(skip(self, app), fields(app_uid = %app.uid()))]
    pub async fn update_app_instance(
        &self,
        namespace: &str,
        name: &str,
        app: &ClusterApp,
    ) -> Result<(), ClusterError> {
        let key = self.workbench_key(namespace, name).await?;
        let uid = app.uid().to_string();
        let entry = value_of(self.codec.to_cluster_app(app)?)?;

        let op = add(&["spec", "apps", uid.as_str()], entry);
        self.api.json_patch(&key, &json_patch::Patch(vec![op])).await?;
        debug!(namespace = %namespace, workbench = %name, app_uid = %uid, "updated app instance");
        Ok(())
    }

    /// Remove one app instance entry; absent workbench or entry is success
    #[instrument(skip(self, app), fields(app_uid = %app.uid()))]
    pub async fn delete_app_instance(
        &self,
        namespace: &str,
        name: &str,
        app: &ClusterApp,
    ) -> Result<(), ClusterError> {
        let key = self.workbench_key(namespace, name).await?;
        let Some(existing) = self.api.get(&key).await? else {
            debug!(namespace = %namespace, workbench = %name, "workbench already gone");
            return Ok(());
        };

        let uid = app.uid().to_string();
        let present = existing
            .data
            .get("spec")
            .and_then(|spec| spec.get("apps"))
            .and_then(|apps| apps.get(&uid))
            .is_some();
        if !present {
            debug!(namespace = %namespace, workbench = %name, app_uid = %uid, "app instance already gone");
            return Ok(());
        }

        let op = PatchOperation::Remove(RemoveOperation {
            path: PointerBuf::from_tokens(["spec", "apps", uid.as_str()]),
        });
        self.api.json_patch(&key, &json_patch::Patch(vec![op])).await?;
        info!(namespace = %namespace, workbench = %name, app_uid = %uid, "removed app instance");
        Ok(())
    }

    // =========================================================================
    // Pods
    // =========================================================================

    /// Name of the first pod running a workbench
    pub async fn workbench_pod_name(&self, namespace: &str, name: &str) -> Result<String, ClusterError> {
        let selector = format!("{WORKBENCH_POD_LABEL}={name}");
        self.api
            .list_pods(namespace, &selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::PodNotFound {
                namespace: namespace.to_string(),
                workbench: name.to_string(),
            })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn resolve(&self, kind: &str) -> Result<ApiResource, ClusterError> {
        self.resolver
            .resolve(kind)
            .await
            .ok_or_else(|| ClusterError::KindNotFound {
                kind: kind.to_string(),
            })
    }

    async fn workbench_key(&self, namespace: &str, name: &str) -> Result<ObjectKey, ClusterError> {
        Ok(ObjectKey::namespaced(self.resolve(WORKBENCH_KIND).await?, namespace, name))
    }

    async fn require_workbench(&self, key: &ObjectKey) -> Result<DynamicObject, ClusterError> {
        self.api
            .get(key)
            .await?
            .ok_or_else(|| ClusterError::WorkbenchNotFound {
                namespace: key.namespace.clone().unwrap_or_default(),
                name: key.name.clone(),
            })
    }

    async fn delete_and_wait(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        if self.api.get(key).await?.is_none() {
            debug!(object = %key, "already deleted");
            return Ok(());
        }
        if !self.api.delete(key).await? {
            debug!(object = %key, "already deleted");
            return Ok(());
        }

        let api = self.api.clone();
        poll_until(
            self.delete_timeout,
            self.delete_poll_interval,
            format!("{key} still present after {:?}", self.delete_timeout),
            || {
                let api = api.clone();
                let key = key.clone();
                async move {
                    match api.get(&key).await {
                        Ok(found) => Ok(found.is_none()),
                        Err(e) if e.is_not_found() => Ok(true),
                        Err(e) => Err(chorus_common::Error::internal_with_context(
                            "delete_and_wait",
                            e.to_string(),
                        )),
                    }
                }
            },
        )
        .await?;
        info!(object = %key, "deleted");
        Ok(())
    }
}

fn chorus_labels(tenant_id: u64) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string()),
        (TENANT_ID_LABEL.to_string(), tenant_id.to_string()),
    ])
}

fn add(tokens: &[&str], value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(tokens.iter().copied()),
        value,
    })
}

fn value_of(app: crate::crd::WorkbenchApp) -> Result<Value, ClusterError> {
    serde_json::to_value(app).map_err(|e| ClusterError::serialization(WORKBENCH_KIND, e))
}

/// Docker `config.json` with one `auths` entry per registry
pub fn docker_config_json(entries: &[ImagePullSecret]) -> Result<String, ClusterError> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let auths: serde_json::Map<String, Value> = entries
        .iter()
        .map(|entry| {
            let auth = b64.encode(format!("{}:{}", entry.username, entry.password.expose()));
            (entry.registry.clone(), json!({ "auth": auth }))
        })
        .collect();
    serde_json::to_string_pretty(&json!({ "auths": auths }))
        .map_err(|e| ClusterError::serialization(SECRET_KIND, e))
}
