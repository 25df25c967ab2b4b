//! Workbench control service
//!
//! Owns desired state: every API call persists first and then pushes the
//! result to the cluster. Cluster feedback flows back through the watch
//! handler, which only ever records observed state.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use chorus_cluster::names::{parse_workbench_name, parse_workspace_namespace};
use chorus_cluster::{
    AppState, ClusterApp, ClusterError, ClusterWorkbench, HandlerError, WorkbenchRef, WorkbenchEventHandler,
};
use chorus_common::config::WorkbenchServiceConfig;
use chorus_proxy::{RouteCache, RouteKey};

use crate::cluster::{StreamProxy, WorkbenchCluster};
use crate::error::{Result, ServiceError};
use crate::hits::{run_hit_flush, HitBatch};
use crate::idle::run_idle_cleaner;
use crate::model::{
    AppInstance, AppInstanceObservation, K8sAppInstanceState, K8sAppInstanceStatus, K8sWorkbenchStatus, Workbench,
    WorkbenchStatus,
};
use crate::store::{AppCatalog, UserDirectory, WorkbenchStore};

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

/// Collaborators of a [`WorkbenchService`]
#[derive(Clone)]
pub struct ServiceDeps {
    /// Workbench and app-instance persistence
    pub store: Arc<dyn WorkbenchStore>,
    /// App catalog
    pub apps: Arc<dyn AppCatalog>,
    /// User lookup
    pub users: Arc<dyn UserDirectory>,
    /// Cluster writes
    pub cluster: Arc<dyn WorkbenchCluster>,
    /// Stream forwarding
    pub proxy: Arc<dyn StreamProxy>,
    /// Workbench ID to cluster location, shared with the proxy cache
    pub routes: Arc<RouteCache>,
}

/// Reconciles persisted workbenches with the cluster and proxies their streams
#[derive(Clone)]
pub struct WorkbenchService {
    store: Arc<dyn WorkbenchStore>,
    apps: Arc<dyn AppCatalog>,
    users: Arc<dyn UserDirectory>,
    cluster: Arc<dyn WorkbenchCluster>,
    proxy: Arc<dyn StreamProxy>,
    routes: Arc<RouteCache>,
    hits: Arc<HitBatch>,
    config: WorkbenchServiceConfig,
}

impl WorkbenchService {
    /// Create a service; nothing runs until [`WorkbenchService::start`]
    pub fn new(deps: ServiceDeps, config: WorkbenchServiceConfig) -> Self {
        Self {
            store: deps.store,
            apps: deps.apps,
            users: deps.users,
            cluster: deps.cluster,
            proxy: deps.proxy,
            routes: deps.routes,
            hits: Arc::new(HitBatch::new()),
            config,
        }
    }

    /// Pending proxy hits
    pub fn hits(&self) -> &Arc<HitBatch> {
        &self.hits
    }

    /// Handler to register for workbench add and update events
    pub fn watch_handler(&self) -> Arc<dyn WorkbenchEventHandler> {
        Arc::new(self.clone())
    }

    /// Spawn startup reconciliation and the background loops
    ///
    /// The hit flush and idle cleaner run until `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            service.reconcile_all().await;
        }));

        tasks.push(tokio::spawn(run_hit_flush(
            self.hits.clone(),
            self.store.clone(),
            self.config.proxy_hit_save_batch_interval,
            cancel.clone(),
        )));

        if let Some(idle_timeout) = self.config.workbench_idle_timeout {
            tasks.push(tokio::spawn(run_idle_cleaner(
                self.store.clone(),
                self.cluster.clone(),
                idle_timeout,
                self.config.workbench_idle_check_interval,
                cancel,
            )));
        }

        tasks
    }

    // =========================================================================
    // Workbenches
    // =========================================================================

    /// Fetch one workbench
    pub async fn get_workbench(&self, tenant_id: u64, workbench_id: u64) -> Result<Workbench> {
        Ok(self.store.get_workbench(tenant_id, workbench_id).await?)
    }

    /// Workbenches of a tenant, optionally restricted to some workspaces
    pub async fn list_workbenches(&self, tenant_id: u64, workspace_ids: Option<Vec<u64>>) -> Result<Vec<Workbench>> {
        Ok(self.store.list_workbenches(tenant_id, workspace_ids).await?)
    }

    /// Persist a new workbench and create it in the cluster with no apps
    #[instrument(skip(self, workbench), fields(tenant_id = workbench.tenant_id, workspace_id = workbench.workspace_id))]
    pub async fn create_workbench(&self, workbench: Workbench) -> Result<Workbench> {
        let created = self.store.create_workbench(workbench).await?;
        let resource = self.cluster_workbench(&created).await?;
        self.cluster.create_workbench(&resource).await?;
        info!(workbench_id = created.id, "created workbench");
        Ok(created)
    }

    /// Persist workbench changes and resync it
    #[instrument(skip(self, workbench), fields(workbench_id = workbench.id))]
    pub async fn update_workbench(&self, workbench: Workbench) -> Result<Workbench> {
        let updated = self.store.update_workbench(workbench).await?;
        self.sync_workbench(&updated).await?;
        Ok(updated)
    }

    /// Soft-delete a workbench and tear it down in the cluster
    #[instrument(skip(self))]
    pub async fn delete_workbench(&self, tenant_id: u64, workbench_id: u64) -> Result<()> {
        let workbench = self.store.get_workbench(tenant_id, workbench_id).await?;
        self.store.delete_workbench(tenant_id, workbench_id).await?;
        self.routes.remove(&RouteKey::new(tenant_id, workbench_id));

        let target = workbench.cluster_ref();
        self.cluster.delete_workbench(&target.namespace, &target.name).await?;
        info!(workbench = %target, "deleted workbench");
        Ok(())
    }

    /// Push a workbench's desired state to the cluster
    ///
    /// Active workbenches are converged with their stored app instances,
    /// deleted ones are torn down and inactive ones are left alone.
    pub async fn sync_workbench(&self, workbench: &Workbench) -> Result<()> {
        match workbench.status {
            WorkbenchStatus::Active => {
                let instances = self
                    .store
                    .list_workbench_app_instances(workbench.tenant_id, workbench.id)
                    .await?;
                let apps: Vec<ClusterApp> = instances.iter().map(AppInstance::to_cluster_app).collect();
                let resource = self.cluster_workbench(workbench).await?;
                self.cluster.update_workbench(&resource, &apps).await?;
                debug!(workbench_id = workbench.id, apps = apps.len(), "synced workbench");
            }
            WorkbenchStatus::Deleted => {
                let target = workbench.cluster_ref();
                self.cluster.delete_workbench(&target.namespace, &target.name).await?;
                debug!(workbench_id = workbench.id, "deleted workbench");
            }
            WorkbenchStatus::Inactive => {
                debug!(
                    workbench_id = workbench.id,
                    status = workbench.status.as_str(),
                    "skipping workbench update"
                );
            }
        }
        Ok(())
    }

    /// Resync every workbench that isn't soft-deleted, one task each
    ///
    /// Returns the spawned tasks. A failing workbench is logged and does not
    /// affect the others.
    pub async fn reconcile_all(&self) -> Vec<JoinHandle<()>> {
        let workbenches = match self.store.list_all_active_workbenches().await {
            Ok(workbenches) => workbenches,
            Err(e) => {
                error!(error = %e, "unable to query workbenches");
                return Vec::new();
            }
        };
        info!(count = workbenches.len(), "reconciling workbenches");

        workbenches
            .into_iter()
            .map(|workbench| {
                let service = self.clone();
                tokio::spawn(async move {
                    debug!(workbench_id = workbench.id, status = workbench.status.as_str(), "syncing workbench");
                    if let Err(e) = service.sync_workbench(&workbench).await {
                        error!(workbench_id = workbench.id, error = %e, "unable to sync workbench");
                    }
                })
            })
            .collect()
    }

    async fn cluster_workbench(&self, workbench: &Workbench) -> Result<ClusterWorkbench> {
        let user = self.users.get_user(workbench.tenant_id, workbench.user_id).await?;
        let (username, user_id) = match user {
            Some(user) => (user.username, user.id),
            None => (String::new(), workbench.user_id),
        };
        let target = workbench.cluster_ref();
        Ok(ClusterWorkbench {
            namespace: target.namespace,
            name: target.name,
            tenant_id: workbench.tenant_id,
            username,
            user_id,
            initial_resolution_width: workbench.initial_resolution_width,
            initial_resolution_height: workbench.initial_resolution_height,
            ..Default::default()
        })
    }

    // =========================================================================
    // App instances
    // =========================================================================

    /// Fetch one app instance
    pub async fn get_app_instance(&self, tenant_id: u64, instance_id: u64) -> Result<AppInstance> {
        Ok(self.store.get_app_instance(tenant_id, instance_id).await?)
    }

    /// App instances of a tenant
    pub async fn list_app_instances(&self, tenant_id: u64) -> Result<Vec<AppInstance>> {
        Ok(self.store.list_app_instances(tenant_id).await?)
    }

    /// Resolve the catalog app, persist the instance and add it to its workbench
    #[instrument(skip(self, instance), fields(workbench_id = instance.workbench_id, app_id = instance.app_id))]
    pub async fn create_app_instance(&self, mut instance: AppInstance) -> Result<AppInstance> {
        let app = self.apps.get_app(instance.tenant_id, instance.app_id).await?;
        instance.apply_app(&app);
        instance.status = instance.k8s_state.to_status();

        let created = self.store.create_app_instance(instance).await?;
        let target = instance_target(&created);
        self.cluster
            .create_app_instance(&target.namespace, &target.name, &created.to_cluster_app())
            .await?;
        info!(app_instance_id = created.id, workbench = %target, "created app instance");
        Ok(created)
    }

    /// Persist instance changes and upsert its entry in the workbench
    #[instrument(skip(self, instance), fields(app_instance_id = instance.id))]
    pub async fn update_app_instance(&self, mut instance: AppInstance) -> Result<AppInstance> {
        instance.status = instance.k8s_state.to_status();
        let updated = self.store.update_app_instance(instance).await?;
        let target = instance_target(&updated);
        self.cluster
            .update_app_instance(&target.namespace, &target.name, &updated.to_cluster_app())
            .await?;
        Ok(updated)
    }

    /// Remove an instance from the store and from its workbench
    #[instrument(skip(self))]
    pub async fn delete_app_instance(&self, tenant_id: u64, instance_id: u64) -> Result<()> {
        let instance = self.store.get_app_instance(tenant_id, instance_id).await?;
        self.store.delete_app_instance(tenant_id, instance_id).await?;
        let target = instance_target(&instance);
        self.cluster
            .delete_app_instance(&target.namespace, &target.name, &instance.to_cluster_app())
            .await?;
        info!(app_instance_id = instance_id, workbench = %target, "deleted app instance");
        Ok(())
    }

    // =========================================================================
    // Cluster feedback
    // =========================================================================

    /// Record observed state from a watched workbench
    ///
    /// Events the cluster controller hasn't reconciled yet are ignored.
    pub async fn observe_workbench(&self, observed: &ClusterWorkbench) -> Result<()> {
        debug!(
            namespace = %observed.namespace,
            workbench = %observed.name,
            generation = observed.generation,
            observed_generation = observed.observed_generation,
            "watcher received a workbench update"
        );
        if observed.observed_generation != observed.generation {
            debug!(
                namespace = %observed.namespace,
                workbench = %observed.name,
                "skipping updates, controller has not reconciled"
            );
            return Ok(());
        }

        let workbench_id = parse_workbench_name(&observed.name).map_err(|e| invalid_name(&observed.name, e))?;
        let workspace_id =
            parse_workspace_namespace(&observed.namespace).map_err(|e| invalid_name(&observed.namespace, e))?;

        if let Some(status) = K8sWorkbenchStatus::from_server_status(observed.server_status) {
            self.store
                .update_workbench_k8s_status(observed.tenant_id, workbench_id, status)
                .await?;
        }

        let mut observations = Vec::with_capacity(observed.apps.len());
        let mut finished = Vec::new();
        for app in &observed.apps {
            let k8s_status = K8sAppInstanceStatus::from(app.status);
            match k8s_status {
                K8sAppInstanceStatus::Complete => {
                    info!(app_instance_id = app.id, workbench_id, workspace_id, "app instance completed");
                    let stopped = ClusterApp {
                        state: Some(AppState::Stopped),
                        ..app.clone()
                    };
                    self.cluster
                        .update_app_instance(&observed.namespace, &observed.name, &stopped)
                        .await?;
                    finished.push(app.id);
                    continue;
                }
                K8sAppInstanceStatus::Stopped => {
                    info!(app_instance_id = app.id, workbench_id, workspace_id, "app instance stopped");
                    finished.push(app.id);
                    continue;
                }
                K8sAppInstanceStatus::Failed => {
                    warn!(
                        app_instance_id = app.id,
                        workbench_id,
                        message = %app.status_message,
                        "app instance failed, keeping desired state running"
                    );
                }
                _ => {}
            }
            observations.push(AppInstanceObservation {
                id: app.id,
                k8s_status,
                k8s_message: app.status_message.clone(),
                k8s_state: K8sAppInstanceState::Running,
                status: k8s_status.to_status(),
            });
        }

        if !observations.is_empty() {
            self.store.update_app_instances(observations).await?;
        }
        if !finished.is_empty() {
            self.store.delete_app_instances(finished).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Proxying
    // =========================================================================

    /// Forward a stream request to a workbench and count the hit
    pub async fn proxy_workbench(
        &self,
        tenant_id: u64,
        workbench_id: u64,
        request: Request<Body>,
    ) -> Result<Response<Body>> {
        let key = RouteKey::new(tenant_id, workbench_id);
        let cached = self.routes.get(&key).map(|route| route.value().clone());
        let target = match cached {
            Some(target) => target,
            None => {
                debug!(workbench_id, tenant_id, "route cache miss, querying store");
                let workbench = self.store.get_workbench(tenant_id, workbench_id).await?;
                let target = workbench.cluster_ref();
                self.routes.insert(key, target.clone());
                target
            }
        };

        let hits = self.hits.clone();
        tokio::spawn(async move { hits.record(workbench_id) });

        Ok(self.proxy.forward(&target, request).await)
    }
}

#[async_trait]
impl WorkbenchEventHandler for WorkbenchService {
    async fn handle(&self, workbench: &ClusterWorkbench) -> std::result::Result<(), HandlerError> {
        self.observe_workbench(workbench).await.map_err(Into::into)
    }
}

fn instance_target(instance: &AppInstance) -> WorkbenchRef {
    WorkbenchRef::from_ids(instance.workspace_id, instance.workbench_id)
}

fn invalid_name(name: &str, err: ClusterError) -> ServiceError {
    ServiceError::InvalidClusterName {
        name: name.to_string(),
        reason: err.to_string(),
    }
}
