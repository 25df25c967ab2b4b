//! Tests for the workbench control service

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use dashmap::DashMap;

use chorus_cluster::{AppStatus, ClusterError, ServerStatus};
use chorus_common::config::WorkbenchServiceConfig;

use super::*;
use crate::cluster::{MockStreamProxy, MockWorkbenchCluster};
use crate::memory::MemoryStore;
use crate::model::{App, AppInstanceStatus, User};

struct Harness {
    service: WorkbenchService,
    store: Arc<MemoryStore>,
    routes: Arc<RouteCache>,
}

fn harness(cluster: MockWorkbenchCluster, proxy: MockStreamProxy) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.add_user(User {
        id: 5,
        username: "alice".to_string(),
    });
    let routes = Arc::new(DashMap::new());
    let service = WorkbenchService::new(
        ServiceDeps {
            store: store.clone(),
            apps: store.clone(),
            users: store.clone(),
            cluster: Arc::new(cluster),
            proxy: Arc::new(proxy),
            routes: routes.clone(),
        },
        WorkbenchServiceConfig::default(),
    );
    Harness { service, store, routes }
}

fn workbench(status: WorkbenchStatus) -> Workbench {
    Workbench {
        tenant_id: 1,
        user_id: 5,
        workspace_id: 7,
        name: "analysis".to_string(),
        status,
        initial_resolution_width: 1920,
        initial_resolution_height: 1080,
        ..Default::default()
    }
}

async fn seed_workbench(store: &MemoryStore, status: WorkbenchStatus) -> Workbench {
    let created = store.create_workbench(workbench(WorkbenchStatus::Active)).await.unwrap();
    if status == WorkbenchStatus::Active {
        return created;
    }
    store
        .update_workbench(Workbench { status, ..created })
        .await
        .unwrap()
}

async fn seed_instance(store: &MemoryStore, wb: &Workbench, app_name: &str) -> AppInstance {
    store
        .create_app_instance(AppInstance {
            tenant_id: 1,
            workspace_id: wb.workspace_id,
            workbench_id: wb.id,
            app_name: app_name.to_string(),
            image: app_name.to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn observed(wb: &Workbench, apps: Vec<ClusterApp>) -> ClusterWorkbench {
    let target = wb.cluster_ref();
    ClusterWorkbench {
        namespace: target.namespace,
        name: target.name,
        tenant_id: wb.tenant_id,
        generation: 3,
        observed_generation: 3,
        server_status: ServerStatus::Running,
        apps,
        ..Default::default()
    }
}

fn observed_app(instance: &AppInstance, status: AppStatus) -> ClusterApp {
    ClusterApp {
        status,
        status_message: format!("{status:?}"),
        ..instance.to_cluster_app()
    }
}

// =============================================================================
// Workbench lifecycle
// =============================================================================

#[tokio::test]
async fn test_create_persists_then_creates_without_apps() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_create_workbench()
        .withf(|wb| {
            wb.namespace == "workspace7"
                && wb.name == "workbench1"
                && wb.apps.is_empty()
                && wb.username == "alice"
                && wb.user_id == 5
                && wb.initial_resolution_width == 1920
        })
        .times(1)
        .returning(|_| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());

    let created = h.service.create_workbench(workbench(WorkbenchStatus::Active)).await.unwrap();

    assert_eq!(created.id, 1);
    assert!(h.store.get_workbench(1, 1).await.is_ok());
}

#[tokio::test]
async fn test_create_keeps_row_when_cluster_fails() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_create_workbench()
        .returning(|_| Err(ClusterError::tunnel("workspace7/workbench1", "unreachable")));
    let h = harness(cluster, MockStreamProxy::new());

    let err = h
        .service
        .create_workbench(workbench(WorkbenchStatus::Active))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Cluster(_)));
    assert_eq!(h.store.list_workbenches(1, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_active_resyncs_with_stored_apps() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_update_workbench()
        .withf(|wb, apps| {
            wb.name == "workbench1"
                && apps.len() == 2
                && apps.iter().any(|app| app.uid().to_string() == "jupyter-2")
        })
        .times(1)
        .returning(|_, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    seed_instance(&h.store, &wb, "jupyter").await;
    seed_instance(&h.store, &wb, "rstudio").await;

    let updated = h
        .service
        .update_workbench(Workbench {
            description: "renamed".to_string(),
            ..wb
        })
        .await
        .unwrap();

    assert_eq!(updated.description, "renamed");
}

#[tokio::test]
async fn test_update_to_deleted_tears_down() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_delete_workbench()
        .withf(|ns, name| ns == "workspace7" && name == "workbench1")
        .times(1)
        .returning(|_, _| Ok(()));
    cluster.expect_update_workbench().never();
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;

    h.service
        .update_workbench(Workbench {
            status: WorkbenchStatus::Deleted,
            ..wb
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_inactive_touches_nothing_in_cluster() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster.expect_update_workbench().never();
    cluster.expect_delete_workbench().never();
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;

    let updated = h
        .service
        .update_workbench(Workbench {
            status: WorkbenchStatus::Inactive,
            ..wb
        })
        .await
        .unwrap();

    assert_eq!(updated.status, WorkbenchStatus::Inactive);
}

#[tokio::test]
async fn test_delete_soft_deletes_and_forgets_route() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_delete_workbench()
        .withf(|ns, name| ns == "workspace7" && name == "workbench1")
        .times(1)
        .returning(|_, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    h.routes.insert(RouteKey::new(1, wb.id), wb.cluster_ref());

    h.service.delete_workbench(1, wb.id).await.unwrap();

    assert!(h.service.get_workbench(1, wb.id).await.unwrap_err().is_not_found());
    assert!(h.routes.is_empty());
}

#[tokio::test]
async fn test_delete_unknown_workbench_is_not_found() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster.expect_delete_workbench().never();
    let h = harness(cluster, MockStreamProxy::new());

    let err = h.service.delete_workbench(1, 404).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_list_filters_by_workspace() {
    let h = harness(MockWorkbenchCluster::new(), MockStreamProxy::new());
    seed_workbench(&h.store, WorkbenchStatus::Active).await;
    h.store
        .create_workbench(Workbench {
            workspace_id: 8,
            ..workbench(WorkbenchStatus::Active)
        })
        .await
        .unwrap();

    assert_eq!(h.service.list_workbenches(1, None).await.unwrap().len(), 2);
    assert_eq!(h.service.list_workbenches(1, Some(vec![8])).await.unwrap().len(), 1);
    assert!(h.service.list_workbenches(2, None).await.unwrap().is_empty());
}

// =============================================================================
// Startup reconciliation
// =============================================================================

#[tokio::test]
async fn test_reconcile_all_isolates_failures() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_update_workbench()
        .withf(|wb, _| wb.name == "workbench1")
        .times(1)
        .returning(|_, _| Err(ClusterError::tunnel("workspace7/workbench1", "boom")));
    cluster
        .expect_update_workbench()
        .withf(|wb, _| wb.name == "workbench2")
        .times(1)
        .returning(|_, _| Ok(()));
    cluster
        .expect_delete_workbench()
        .withf(|_, name| name == "workbench3")
        .times(1)
        .returning(|_, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    seed_workbench(&h.store, WorkbenchStatus::Active).await;
    seed_workbench(&h.store, WorkbenchStatus::Active).await;
    seed_workbench(&h.store, WorkbenchStatus::Deleted).await;
    seed_workbench(&h.store, WorkbenchStatus::Inactive).await;

    let tasks = h.service.reconcile_all().await;

    assert_eq!(tasks.len(), 4);
    for task in tasks {
        task.await.expect("sync task must not panic");
    }
}

#[tokio::test]
async fn test_reconcile_all_skips_soft_deleted() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster.expect_delete_workbench().never();
    cluster.expect_update_workbench().never();
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    h.store.delete_workbench(1, wb.id).await.unwrap();

    assert!(h.service.reconcile_all().await.is_empty());
}

// =============================================================================
// App instances
// =============================================================================

#[tokio::test]
async fn test_create_app_instance_copies_catalog_and_patches_workbench() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_create_app_instance()
        .withf(|ns, name, app| {
            ns == "workspace7"
                && name == "workbench2"
                && app.uid().to_string() == "jupyter-3"
                && app.image == "jupyter-lab"
                && app.resources.max_cpu == "2"
        })
        .times(1)
        .returning(|_, _, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    let mut app = App {
        tenant_id: 1,
        name: "jupyter".to_string(),
        image: "jupyter-lab".to_string(),
        tag: "4.1".to_string(),
        ..Default::default()
    };
    app.resources.max_cpu = "2".to_string();
    let app = h.store.add_app(app);
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;

    let created = h
        .service
        .create_app_instance(AppInstance {
            tenant_id: 1,
            app_id: app.id,
            workspace_id: wb.workspace_id,
            workbench_id: wb.id,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(created.app_name, "jupyter");
    assert_eq!(created.tag, "4.1");
    assert_eq!(created.status, AppInstanceStatus::Active);
}

#[tokio::test]
async fn test_create_app_instance_unknown_app_persists_nothing() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster.expect_create_app_instance().never();
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;

    let err = h
        .service
        .create_app_instance(AppInstance {
            tenant_id: 1,
            app_id: 99,
            workbench_id: wb.id,
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(h.service.list_app_instances(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_app_instance_upserts_entry() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_update_app_instance()
        .withf(|_, _, app| app.state == Some(AppState::Stopped))
        .times(1)
        .returning(|_, _, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    let instance = seed_instance(&h.store, &wb, "jupyter").await;

    let updated = h
        .service
        .update_app_instance(AppInstance {
            k8s_state: K8sAppInstanceState::Stopped,
            ..instance
        })
        .await
        .unwrap();

    assert_eq!(updated.status, AppInstanceStatus::Inactive);
}

#[tokio::test]
async fn test_delete_app_instance_removes_by_uid() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_delete_app_instance()
        .withf(|ns, name, app| ns == "workspace7" && name == "workbench1" && app.uid().to_string() == "jupyter-2")
        .times(1)
        .returning(|_, _, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    let instance = seed_instance(&h.store, &wb, "jupyter").await;

    h.service.delete_app_instance(1, instance.id).await.unwrap();

    assert!(h.service.get_app_instance(1, instance.id).await.unwrap_err().is_not_found());
}

// =============================================================================
// Cluster feedback
// =============================================================================

#[tokio::test]
async fn test_stale_generation_is_ignored() {
    let h = harness(MockWorkbenchCluster::new(), MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    let instance = seed_instance(&h.store, &wb, "jupyter").await;

    let mut event = observed(&wb, vec![observed_app(&instance, AppStatus::Running)]);
    event.generation = 4;
    h.service.observe_workbench(&event).await.unwrap();

    let stored = h.store.get_workbench(1, wb.id).await.unwrap();
    assert_eq!(stored.k8s_status, None);
    let stored = h.store.get_app_instance(1, instance.id).await.unwrap();
    assert_eq!(stored.k8s_status, K8sAppInstanceStatus::Unknown);
}

#[tokio::test]
async fn test_observed_state_updates_status_only() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_update_app_instance()
        .withf(|ns, name, app| {
            ns == "workspace7" && name == "workbench1" && app.id == 4 && app.state == Some(AppState::Stopped)
        })
        .times(1)
        .returning(|_, _, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    let running = seed_instance(&h.store, &wb, "jupyter").await;
    let failed = seed_instance(&h.store, &wb, "rstudio").await;
    let complete = seed_instance(&h.store, &wb, "batch").await;
    let stopped = seed_instance(&h.store, &wb, "viewer").await;

    let event = observed(
        &wb,
        vec![
            observed_app(&running, AppStatus::Running),
            observed_app(&failed, AppStatus::Failed),
            observed_app(&complete, AppStatus::Complete),
            observed_app(&stopped, AppStatus::Stopped),
        ],
    );
    h.service.observe_workbench(&event).await.unwrap();

    let stored = h.store.get_workbench(1, wb.id).await.unwrap();
    assert_eq!(stored.k8s_status, Some(K8sWorkbenchStatus::Running));
    assert_eq!(stored.status, WorkbenchStatus::Active);
    assert_eq!(stored.name, "analysis");

    let stored = h.store.get_app_instance(1, running.id).await.unwrap();
    assert_eq!(stored.status, AppInstanceStatus::Active);
    assert_eq!(stored.k8s_message, "Running");

    let stored = h.store.get_app_instance(1, failed.id).await.unwrap();
    assert_eq!(stored.k8s_status, K8sAppInstanceStatus::Failed);
    assert_eq!(stored.k8s_state, K8sAppInstanceState::Running);
    assert_eq!(stored.status, AppInstanceStatus::Deleted);

    assert!(h.store.get_app_instance(1, complete.id).await.is_err());
    assert!(h.store.get_app_instance(1, stopped.id).await.is_err());
}

#[tokio::test]
async fn test_unknown_server_status_leaves_workbench_untouched() {
    let h = harness(MockWorkbenchCluster::new(), MockStreamProxy::new());
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;
    let mut event = observed(&wb, Vec::new());
    event.server_status = ServerStatus::Unknown;

    h.service.observe_workbench(&event).await.unwrap();

    assert_eq!(h.store.get_workbench(1, wb.id).await.unwrap().k8s_status, None);
}

#[tokio::test]
async fn test_malformed_name_is_typed_error() {
    let h = harness(MockWorkbenchCluster::new(), MockStreamProxy::new());
    let event = ClusterWorkbench {
        namespace: "workspace7".to_string(),
        name: "notebook42".to_string(),
        ..Default::default()
    };

    let err = h.service.observe_workbench(&event).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidClusterName { ref name, .. } if name == "notebook42"));

    let handler = h.service.watch_handler();
    assert!(handler.handle(&event).await.is_err());
}

// =============================================================================
// Proxying
// =============================================================================

async fn wait_for_hits(service: &WorkbenchService, workbench_id: u64, expected: u64) {
    let mut seen = 0;
    for _ in 0..50 {
        let (counts, _) = service.hits().take();
        seen += counts.get(&workbench_id).copied().unwrap_or_default();
        if seen >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_proxy_resolves_route_once_and_counts_hits() {
    let mut proxy = MockStreamProxy::new();
    proxy
        .expect_forward()
        .withf(|target, request| {
            target.namespace == "workspace7"
                && target.name == "workbench1"
                && request.uri().path() == "/api/rest/v1/workbenches/1/stream/vnc"
        })
        .times(2)
        .returning(|_, _| Response::new(Body::from("frame")));
    let h = harness(MockWorkbenchCluster::new(), proxy);
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;

    let request = || {
        Request::builder()
            .uri("/api/rest/v1/workbenches/1/stream/vnc")
            .body(Body::empty())
            .unwrap()
    };
    let response = h.service.proxy_workbench(1, wb.id, request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        h.routes.get(&RouteKey::new(1, wb.id)).map(|r| r.value().clone()),
        Some(wb.cluster_ref())
    );

    // Served from the route cache even after the row is gone
    h.store.delete_workbench(1, wb.id).await.unwrap();
    h.service.proxy_workbench(1, wb.id, request()).await.unwrap();

    wait_for_hits(&h.service, wb.id, 2).await;
}

#[tokio::test]
async fn test_cached_route_is_not_shared_across_tenants() {
    let mut proxy = MockStreamProxy::new();
    proxy
        .expect_forward()
        .times(1)
        .returning(|_, _| Response::new(Body::from("frame")));
    let h = harness(MockWorkbenchCluster::new(), proxy);
    let wb = seed_workbench(&h.store, WorkbenchStatus::Active).await;

    h.service
        .proxy_workbench(1, wb.id, Request::new(Body::empty()))
        .await
        .unwrap();

    let err = h
        .service
        .proxy_workbench(2, wb.id, Request::new(Body::empty()))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(h.routes.get(&RouteKey::new(2, wb.id)).is_none());
}

#[tokio::test]
async fn test_proxy_unknown_workbench_is_not_found() {
    let mut proxy = MockStreamProxy::new();
    proxy.expect_forward().never();
    let h = harness(MockWorkbenchCluster::new(), proxy);

    let err = h
        .service
        .proxy_workbench(1, 42, Request::new(Body::empty()))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(h.routes.is_empty());
}

#[tokio::test]
async fn test_start_runs_reconciliation() {
    let mut cluster = MockWorkbenchCluster::new();
    cluster
        .expect_update_workbench()
        .times(1)
        .returning(|_, _| Ok(()));
    let h = harness(cluster, MockStreamProxy::new());
    seed_workbench(&h.store, WorkbenchStatus::Active).await;

    let cancel = CancellationToken::new();
    let tasks = h.service.start(cancel.clone());
    assert_eq!(tasks.len(), 2, "idle cleaner is off without a timeout");

    let mut tasks = tasks.into_iter();
    if let Some(reconcile) = tasks.next() {
        reconcile.await.unwrap();
    }
    // Let the per-workbench sync task run before the mock is checked
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}
