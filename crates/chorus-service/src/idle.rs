//! Idle workbench cleanup

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cluster::WorkbenchCluster;
use crate::hits::jitter;
use crate::store::WorkbenchStore;

/// Mark idle workbenches deleted and tear each one down on its own task
///
/// Returns the spawned teardown tasks.
pub async fn clean_idle_workbenches(
    store: &dyn WorkbenchStore,
    cluster: Arc<dyn WorkbenchCluster>,
    idle_timeout: Duration,
) -> Vec<JoinHandle<()>> {
    let workbenches = match store.delete_idle_workbenches(idle_timeout).await {
        Ok(workbenches) => workbenches,
        Err(e) => {
            error!(error = %e, "unable to query idle workbenches");
            return Vec::new();
        }
    };

    workbenches
        .into_iter()
        .map(|wb| {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                debug!(workbench_id = wb.id, status = wb.status.as_str(), "cleaning idle workbench");
                let target = wb.cluster_ref();
                if let Err(e) = cluster.delete_workbench(&target.namespace, &target.name).await {
                    error!(workbench_id = wb.id, error = %e, "unable to delete idle workbench");
                }
            })
        })
        .collect()
}

/// Run [`clean_idle_workbenches`] every `interval` until cancelled
///
/// The first pass waits a random delay within `interval` so replicas don't
/// clean in lockstep.
pub async fn run_idle_cleaner(
    store: Arc<dyn WorkbenchStore>,
    cluster: Arc<dyn WorkbenchCluster>,
    idle_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        idle_timeout_secs = idle_timeout.as_secs(),
        check_interval_secs = interval.as_secs(),
        "starting workbench idle cleaner"
    );

    let mut delay = jitter(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {
                clean_idle_workbenches(store.as_ref(), cluster.clone(), idle_timeout).await;
            }
        }
        delay = interval;
    }
    info!("workbench idle cleaner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockWorkbenchCluster;
    use crate::model::Workbench;
    use crate::store::{MockWorkbenchStore, StoreError};
    use chorus_cluster::ClusterError;

    fn idle(id: u64) -> Workbench {
        Workbench {
            id,
            workspace_id: 7,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_each_idle_workbench_is_deleted_independently() {
        let mut store = MockWorkbenchStore::new();
        store
            .expect_delete_idle_workbenches()
            .withf(|timeout| *timeout == Duration::from_secs(600))
            .returning(|_| Ok(vec![idle(1), idle(2)]));

        let mut cluster = MockWorkbenchCluster::new();
        cluster
            .expect_delete_workbench()
            .withf(|ns, name| ns == "workspace7" && name == "workbench1")
            .times(1)
            .returning(|_, _| Err(ClusterError::tunnel("workspace7/workbench1", "boom")));
        cluster
            .expect_delete_workbench()
            .withf(|ns, name| ns == "workspace7" && name == "workbench2")
            .times(1)
            .returning(|_, _| Ok(()));

        let handles = clean_idle_workbenches(&store, Arc::new(cluster), Duration::from_secs(600)).await;
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.expect("teardown task must not panic");
        }
    }

    #[tokio::test]
    async fn test_store_failure_spawns_nothing() {
        let mut store = MockWorkbenchStore::new();
        store
            .expect_delete_idle_workbenches()
            .returning(|_| Err(StoreError::backend("down")));
        let mut cluster = MockWorkbenchCluster::new();
        cluster.expect_delete_workbench().never();

        let handles = clean_idle_workbenches(&store, Arc::new(cluster), Duration::from_secs(1)).await;
        assert!(handles.is_empty());
    }

    #[tokio::test]
    async fn test_cleaner_stops_on_cancel() {
        let mut store = MockWorkbenchStore::new();
        store.expect_delete_idle_workbenches().never();
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_idle_cleaner(
            Arc::new(store),
            Arc::new(MockWorkbenchCluster::new()),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            cancel,
        )
        .await;
    }
}
