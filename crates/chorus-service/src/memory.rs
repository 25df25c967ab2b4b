//! In-process store
//!
//! Holds every table behind one lock so each trait call is atomic. IDs are
//! assigned from a single counter shared by all tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    App, AppInstance, AppInstanceObservation, K8sWorkbenchStatus, User, Workbench, WorkbenchStatus,
};
use crate::store::{AppCatalog, StoreError, UserDirectory, WorkbenchStore};

#[derive(Default)]
struct Tables {
    next_id: u64,
    workbenches: BTreeMap<u64, Workbench>,
    app_instances: BTreeMap<u64, AppInstance>,
    apps: HashMap<u64, App>,
    users: HashMap<u64, User>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Store keeping all rows in memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a catalog app, assigning an ID when it has none
    pub fn add_app(&self, mut app: App) -> App {
        let mut tables = self.write();
        if app.id == 0 {
            app.id = tables.allocate_id();
        }
        tables.apps.insert(app.id, app.clone());
        app
    }

    /// Register a user
    pub fn add_user(&self, user: User) {
        self.write().users.insert(user.id, user);
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn owned_workbench<'a>(
    tables: &'a mut Tables,
    tenant_id: u64,
    id: u64,
) -> Result<&'a mut Workbench, StoreError> {
    tables
        .workbenches
        .get_mut(&id)
        .filter(|wb| wb.tenant_id == tenant_id && wb.deleted_at.is_none())
        .ok_or_else(|| StoreError::not_found("workbench", id))
}

fn owned_instance<'a>(
    tables: &'a mut Tables,
    tenant_id: u64,
    id: u64,
) -> Result<&'a mut AppInstance, StoreError> {
    tables
        .app_instances
        .get_mut(&id)
        .filter(|instance| instance.tenant_id == tenant_id)
        .ok_or_else(|| StoreError::not_found("app instance", id))
}

#[async_trait]
impl WorkbenchStore for MemoryStore {
    async fn get_workbench(&self, tenant_id: u64, id: u64) -> Result<Workbench, StoreError> {
        self.read()
            .workbenches
            .get(&id)
            .filter(|wb| wb.tenant_id == tenant_id && wb.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| StoreError::not_found("workbench", id))
    }

    async fn list_workbenches(
        &self,
        tenant_id: u64,
        workspace_ids: Option<Vec<u64>>,
    ) -> Result<Vec<Workbench>, StoreError> {
        Ok(self
            .read()
            .workbenches
            .values()
            .filter(|wb| wb.tenant_id == tenant_id && wb.deleted_at.is_none())
            .filter(|wb| {
                workspace_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&wb.workspace_id))
            })
            .cloned()
            .collect())
    }

    async fn list_all_active_workbenches(&self) -> Result<Vec<Workbench>, StoreError> {
        Ok(self
            .read()
            .workbenches
            .values()
            .filter(|wb| wb.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn create_workbench(&self, mut workbench: Workbench) -> Result<Workbench, StoreError> {
        let mut tables = self.write();
        let now = Utc::now();
        workbench.id = tables.allocate_id();
        workbench.created_at = now;
        workbench.updated_at = now;
        workbench.deleted_at = None;
        tables.workbenches.insert(workbench.id, workbench.clone());
        Ok(workbench)
    }

    async fn update_workbench(&self, workbench: Workbench) -> Result<Workbench, StoreError> {
        let mut tables = self.write();
        let stored = owned_workbench(&mut tables, workbench.tenant_id, workbench.id)?;
        stored.name = workbench.name;
        stored.short_name = workbench.short_name;
        stored.description = workbench.description;
        stored.status = workbench.status;
        stored.initial_resolution_width = workbench.initial_resolution_width;
        stored.initial_resolution_height = workbench.initial_resolution_height;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn update_workbench_k8s_status(
        &self,
        tenant_id: u64,
        id: u64,
        status: K8sWorkbenchStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.write();
        let stored = owned_workbench(&mut tables, tenant_id, id)?;
        stored.k8s_status = Some(status);
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_workbench(&self, tenant_id: u64, id: u64) -> Result<(), StoreError> {
        let mut tables = self.write();
        let now = Utc::now();
        let stored = owned_workbench(&mut tables, tenant_id, id)?;
        stored.status = WorkbenchStatus::Deleted;
        stored.deleted_at = Some(now);
        stored.updated_at = now;
        tables.app_instances.retain(|_, instance| instance.workbench_id != id);
        Ok(())
    }

    async fn delete_idle_workbenches(&self, idle_timeout: Duration) -> Result<Vec<Workbench>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_timeout).map_err(|e| StoreError::backend(e.to_string()))?;
        let mut tables = self.write();
        let mut marked = Vec::new();
        for wb in tables.workbenches.values_mut() {
            let idle = wb.accessed_at.is_some_and(|at| at < cutoff);
            if idle && wb.status != WorkbenchStatus::Deleted && wb.deleted_at.is_none() {
                wb.status = WorkbenchStatus::Deleted;
                wb.updated_at = Utc::now();
                marked.push(wb.clone());
            }
        }
        Ok(marked)
    }

    async fn save_batch_proxy_hit(
        &self,
        counts: HashMap<u64, u64>,
        last_hits: HashMap<u64, DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write();
        for (id, count) in counts {
            if let Some(wb) = tables.workbenches.get_mut(&id) {
                wb.accessed_count += count;
                if let Some(at) = last_hits.get(&id) {
                    wb.accessed_at = Some(wb.accessed_at.map_or(*at, |prev| prev.max(*at)));
                }
            }
        }
        Ok(())
    }

    async fn get_app_instance(&self, tenant_id: u64, id: u64) -> Result<AppInstance, StoreError> {
        self.read()
            .app_instances
            .get(&id)
            .filter(|instance| instance.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("app instance", id))
    }

    async fn list_app_instances(&self, tenant_id: u64) -> Result<Vec<AppInstance>, StoreError> {
        Ok(self
            .read()
            .app_instances
            .values()
            .filter(|instance| instance.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn list_workbench_app_instances(
        &self,
        tenant_id: u64,
        workbench_id: u64,
    ) -> Result<Vec<AppInstance>, StoreError> {
        Ok(self
            .read()
            .app_instances
            .values()
            .filter(|instance| instance.tenant_id == tenant_id && instance.workbench_id == workbench_id)
            .cloned()
            .collect())
    }

    async fn create_app_instance(&self, mut instance: AppInstance) -> Result<AppInstance, StoreError> {
        let mut tables = self.write();
        owned_workbench(&mut tables, instance.tenant_id, instance.workbench_id)?;
        instance.id = tables.allocate_id();
        tables.app_instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn update_app_instance(&self, instance: AppInstance) -> Result<AppInstance, StoreError> {
        let mut tables = self.write();
        let stored = owned_instance(&mut tables, instance.tenant_id, instance.id)?;
        *stored = instance;
        Ok(stored.clone())
    }

    async fn update_app_instances(&self, observations: Vec<AppInstanceObservation>) -> Result<(), StoreError> {
        let mut tables = self.write();
        for observed in observations {
            if let Some(stored) = tables.app_instances.get_mut(&observed.id) {
                stored.k8s_status = observed.k8s_status;
                stored.k8s_message = observed.k8s_message;
                stored.k8s_state = observed.k8s_state;
                stored.status = observed.status;
            }
        }
        Ok(())
    }

    async fn delete_app_instance(&self, tenant_id: u64, id: u64) -> Result<(), StoreError> {
        let mut tables = self.write();
        owned_instance(&mut tables, tenant_id, id)?;
        tables.app_instances.remove(&id);
        Ok(())
    }

    async fn delete_app_instances(&self, ids: Vec<u64>) -> Result<(), StoreError> {
        let mut tables = self.write();
        for id in ids {
            tables.app_instances.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl AppCatalog for MemoryStore {
    async fn get_app(&self, tenant_id: u64, app_id: u64) -> Result<App, StoreError> {
        self.read()
            .apps
            .get(&app_id)
            .filter(|app| app.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("app", app_id))
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_user(&self, _tenant_id: u64, user_id: u64) -> Result<Option<User>, StoreError> {
        Ok(self.read().users.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workbench(tenant_id: u64, workspace_id: u64) -> Workbench {
        Workbench {
            tenant_id,
            workspace_id,
            name: "analysis".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_workbench_is_tenant_scoped() {
        let store = MemoryStore::new();
        let wb = store.create_workbench(workbench(1, 7)).await.unwrap();

        assert!(store.get_workbench(1, wb.id).await.is_ok());
        let err = store.get_workbench(2, wb.id).await.unwrap_err();
        assert_eq!(err, StoreError::not_found("workbench", wb.id));
    }

    #[tokio::test]
    async fn test_list_filters_by_workspace() {
        let store = MemoryStore::new();
        store.create_workbench(workbench(1, 7)).await.unwrap();
        store.create_workbench(workbench(1, 8)).await.unwrap();
        store.create_workbench(workbench(2, 7)).await.unwrap();

        assert_eq!(store.list_workbenches(1, None).await.unwrap().len(), 2);
        let in_seven = store.list_workbenches(1, Some(vec![7])).await.unwrap();
        assert_eq!(in_seven.len(), 1);
        assert_eq!(in_seven[0].workspace_id, 7);
    }

    #[tokio::test]
    async fn test_delete_soft_deletes_and_drops_instances() {
        let store = MemoryStore::new();
        let wb = store.create_workbench(workbench(1, 7)).await.unwrap();
        store
            .create_app_instance(AppInstance {
                tenant_id: 1,
                workbench_id: wb.id,
                ..Default::default()
            })
            .await
            .unwrap();

        store.delete_workbench(1, wb.id).await.unwrap();

        assert!(store.get_workbench(1, wb.id).await.is_err());
        assert!(store.list_all_active_workbenches().await.unwrap().is_empty());
        assert!(store.list_app_instances(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_hits_accumulate() {
        let store = MemoryStore::new();
        let wb = store.create_workbench(workbench(1, 7)).await.unwrap();
        let at = Utc::now();

        for _ in 0..2 {
            store
                .save_batch_proxy_hit(HashMap::from([(wb.id, 3)]), HashMap::from([(wb.id, at)]))
                .await
                .unwrap();
        }

        let stored = store.get_workbench(1, wb.id).await.unwrap();
        assert_eq!(stored.accessed_count, 6);
        assert_eq!(stored.accessed_at, Some(at));
    }

    #[tokio::test]
    async fn test_idle_workbenches_are_marked_once() {
        let store = MemoryStore::new();
        let idle = store.create_workbench(workbench(1, 7)).await.unwrap();
        let fresh = store.create_workbench(workbench(1, 7)).await.unwrap();
        let never = store.create_workbench(workbench(1, 7)).await.unwrap();

        let old = Utc::now() - chrono::Duration::hours(2);
        store
            .save_batch_proxy_hit(
                HashMap::from([(idle.id, 1), (fresh.id, 1)]),
                HashMap::from([(idle.id, old), (fresh.id, Utc::now())]),
            )
            .await
            .unwrap();

        let marked = store.delete_idle_workbenches(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].id, idle.id);
        assert_eq!(marked[0].status, WorkbenchStatus::Deleted);

        let again = store.delete_idle_workbenches(Duration::from_secs(3600)).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(
            store.get_workbench(1, never.id).await.unwrap().status,
            WorkbenchStatus::Active
        );
    }

    #[tokio::test]
    async fn test_bulk_updates_skip_unknown_ids() {
        let store = MemoryStore::new();
        let wb = store.create_workbench(workbench(1, 7)).await.unwrap();
        let instance = store
            .create_app_instance(AppInstance {
                tenant_id: 1,
                workbench_id: wb.id,
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .update_app_instances(vec![
                AppInstanceObservation {
                    id: instance.id,
                    k8s_status: crate::model::K8sAppInstanceStatus::Running,
                    k8s_message: "ready".to_string(),
                    k8s_state: crate::model::K8sAppInstanceState::Running,
                    status: crate::model::AppInstanceStatus::Active,
                },
                AppInstanceObservation {
                    id: 999,
                    k8s_status: crate::model::K8sAppInstanceStatus::Failed,
                    k8s_message: String::new(),
                    k8s_state: crate::model::K8sAppInstanceState::Running,
                    status: crate::model::AppInstanceStatus::Deleted,
                },
            ])
            .await
            .unwrap();

        let stored = store.get_app_instance(1, instance.id).await.unwrap();
        assert_eq!(stored.k8s_message, "ready");

        store.delete_app_instances(vec![instance.id, 999]).await.unwrap();
        assert!(store.get_app_instance(1, instance.id).await.is_err());
    }
}
