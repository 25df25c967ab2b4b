//! Persistence seams consumed by the control service
//!
//! The service never assumes a particular backend: everything it reads or
//! writes goes through these traits. [`crate::memory::MemoryStore`] is the
//! in-process implementation used by the binary and the tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::model::{
    App, AppInstance, AppInstanceObservation, K8sWorkbenchStatus, User, Workbench,
};

/// Errors from a store backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Row does not exist (or belongs to another tenant)
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Entity ID
        id: u64,
    },

    /// Backend failure
    #[error("store backend error: {message}")]
    Backend {
        /// Description of what failed
        message: String,
    },
}

impl StoreError {
    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: u64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Workbench and app-instance persistence
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkbenchStore: Send + Sync {
    // =========================================================================
    // Workbenches
    // =========================================================================

    /// Fetch one workbench of a tenant
    async fn get_workbench(&self, tenant_id: u64, id: u64) -> Result<Workbench, StoreError>;

    /// Workbenches of a tenant, optionally restricted to some workspaces
    async fn list_workbenches(
        &self,
        tenant_id: u64,
        workspace_ids: Option<Vec<u64>>,
    ) -> Result<Vec<Workbench>, StoreError>;

    /// Every workbench not yet soft-deleted, across tenants
    async fn list_all_active_workbenches(&self) -> Result<Vec<Workbench>, StoreError>;

    /// Insert a workbench, assigning its ID
    async fn create_workbench(&self, workbench: Workbench) -> Result<Workbench, StoreError>;

    /// Replace a workbench's user-editable fields
    async fn update_workbench(&self, workbench: Workbench) -> Result<Workbench, StoreError>;

    /// Record the observed server state
    async fn update_workbench_k8s_status(
        &self,
        tenant_id: u64,
        id: u64,
        status: K8sWorkbenchStatus,
    ) -> Result<(), StoreError>;

    /// Soft-delete a workbench and its app instances
    async fn delete_workbench(&self, tenant_id: u64, id: u64) -> Result<(), StoreError>;

    /// Mark workbenches idle longer than `idle_timeout` as deleted
    ///
    /// Returns the workbenches that were marked.
    async fn delete_idle_workbenches(&self, idle_timeout: Duration) -> Result<Vec<Workbench>, StoreError>;

    /// Add hit counts and move last-access times forward
    async fn save_batch_proxy_hit(
        &self,
        counts: HashMap<u64, u64>,
        last_hits: HashMap<u64, DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // App instances
    // =========================================================================

    /// Fetch one app instance of a tenant
    async fn get_app_instance(&self, tenant_id: u64, id: u64) -> Result<AppInstance, StoreError>;

    /// App instances of a tenant
    async fn list_app_instances(&self, tenant_id: u64) -> Result<Vec<AppInstance>, StoreError>;

    /// Live app instances hosted by one workbench
    async fn list_workbench_app_instances(
        &self,
        tenant_id: u64,
        workbench_id: u64,
    ) -> Result<Vec<AppInstance>, StoreError>;

    /// Insert an app instance, assigning its ID
    async fn create_app_instance(&self, instance: AppInstance) -> Result<AppInstance, StoreError>;

    /// Replace an app instance
    async fn update_app_instance(&self, instance: AppInstance) -> Result<AppInstance, StoreError>;

    /// Apply observed state to many app instances; unknown IDs are skipped
    async fn update_app_instances(&self, observations: Vec<AppInstanceObservation>) -> Result<(), StoreError>;

    /// Remove one app instance of a tenant
    async fn delete_app_instance(&self, tenant_id: u64, id: u64) -> Result<(), StoreError>;

    /// Remove app instances by ID; unknown IDs are skipped
    async fn delete_app_instances(&self, ids: Vec<u64>) -> Result<(), StoreError>;
}

/// Catalog of installable apps
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppCatalog: Send + Sync {
    /// Fetch one app of a tenant
    async fn get_app(&self, tenant_id: u64, app_id: u64) -> Result<App, StoreError>;
}

/// Platform user lookup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fetch a user, `None` when the directory doesn't know them
    async fn get_user(&self, tenant_id: u64, user_id: u64) -> Result<Option<User>, StoreError>;
}

/// Directory that knows no users
///
/// Workbenches are then created without a username.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullUserDirectory;

#[async_trait]
impl UserDirectory for NullUserDirectory {
    async fn get_user(&self, _tenant_id: u64, _user_id: u64) -> Result<Option<User>, StoreError> {
        Ok(None)
    }
}
