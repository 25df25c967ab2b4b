//! Workbench control service for the CHORUS workbench engine
//!
//! Persists workbench and app-instance desired state, pushes it to the
//! cluster, records observed state from the watch stream, proxies stream
//! traffic and batches usage hits for idle cleanup.

#![deny(missing_docs)]

pub mod cluster;
pub mod error;
pub mod hits;
pub mod idle;
pub mod memory;
pub mod model;
pub mod service;
pub mod store;

pub use cluster::{StreamProxy, WorkbenchCluster};
pub use error::{Result, ServiceError};
pub use hits::{run_hit_flush, HitBatch};
pub use idle::{clean_idle_workbenches, run_idle_cleaner};
pub use memory::MemoryStore;
pub use model::{
    App, AppInstance, AppInstanceObservation, AppInstanceStatus, K8sAppInstanceState, K8sAppInstanceStatus,
    K8sWorkbenchStatus, User, Workbench, WorkbenchStatus,
};
pub use service::{ServiceDeps, WorkbenchService};
pub use store::{AppCatalog, NullUserDirectory, StoreError, UserDirectory, WorkbenchStore};
