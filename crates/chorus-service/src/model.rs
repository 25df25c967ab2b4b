//! Persisted domain model and its status mappings

use chrono::{DateTime, Utc};

use chorus_cluster::names::{workbench_name, workspace_namespace};
use chorus_cluster::{AppResources, AppState, AppStatus, ClusterApp, ServerStatus, WorkbenchRef};

/// Desired workbench state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WorkbenchStatus {
    /// Should be running
    #[default]
    Active,
    /// No reconciliation action
    Inactive,
    /// Should be torn down
    Deleted,
}

impl WorkbenchStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
        }
    }
}

/// Server deployment state observed in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum K8sWorkbenchStatus {
    /// Server is up
    Running,
    /// Server is rolling out
    Progressing,
    /// Server failed
    Failed,
}

impl K8sWorkbenchStatus {
    /// Map an observed deployment state, `None` until the operator reports
    pub fn from_server_status(status: ServerStatus) -> Option<Self> {
        match status {
            ServerStatus::Running => Some(Self::Running),
            ServerStatus::Progressing => Some(Self::Progressing),
            ServerStatus::Failed => Some(Self::Failed),
            ServerStatus::Unknown => None,
        }
    }
}

/// A workbench record
#[derive(Clone, Debug, PartialEq)]
pub struct Workbench {
    /// Workbench ID
    pub id: u64,
    /// Owning tenant
    pub tenant_id: u64,
    /// Owning user
    pub user_id: u64,
    /// Workspace the workbench lives in
    pub workspace_id: u64,
    /// Display name
    pub name: String,
    /// Short name
    pub short_name: String,
    /// Free-form description
    pub description: String,
    /// Desired state
    pub status: WorkbenchStatus,
    /// Observed server state, `None` until first observation
    pub k8s_status: Option<K8sWorkbenchStatus>,
    /// Initial screen width
    pub initial_resolution_width: u32,
    /// Initial screen height
    pub initial_resolution_height: u32,
    /// Time of the last proxied request
    pub accessed_at: Option<DateTime<Utc>>,
    /// Number of proxied requests
    pub accessed_count: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Soft-deletion time
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for Workbench {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: 0,
            user_id: 0,
            workspace_id: 0,
            name: String::new(),
            short_name: String::new(),
            description: String::new(),
            status: WorkbenchStatus::default(),
            k8s_status: None,
            initial_resolution_width: 0,
            initial_resolution_height: 0,
            accessed_at: None,
            accessed_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl Workbench {
    /// Namespace and resource name of this workbench in the cluster
    pub fn cluster_ref(&self) -> WorkbenchRef {
        WorkbenchRef::from_ids(self.workspace_id, self.id)
    }

    /// Workspace namespace
    pub fn namespace(&self) -> String {
        workspace_namespace(self.workspace_id)
    }

    /// Workbench resource name
    pub fn cluster_name(&self) -> String {
        workbench_name(self.id)
    }
}

/// Desired-state app lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum K8sAppInstanceState {
    /// Should run
    #[default]
    Running,
    /// Should be stopped
    Stopped,
    /// Should be torn down
    Killed,
}

impl K8sAppInstanceState {
    /// Derived domain status
    pub fn to_status(self) -> AppInstanceStatus {
        match self {
            Self::Running => AppInstanceStatus::Active,
            Self::Stopped => AppInstanceStatus::Inactive,
            Self::Killed => AppInstanceStatus::Deleted,
        }
    }
}

impl From<K8sAppInstanceState> for AppState {
    fn from(state: K8sAppInstanceState) -> Self {
        match state {
            K8sAppInstanceState::Running => AppState::Running,
            K8sAppInstanceState::Stopped => AppState::Stopped,
            K8sAppInstanceState::Killed => AppState::Killed,
        }
    }
}

/// Observed app state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum K8sAppInstanceStatus {
    /// Not reported
    #[default]
    Unknown,
    /// Container running
    Running,
    /// Exited normally
    Complete,
    /// Starting
    Progressing,
    /// Failed
    Failed,
    /// Stopped on request
    Stopped,
}

impl K8sAppInstanceStatus {
    /// Derived domain status
    pub fn to_status(self) -> AppInstanceStatus {
        match self {
            Self::Running => AppInstanceStatus::Active,
            Self::Complete | Self::Failed => AppInstanceStatus::Deleted,
            Self::Unknown | Self::Progressing | Self::Stopped => AppInstanceStatus::Inactive,
        }
    }
}

impl From<AppStatus> for K8sAppInstanceStatus {
    fn from(status: AppStatus) -> Self {
        match status {
            AppStatus::Unknown => Self::Unknown,
            AppStatus::Running => Self::Running,
            AppStatus::Complete => Self::Complete,
            AppStatus::Progressing => Self::Progressing,
            AppStatus::Failed => Self::Failed,
            AppStatus::Stopped => Self::Stopped,
        }
    }
}

/// Derived app instance status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AppInstanceStatus {
    /// Running or expected to run
    #[default]
    Active,
    /// Not running
    Inactive,
    /// Gone
    Deleted,
}

/// An app running inside a workbench
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppInstance {
    /// App instance ID
    pub id: u64,
    /// Owning tenant
    pub tenant_id: u64,
    /// Owning user
    pub user_id: u64,
    /// Catalog app
    pub app_id: u64,
    /// Workspace of the workbench
    pub workspace_id: u64,
    /// Hosting workbench
    pub workbench_id: u64,
    /// App name, copied from the catalog
    pub app_name: String,
    /// Image registry, empty for the default
    pub registry: String,
    /// Image name
    pub image: String,
    /// Image tag
    pub tag: String,
    /// Resource requests and limits
    pub resources: AppResources,
    /// Size of `/dev/shm`
    pub shm_size: String,
    /// Kiosk start URL
    pub kiosk_url: String,
    /// Kiosk JWT URL
    pub kiosk_jwt_url: String,
    /// Kiosk JWT token
    pub kiosk_jwt_token: String,
    /// Desired lifecycle
    pub k8s_state: K8sAppInstanceState,
    /// Observed state
    pub k8s_status: K8sAppInstanceStatus,
    /// Observed detail
    pub k8s_message: String,
    /// Derived status
    pub status: AppInstanceStatus,
}

impl AppInstance {
    /// Copy image, resource and kiosk settings from a catalog app
    pub fn apply_app(&mut self, app: &App) {
        self.app_name = app.name.clone();
        self.registry = app.registry.clone();
        self.image = app.image.clone();
        self.tag = app.tag.clone();
        self.resources = app.resources.clone();
        self.shm_size = app.shm_size.clone();
        self.kiosk_url = app.kiosk_url.clone();
        self.kiosk_jwt_url = app.kiosk_jwt_url.clone();
    }

    /// Cluster-side representation
    pub fn to_cluster_app(&self) -> ClusterApp {
        ClusterApp {
            id: self.id,
            app_name: self.app_name.clone(),
            registry: self.registry.clone(),
            image: self.image.clone(),
            tag: self.tag.clone(),
            state: Some(self.k8s_state.into()),
            shm_size: self.shm_size.clone(),
            kiosk_url: self.kiosk_url.clone(),
            kiosk_jwt_url: self.kiosk_jwt_url.clone(),
            kiosk_jwt_token: self.kiosk_jwt_token.clone(),
            resources: self.resources.clone(),
            ..Default::default()
        }
    }
}

/// Observed-state update for one app instance
#[derive(Clone, Debug, PartialEq)]
pub struct AppInstanceObservation {
    /// App instance ID
    pub id: u64,
    /// Observed state
    pub k8s_status: K8sAppInstanceStatus,
    /// Observed detail
    pub k8s_message: String,
    /// Desired lifecycle after the observation
    pub k8s_state: K8sAppInstanceState,
    /// Derived status
    pub status: AppInstanceStatus,
}

/// A catalog app
#[derive(Clone, Debug, Default, PartialEq)]
pub struct App {
    /// App ID
    pub id: u64,
    /// Owning tenant
    pub tenant_id: u64,
    /// App name
    pub name: String,
    /// Image registry, empty for the default
    pub registry: String,
    /// Image name
    pub image: String,
    /// Image tag
    pub tag: String,
    /// Resource requests and limits
    pub resources: AppResources,
    /// Size of `/dev/shm`
    pub shm_size: String,
    /// Kiosk start URL
    pub kiosk_url: String,
    /// Kiosk JWT URL
    pub kiosk_jwt_url: String,
}

/// A platform user
#[derive(Clone, Debug, Default, PartialEq)]
pub struct User {
    /// User ID
    pub id: u64,
    /// Login name
    pub username: String,
}
