//! Workbench custom resource (`default.chorus-tre.ch/v1alpha1`)
//!
//! The CRD itself is owned and reconciled by the workbench operator running
//! in the cluster. This crate only writes `spec` and reads `status`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the Workbench resource
pub const WORKBENCH_GROUP: &str = "default.chorus-tre.ch";
/// API version of the Workbench resource
pub const WORKBENCH_API_VERSION: &str = "default.chorus-tre.ch/v1alpha1";
/// Kind of the Workbench resource
pub const WORKBENCH_KIND: &str = "Workbench";

/// Label marking resources created by this backend
pub const CREATED_BY_LABEL: &str = "chorus-tre.ch/created-by";
/// Value of [`CREATED_BY_LABEL`]
pub const CREATED_BY_VALUE: &str = "chorus-backend";
/// Label carrying the owning tenant ID
pub const TENANT_ID_LABEL: &str = "chorus-tre.ch/tenant-id";

/// Desired workbench state
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "default.chorus-tre.ch",
    version = "v1alpha1",
    kind = "Workbench",
    namespaced,
    status = "WorkbenchStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkbenchSpec {
    /// Remote desktop server settings
    #[serde(default)]
    pub server: WorkbenchServer,

    /// Init container settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container: Option<InitContainerConfig>,

    /// Apps keyed by app-instance UID
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub apps: BTreeMap<String, WorkbenchApp>,

    /// Service account the workbench pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Pull secret names referenced by workbench pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

/// Remote desktop server settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkbenchServer {
    /// Initial screen width in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_resolution_width: Option<u32>,
    /// Initial screen height in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_resolution_height: Option<u32>,
    /// Server image version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// POSIX username inside the workbench
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// POSIX user ID inside the workbench
    #[serde(default, rename = "userid", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
}

/// Init container settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct InitContainerConfig {
    /// Init container image version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Desired lifecycle state of one app
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppState {
    /// App should be running
    #[default]
    Running,
    /// App should be stopped but kept
    Stopped,
    /// App should be torn down
    Killed,
}

/// One app container attached to the workbench
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkbenchApp {
    /// Generated app name (`{sanitized-name}-{instance-id}`)
    pub name: String,
    /// App version (image tag)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Desired lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AppState>,
    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    /// Size of `/dev/shm`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<Quantity>,
    /// Container resource requests/limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Kiosk-mode browser settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kiosk_config: Option<KioskConfig>,
}

/// Container image coordinates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Image {
    /// Registry host
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Image tag
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

/// Kiosk-mode browser settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KioskConfig {
    /// Start URL
    #[serde(default)]
    pub url: String,
    /// URL used to fetch a JWT for the kiosk session
    #[serde(default, rename = "jwtUrl", skip_serializing_if = "String::is_empty")]
    pub jwt_url: String,
    /// Pre-issued JWT for the kiosk session
    #[serde(default, rename = "jwtToken", skip_serializing_if = "String::is_empty")]
    pub jwt_token: String,
}

// =============================================================================
// Status (written by the workbench operator only)
// =============================================================================

/// Observed workbench state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkbenchStatus {
    /// Generation last reconciled by the operator
    #[serde(default)]
    pub observed_generation: i64,
    /// Server deployment health
    #[serde(default)]
    pub server_deployment: ServerDeploymentStatus,
    /// Per-app status keyed by app-instance UID
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub apps: BTreeMap<String, AppStatusEntry>,
}

/// Rollout state of the server deployment
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServerStatus {
    /// Server is up
    Running,
    /// Server is rolling out
    Progressing,
    /// Server failed
    Failed,
    /// Not yet reported
    #[default]
    #[serde(other)]
    Unknown,
}

/// Server deployment health
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerDeploymentStatus {
    /// Deployment revision
    #[serde(default)]
    pub revision: i64,
    /// Rollout state
    #[serde(default)]
    pub status: ServerStatus,
    /// Server pod health (absent until the pod is scheduled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_pod: Option<ServerPodHealth>,
}

/// Container state of the server pod
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServerPodStatus {
    /// Waiting to start
    Waiting,
    /// Starting up
    Starting,
    /// Serving
    Ready,
    /// Failing probes
    Failing,
    /// Restarting
    Restarting,
    /// Shutting down
    Terminating,
    /// Gone
    Terminated,
    /// Not reported
    #[default]
    #[serde(other)]
    Unknown,
}

impl ServerPodStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Failing => "Failing",
            Self::Restarting => "Restarting",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::Unknown => "Unknown",
        }
    }
}

/// Server pod health
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerPodHealth {
    /// Container state
    #[serde(default)]
    pub status: ServerPodStatus,
    /// Readiness
    #[serde(default)]
    pub ready: bool,
    /// Container restarts
    #[serde(default)]
    pub restart_count: i32,
    /// Operator-provided detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Observed state of one app
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum AppStatus {
    /// App container is running
    Running,
    /// App exited normally
    Complete,
    /// App is starting
    Progressing,
    /// App failed
    Failed,
    /// App was stopped
    Stopped,
    /// Not reported
    #[default]
    #[serde(other)]
    Unknown,
}

/// Observed state of one app
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AppStatusEntry {
    /// Revision last applied
    #[serde(default)]
    pub revision: i64,
    /// Observed state
    #[serde(default)]
    pub status: AppStatus,
    /// Operator-provided detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
