//! Conversion between domain workbenches and the Workbench custom resource
//!
//! Everything here is pure: no cluster calls, only the values held by
//! [`CodecConfig`]. The adapter encodes with [`CodecConfig::to_cluster_workbench`]
//! before syncing and the watch decodes with [`CodecConfig::from_cluster_workbench`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use chorus_common::config::K8sClientConfig;

use crate::crd::{
    AppState, AppStatus, Image, InitContainerConfig, KioskConfig, ServerPodStatus, ServerStatus,
    Workbench, WorkbenchApp, WorkbenchServer, WorkbenchSpec, CREATED_BY_LABEL, CREATED_BY_VALUE,
    TENANT_ID_LABEL,
};
use crate::error::ClusterError;
use crate::names::{sanitize_username, AppUid};

/// Offset between platform user IDs and POSIX user IDs in workbenches
pub const USER_ID_OFFSET: u64 = 1001;

/// Tag used when an app has none
pub const DEFAULT_IMAGE_TAG: &str = "latest";

const RESOURCE_CPU: &str = "cpu";
const RESOURCE_MEMORY: &str = "memory";
const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";

/// Kubernetes quantity grammar: signed decimal plus an optional binary,
/// decimal or exponent suffix.
static QUANTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)(Ki|Mi|Gi|Ti|Pi|Ei|n|u|m|k|M|G|T|P|E|[eE][+-]?[0-9]+)?$")
        .expect("valid regex")
});

/// Settings that shape the encoded resource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodecConfig {
    /// Registry for apps that don't name one
    pub default_registry: String,
    /// Repository prefix for apps that don't name a registry
    pub default_repository: String,
    /// Server image version override
    pub server_version: Option<String>,
    /// Init container version
    pub init_container_version: Option<String>,
    /// Pull secret to reference, set only when registries are configured
    pub image_pull_secret_name: Option<String>,
    /// Pass the username and POSIX user ID through to the server
    pub add_user_details: bool,
}

impl CodecConfig {
    /// Derive codec settings from the cluster client configuration
    pub fn from_client_config(config: &K8sClientConfig) -> Self {
        Self {
            default_registry: config.default_registry.clone(),
            default_repository: config.default_repository.clone(),
            server_version: non_empty(config.server_version.as_deref()),
            init_container_version: non_empty(config.init_container_version.as_deref()),
            image_pull_secret_name: (!config.image_pull_secrets.is_empty())
                .then(|| config.image_pull_secret_name.clone()),
            add_user_details: config.add_user_details,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Resource request/limit strings of one app
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppResources {
    /// CPU request
    pub min_cpu: String,
    /// CPU limit
    pub max_cpu: String,
    /// Memory request
    pub min_memory: String,
    /// Memory limit
    pub max_memory: String,
    /// Ephemeral storage request
    pub min_ephemeral_storage: String,
    /// Ephemeral storage limit
    pub max_ephemeral_storage: String,
}

impl AppResources {
    fn is_empty(&self) -> bool {
        [
            &self.min_cpu,
            &self.max_cpu,
            &self.min_memory,
            &self.max_memory,
            &self.min_ephemeral_storage,
            &self.max_ephemeral_storage,
        ]
        .iter()
        .all(|v| v.is_empty())
    }
}

/// App instance as seen by the cluster adapter
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterApp {
    /// App instance ID
    pub id: u64,
    /// App display name (sanitized on encode)
    pub app_name: String,
    /// Image registry, empty for the default registry
    pub registry: String,
    /// Image name or repository
    pub image: String,
    /// Image tag
    pub tag: String,
    /// Desired lifecycle state
    pub state: Option<AppState>,
    /// Observed status (decode only)
    pub status: AppStatus,
    /// Observed status detail (decode only)
    pub status_message: String,
    /// Size of `/dev/shm`
    pub shm_size: String,
    /// Kiosk start URL
    pub kiosk_url: String,
    /// Kiosk JWT URL
    pub kiosk_jwt_url: String,
    /// Kiosk JWT token
    pub kiosk_jwt_token: String,
    /// Resource requests and limits
    pub resources: AppResources,
}

impl ClusterApp {
    /// Key of this app in the resource's `apps` map
    pub fn uid(&self) -> AppUid {
        AppUid::new(&self.app_name, self.id)
    }
}

/// Workbench as seen by the cluster adapter
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterWorkbench {
    /// Workspace namespace
    pub namespace: String,
    /// Workbench resource name
    pub name: String,
    /// Owning tenant
    pub tenant_id: u64,
    /// Platform username
    pub username: String,
    /// Platform user ID
    pub user_id: u64,
    /// Initial screen width
    pub initial_resolution_width: u32,
    /// Initial screen height
    pub initial_resolution_height: u32,
    /// App instances
    pub apps: Vec<ClusterApp>,
    /// `metadata.generation` (decode only)
    pub generation: i64,
    /// `status.observedGeneration` (decode only)
    pub observed_generation: i64,
    /// Server deployment rollout state (decode only)
    pub server_status: ServerStatus,
    /// Server pod container state (decode only)
    pub server_pod_status: ServerPodStatus,
}

// =============================================================================
// Encoding
// =============================================================================

impl CodecConfig {
    /// Build the Workbench resource for a workbench and its apps
    pub fn to_cluster_workbench(
        &self,
        workbench: &ClusterWorkbench,
    ) -> Result<Workbench, ClusterError> {
        let mut server = WorkbenchServer {
            initial_resolution_width: positive(workbench.initial_resolution_width),
            initial_resolution_height: positive(workbench.initial_resolution_height),
            version: self.server_version.clone(),
            ..Default::default()
        };

        let username = sanitize_username(&workbench.username);
        if self.add_user_details && !username.is_empty() {
            server.user = Some(username);
            server.user_id = Some(workbench.user_id + USER_ID_OFFSET);
        }

        let mut apps = BTreeMap::new();
        for app in &workbench.apps {
            apps.insert(app.uid().to_string(), self.to_cluster_app(app)?);
        }

        let spec = WorkbenchSpec {
            server,
            init_container: self
                .init_container_version
                .clone()
                .map(|version| InitContainerConfig {
                    version: Some(version),
                }),
            apps,
            service_account_name: None,
            image_pull_secrets: self.image_pull_secret_name.iter().cloned().collect(),
        };

        let mut resource = Workbench::new(&workbench.name, spec);
        resource.metadata.namespace = Some(workbench.namespace.clone());
        resource.metadata.labels = Some(BTreeMap::from([
            (CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string()),
            (TENANT_ID_LABEL.to_string(), workbench.tenant_id.to_string()),
        ]));
        Ok(resource)
    }

    /// Build the `apps` map entry for one app instance
    pub fn to_cluster_app(&self, app: &ClusterApp) -> Result<WorkbenchApp, ClusterError> {
        let tag = if app.tag.is_empty() {
            DEFAULT_IMAGE_TAG.to_string()
        } else {
            app.tag.clone()
        };

        let image = if app.registry.is_empty() {
            Image {
                registry: self.default_registry.clone(),
                repository: format!("{}/{}", self.default_repository, app.image),
                tag,
            }
        } else {
            Image {
                registry: app.registry.clone(),
                repository: app.image.clone(),
                tag,
            }
        };

        let shm_size = if app.shm_size.is_empty() {
            None
        } else {
            Some(parse_quantity("shmSize", &app.shm_size)?)
        };

        let kiosk_config = if app.kiosk_url.is_empty()
            && app.kiosk_jwt_url.is_empty()
            && app.kiosk_jwt_token.is_empty()
        {
            None
        } else {
            Some(KioskConfig {
                url: app.kiosk_url.clone(),
                jwt_url: app.kiosk_jwt_url.clone(),
                jwt_token: app.kiosk_jwt_token.clone(),
            })
        };

        Ok(WorkbenchApp {
            name: app.uid().to_string(),
            version: non_empty(Some(app.tag.as_str())),
            state: Some(app.state.unwrap_or_default()),
            image: Some(image),
            shm_size,
            resources: build_resources(&app.resources)?,
            kiosk_config,
        })
    }
}

fn positive(value: u32) -> Option<u32> {
    (value > 0).then_some(value)
}

/// Validate a quantity string
pub fn parse_quantity(field: &str, value: &str) -> Result<Quantity, ClusterError> {
    let trimmed = value.trim();
    if QUANTITY_RE.is_match(trimmed) {
        Ok(Quantity(trimmed.to_string()))
    } else {
        Err(ClusterError::InvalidQuantity {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

fn build_resources(resources: &AppResources) -> Result<Option<ResourceRequirements>, ClusterError> {
    if resources.is_empty() {
        return Ok(None);
    }

    let limits = quantity_map(
        "limits",
        [
            (RESOURCE_CPU, &resources.max_cpu),
            (RESOURCE_MEMORY, &resources.max_memory),
            (RESOURCE_EPHEMERAL_STORAGE, &resources.max_ephemeral_storage),
        ],
    )?;
    let requests = quantity_map(
        "requests",
        [
            (RESOURCE_CPU, &resources.min_cpu),
            (RESOURCE_MEMORY, &resources.min_memory),
            (RESOURCE_EPHEMERAL_STORAGE, &resources.min_ephemeral_storage),
        ],
    )?;

    Ok(Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    }))
}

fn quantity_map(
    side: &str,
    entries: [(&str, &String); 3],
) -> Result<Option<BTreeMap<String, Quantity>>, ClusterError> {
    let mut map = BTreeMap::new();
    for (name, value) in entries {
        if !value.is_empty() {
            let field = format!("resources.{side}.{name}");
            map.insert(name.to_string(), parse_quantity(&field, value)?);
        }
    }
    Ok((!map.is_empty()).then_some(map))
}

// =============================================================================
// Decoding
// =============================================================================

impl CodecConfig {
    /// Decode a Workbench resource, overlaying observed app status onto its apps
    pub fn from_cluster_workbench(&self, resource: &Workbench) -> Result<ClusterWorkbench, ClusterError> {
        let tenant_id = tenant_label(resource)?;

        let mut apps = BTreeMap::new();
        for (key, app) in &resource.spec.apps {
            apps.insert(key.clone(), self.from_cluster_app(key, app)?);
        }

        let status = resource.status.clone().unwrap_or_default();
        for (key, observed) in &status.apps {
            match apps.get_mut(key) {
                Some(app) => {
                    app.status = observed.status;
                    app.status_message = observed.message.clone();
                }
                None => warn!(
                    app_uid = %key,
                    workbench = %resource.name_any(),
                    "app status has no matching spec entry"
                ),
            }
        }

        let server = &resource.spec.server;
        Ok(ClusterWorkbench {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
            tenant_id,
            username: server.user.clone().unwrap_or_default(),
            user_id: server
                .user_id
                .map(|id| id.saturating_sub(USER_ID_OFFSET))
                .unwrap_or_default(),
            initial_resolution_width: server.initial_resolution_width.unwrap_or_default(),
            initial_resolution_height: server.initial_resolution_height.unwrap_or_default(),
            apps: apps.into_values().collect(),
            generation: resource.metadata.generation.unwrap_or_default(),
            observed_generation: status.observed_generation,
            server_status: status.server_deployment.status,
            server_pod_status: status
                .server_deployment
                .server_pod
                .map(|pod| pod.status)
                .unwrap_or(ServerPodStatus::Unknown),
        })
    }

    /// Decode one `apps` map entry, undoing the image defaults applied on encode
    ///
    /// An image under the default registry and repository decodes back to an
    /// empty registry and the bare image name. A `latest` tag with no `version`
    /// decodes back to an empty tag.
    pub fn from_cluster_app(&self, key: &str, app: &WorkbenchApp) -> Result<ClusterApp, ClusterError> {
        let mut decoded = decode_app(key, app)?;
        if let Some(image) = &app.image {
            if let Some(bare) = self.defaulted_image(image) {
                decoded.registry = String::new();
                decoded.image = bare.to_string();
            }
            if app.version.is_none() && image.tag == DEFAULT_IMAGE_TAG {
                decoded.tag = String::new();
            }
        }
        Ok(decoded)
    }

    fn defaulted_image<'a>(&self, image: &'a Image) -> Option<&'a str> {
        if image.registry != self.default_registry {
            return None;
        }
        image
            .repository
            .strip_prefix(self.default_repository.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

fn tenant_label(resource: &Workbench) -> Result<u64, ClusterError> {
    let raw = resource
        .labels()
        .get(TENANT_ID_LABEL)
        .ok_or_else(|| ClusterError::MissingLabel {
            label: TENANT_ID_LABEL.to_string(),
        })?;
    raw.parse().map_err(|_| ClusterError::InvalidLabel {
        label: TENANT_ID_LABEL.to_string(),
        value: raw.clone(),
    })
}

fn decode_app(key: &str, app: &WorkbenchApp) -> Result<ClusterApp, ClusterError> {
    let uid: AppUid = key.parse()?;

    let mut decoded = ClusterApp {
        id: uid.instance_id(),
        app_name: uid.name().to_string(),
        state: app.state,
        shm_size: app.shm_size.as_ref().map(|q| q.0.clone()).unwrap_or_default(),
        ..Default::default()
    };

    if let Some(image) = &app.image {
        decoded.registry = image.registry.clone();
        decoded.image = image.repository.clone();
        decoded.tag = image.tag.clone();
    }

    if let Some(kiosk) = &app.kiosk_config {
        decoded.kiosk_url = kiosk.url.clone();
        decoded.kiosk_jwt_url = kiosk.jwt_url.clone();
        decoded.kiosk_jwt_token = kiosk.jwt_token.clone();
    }

    if let Some(resources) = &app.resources {
        let quantity = |map: &Option<BTreeMap<String, Quantity>>, name: &str| {
            map.as_ref()
                .and_then(|m| m.get(name))
                .map(|q| q.0.clone())
                .unwrap_or_default()
        };
        decoded.resources = AppResources {
            min_cpu: quantity(&resources.requests, RESOURCE_CPU),
            max_cpu: quantity(&resources.limits, RESOURCE_CPU),
            min_memory: quantity(&resources.requests, RESOURCE_MEMORY),
            max_memory: quantity(&resources.limits, RESOURCE_MEMORY),
            min_ephemeral_storage: quantity(&resources.requests, RESOURCE_EPHEMERAL_STORAGE),
            max_ephemeral_storage: quantity(&resources.limits, RESOURCE_EPHEMERAL_STORAGE),
        };
    }

    Ok(decoded)
}
