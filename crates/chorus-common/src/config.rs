//! Service configuration loaded from YAML
//!
//! The layout mirrors the platform's backend config file: cluster client
//! settings live under `clients.k8s_client`, proxy/reconciler tuning under
//! `services.workbench_service`. Every section has defaults, so a partial
//! file (or an empty one) is valid.
//!
//! Durations accept either an integer number of seconds or a string with a
//! unit suffix (`500ms`, `10s`, `5m`, `1h`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Default name of the docker-config secret created in each workspace namespace
pub const DEFAULT_IMAGE_PULL_SECRET_NAME: &str = "image-pull-secret";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External client settings
    pub clients: ClientsConfig,
    /// Service tuning
    pub services: ServicesConfig,
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = if raw.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would only fail later at first use
    pub fn validate(&self) -> Result<()> {
        let k8s = &self.clients.k8s_client;
        if !k8s.image_pull_secrets.is_empty() && k8s.image_pull_secret_name.is_empty() {
            return Err(Error::config_field(
                "clients.k8s_client.image_pull_secret_name",
                "image pull secrets are configured but the secret name is empty",
            ));
        }
        if k8s.kube_config.is_none()
            && (k8s.service_account_secret_path.is_some() || k8s.token.is_some())
            && k8s.api_server.is_none()
        {
            return Err(Error::config_field(
                "clients.k8s_client.api_server",
                "api_server is required with service account or token credentials",
            ));
        }
        let wb = &self.services.workbench_service;
        if wb.proxy_hit_save_batch_interval.is_zero() {
            return Err(Error::config_field(
                "services.workbench_service.proxy_hit_save_batch_interval",
                "must be greater than zero",
            ));
        }
        if wb.workbench_idle_timeout.is_some() && wb.workbench_idle_check_interval.is_zero() {
            return Err(Error::config_field(
                "services.workbench_service.workbench_idle_check_interval",
                "must be greater than zero when workbench_idle_timeout is set",
            ));
        }
        Ok(())
    }
}

/// External client settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    /// Kubernetes cluster client
    pub k8s_client: K8sClientConfig,
}

/// Kubernetes client and workbench rendering settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct K8sClientConfig {
    /// Inline kubeconfig document (takes precedence over every other source)
    pub kube_config: Option<String>,
    /// API server URL used with service-account or token credentials
    pub api_server: Option<String>,
    /// Directory holding `token` and `ca.crt` of a mounted service-account secret
    pub service_account_secret_path: Option<PathBuf>,
    /// Bearer token used together with `ca`
    pub token: Option<SecretString>,
    /// PEM-encoded cluster CA used together with `token`
    pub ca: Option<String>,

    /// Registry credentials rendered into the workspace pull secret
    pub image_pull_secrets: Vec<ImagePullSecret>,
    /// Name of the pull secret referenced by every workbench
    pub image_pull_secret_name: String,

    /// Workbench server image version override
    pub server_version: Option<String>,
    /// Init container image version override
    pub init_container_version: Option<String>,
    /// Pass the platform username/user ID through to the workbench server
    pub add_user_details: bool,
    /// Run the workbench watcher in this process
    pub is_watcher: bool,

    /// Registry used when an app has none
    pub default_registry: String,
    /// Repository prefix used when an app has no registry
    pub default_repository: String,
}

impl Default for K8sClientConfig {
    fn default() -> Self {
        Self {
            kube_config: None,
            api_server: None,
            service_account_secret_path: None,
            token: None,
            ca: None,
            image_pull_secrets: Vec::new(),
            image_pull_secret_name: DEFAULT_IMAGE_PULL_SECRET_NAME.to_string(),
            server_version: None,
            init_container_version: None,
            add_user_details: false,
            is_watcher: true,
            default_registry: String::new(),
            default_repository: String::new(),
        }
    }
}

/// One registry credential
#[derive(Debug, Clone, Deserialize)]
pub struct ImagePullSecret {
    /// Registry host (e.g., "harbor.example.com")
    pub registry: String,
    /// Registry username
    pub username: String,
    /// Registry password
    pub password: SecretString,
}

/// Service tuning
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Workbench reconciler and proxy settings
    pub workbench_service: WorkbenchServiceConfig,
}

/// Workbench reconciler and proxy settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkbenchServiceConfig {
    /// Backend runs inside the cluster and can reach workbench services directly
    pub backend_in_k8s: bool,
    /// Serve the workbench stream route
    pub stream_proxy_enabled: bool,
    /// Base interval between proxy-hit flushes (jitter is added on top)
    #[serde(deserialize_with = "duration::deserialize")]
    pub proxy_hit_save_batch_interval: Duration,
    /// Workbenches without hits for this long are torn down (disabled when unset)
    #[serde(deserialize_with = "duration::deserialize_option")]
    pub workbench_idle_timeout: Option<Duration>,
    /// Interval between idle sweeps
    #[serde(deserialize_with = "duration::deserialize")]
    pub workbench_idle_check_interval: Duration,
    /// Interval between tunnel liveness probes
    #[serde(deserialize_with = "duration::deserialize")]
    pub tunnel_health_check_interval: Duration,
    /// Upstream HTTP transport settings
    pub round_tripper: RoundTripperConfig,
}

impl Default for WorkbenchServiceConfig {
    fn default() -> Self {
        Self {
            backend_in_k8s: false,
            stream_proxy_enabled: true,
            proxy_hit_save_batch_interval: Duration::from_secs(10),
            workbench_idle_timeout: None,
            workbench_idle_check_interval: Duration::from_secs(3600),
            tunnel_health_check_interval: Duration::from_secs(30),
            round_tripper: RoundTripperConfig::default(),
        }
    }
}

/// Upstream HTTP transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoundTripperConfig {
    /// Maximum attempts for a request failing with a transient network error
    pub max_transient_retry: u32,
    /// TCP connect timeout
    #[serde(deserialize_with = "duration::deserialize")]
    pub dial_timeout: Duration,
    /// TCP keepalive interval
    #[serde(deserialize_with = "duration::deserialize")]
    pub dial_keep_alive: Duration,
    /// How long idle pooled connections are kept
    #[serde(deserialize_with = "duration::deserialize")]
    pub idle_conn_timeout: Duration,
    /// Maximum idle pooled connections per upstream host
    pub max_idle_conns_per_host: usize,
    /// Overall per-request timeout for non-streaming requests (disabled when unset)
    #[serde(deserialize_with = "duration::deserialize_option")]
    pub response_header_timeout: Option<Duration>,
    /// Negotiate HTTP/2 where the upstream supports it
    pub force_attempt_http2: bool,
}

impl Default for RoundTripperConfig {
    fn default() -> Self {
        Self {
            max_transient_retry: 3,
            dial_timeout: Duration::from_secs(30),
            dial_keep_alive: Duration::from_secs(30),
            idle_conn_timeout: Duration::from_secs(90),
            max_idle_conns_per_host: 10,
            response_header_timeout: None,
            force_attempt_http2: false,
        }
    }
}

/// A string that is wiped on drop and never printed
#[derive(Clone, Default)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the secret value
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

/// Serde helpers for human-readable durations
mod duration {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(s) => Ok(Duration::from_secs(s)),
            Raw::Text(t) => parse(&t).map_err(D::Error::custom),
        }
    }

    pub(super) fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Seconds(s)) => Ok(Some(Duration::from_secs(s))),
            Some(Raw::Text(t)) => parse(&t).map(Some).map_err(D::Error::custom),
        }
    }

    pub(super) fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration '{}' is missing a unit", raw))?;
        let (value, unit) = raw.split_at(split);
        let value: u64 = value
            .parse()
            .map_err(|_| format!("invalid duration value in '{}'", raw))?;
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            other => Err(format!("unknown duration unit '{}' in '{}'", other, raw)),
        }
    }
}
