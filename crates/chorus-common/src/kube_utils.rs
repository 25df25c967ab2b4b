//! Kubernetes client construction and shared API helpers

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{info, trace};

use crate::config::K8sClientConfig;
use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const SYNTHETIC_CONTEXT: &str = "chorus";

// =============================================================================
// Client construction
// =============================================================================

/// Create a kube client from the configured credential source
///
/// Precedence: inline kubeconfig, mounted service-account secret directory,
/// explicit token + CA, then in-cluster / `KUBECONFIG` inference.
pub async fn create_client(config: &K8sClientConfig) -> Result<Client, Error> {
    let kube_config = if let Some(raw) = &config.kube_config {
        info!("building kube client from inline kubeconfig");
        let kubeconfig = Kubeconfig::from_yaml(raw).map_err(|e| {
            Error::config_field("clients.k8s_client.kube_config", format!("invalid kubeconfig: {}", e))
        })?;
        from_kubeconfig(kubeconfig).await?
    } else if let Some(dir) = &config.service_account_secret_path {
        info!(path = %dir.display(), "building kube client from service account secret");
        let (token, ca) = read_service_account_dir(dir).await?;
        let server = required_api_server(config)?;
        from_kubeconfig(token_kubeconfig(server, &token, &ca)?).await?
    } else if let Some(token) = &config.token {
        info!("building kube client from token and CA");
        let server = required_api_server(config)?;
        let ca = config.ca.as_deref().unwrap_or_default();
        from_kubeconfig(token_kubeconfig(server, token.expose(), ca)?).await?
    } else {
        info!("inferring kube client configuration");
        Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?
    };

    build_client(kube_config)
}

fn required_api_server(config: &K8sClientConfig) -> Result<&str, Error> {
    config.api_server.as_deref().ok_or_else(|| {
        Error::config_field(
            "clients.k8s_client.api_server",
            "api_server is required with token credentials",
        )
    })
}

async fn read_service_account_dir(dir: &Path) -> Result<(String, String), Error> {
    let token = tokio::fs::read_to_string(dir.join("token")).await.map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to read service account token: {}", e),
        )
    })?;
    let ca = tokio::fs::read_to_string(dir.join("ca.crt")).await.map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to read service account CA: {}", e),
        )
    })?;
    Ok((token.trim().to_string(), ca))
}

/// Render a single-context kubeconfig for bearer-token credentials
fn token_kubeconfig(server: &str, token: &str, ca_pem: &str) -> Result<Kubeconfig, Error> {
    let mut cluster = serde_json::json!({ "server": server });
    if !ca_pem.is_empty() {
        cluster["certificate-authority-data"] = serde_json::Value::String(
            base64::engine::general_purpose::STANDARD.encode(ca_pem.as_bytes()),
        );
    }

    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": SYNTHETIC_CONTEXT, "cluster": cluster }],
        "users": [{ "name": SYNTHETIC_CONTEXT, "user": { "token": token } }],
        "contexts": [{
            "name": SYNTHETIC_CONTEXT,
            "context": { "cluster": SYNTHETIC_CONTEXT, "user": SYNTHETIC_CONTEXT }
        }],
        "current-context": SYNTHETIC_CONTEXT,
    });

    serde_json::from_value(doc)
        .map_err(|e| Error::serialization_for("Kubeconfig", e.to_string()))
}

async fn from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {}", e))
        })
}

fn build_client(mut config: Config) -> Result<Client, Error> {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

// =============================================================================
// API helpers
// =============================================================================

/// Whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Poll until a condition is met or timeout is reached
///
/// Calls `check_fn` every `poll_interval` until it returns `Ok(true)`.
/// Errors from `check_fn` are treated as "not yet" and polling continues.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("polling condition not yet met"),
            Err(e) => trace!(error = %e, "polling check failed, retrying"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        tokio::time::sleep(poll_interval).await;
    }
}
