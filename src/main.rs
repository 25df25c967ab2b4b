//! CHORUS workbench engine - workbench reconciliation and stream proxy

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use chorus_cluster::{ClusterAdapter, DiscoveryKindResolver, KubeClusterApi, KubeTunnelOpener};
use chorus_common::kube_utils::create_client;
use chorus_common::telemetry::{init_telemetry, TelemetryConfig};
use chorus_common::Config;
use chorus_proxy::{HttpTransport, ProxyCache, RetryTransport, RouteCache};
use chorus_service::{MemoryStore, NullUserDirectory, ServiceDeps, WorkbenchService};

/// Header carrying the caller's tenant
const TENANT_HEADER: &str = "x-tenant-id";
/// Tenant assumed when the header is absent or malformed
const DEFAULT_TENANT: u64 = 1;

/// CHORUS workbench engine
#[derive(Parser, Debug)]
#[command(name = "chorus-workbench", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", env = "CHORUS_CONFIG")]
    config: PathBuf,

    /// Address the HTTP server listens on
    #[arg(long, env = "CHORUS_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Emit plain-text logs instead of JSON
    #[arg(long)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json_logs: !cli.plain_logs,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let config = Config::load(&cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to load config {:?}: {}", cli.config, e))?;

    run(cli.listen, config).await
}

async fn run(listen: SocketAddr, config: Config) -> anyhow::Result<()> {
    tracing::info!("CHORUS workbench engine starting...");
    let k8s = &config.clients.k8s_client;
    let wb_config = config.services.workbench_service.clone();
    let cancel = CancellationToken::new();

    let client = create_client(k8s)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let adapter = Arc::new(ClusterAdapter::new(
        Arc::new(KubeClusterApi::new(client.clone())),
        Arc::new(DiscoveryKindResolver::new(client.clone())),
        k8s,
    ));

    let transport = HttpTransport::new(&wb_config.round_tripper)
        .map_err(|e| anyhow::anyhow!("Failed to build upstream transport: {}", e))?;
    let transport = Arc::new(RetryTransport::new(
        transport,
        wb_config.round_tripper.max_transient_retry,
    ));

    let routes = Arc::new(RouteCache::new());
    let proxies = Arc::new(ProxyCache::new(
        wb_config.backend_in_k8s,
        adapter.clone(),
        Arc::new(KubeTunnelOpener::new(client.clone(), cancel.clone())),
        transport,
        routes.clone(),
    ));

    let store = Arc::new(MemoryStore::new());
    let service = WorkbenchService::new(
        ServiceDeps {
            store: store.clone(),
            apps: store,
            users: Arc::new(NullUserDirectory),
            cluster: adapter.clone(),
            proxy: proxies.clone(),
            routes,
        },
        wb_config.clone(),
    );

    let mut tasks = service.start(cancel.clone());
    tasks.push(tokio::spawn(
        proxies.run_health_sweep(wb_config.tunnel_health_check_interval, cancel.clone()),
    ));

    if k8s.is_watcher {
        adapter.on_new_workbench(service.watch_handler());
        adapter.on_update_workbench(service.watch_handler());
        let watcher = adapter.clone();
        let watch_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = watcher.run_watch(client, watch_cancel).await {
                tracing::error!(error = %e, "Workbench watch failed");
            }
        }));
        tracing::info!("Workbench watcher started");
    } else {
        tracing::info!("Workbench watcher disabled, not registering handlers");
    }

    let mut app = Router::new().route("/healthz", get(healthz));
    if wb_config.stream_proxy_enabled {
        app = app
            .route("/api/rest/v1/workbenches/{id}/stream", any(proxy_stream))
            .route("/api/rest/v1/workbenches/{id}/stream/{*rest}", any(proxy_stream));
    }
    let app = app.with_state(service);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", listen, e))?;
    tracing::info!(addr = %listen, "HTTP server listening");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server failed: {}", e))?;

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("CHORUS workbench engine shutting down");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct StreamPath {
    id: u64,
}

async fn proxy_stream(
    State(service): State<WorkbenchService>,
    Path(StreamPath { id }): Path<StreamPath>,
    request: Request,
) -> Response {
    let tenant_id = tenant_id(request.headers());
    match service.proxy_workbench(tenant_id, id, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(workbench_id = id, tenant_id, error = %e, "Unable to proxy workbench");
            e.into_response()
        }
    }
}

fn tenant_id(headers: &HeaderMap) -> u64 {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_TENANT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_header_defaults_to_one() {
        let mut headers = HeaderMap::new();
        assert_eq!(tenant_id(&headers), 1);

        headers.insert(TENANT_HEADER, "17".parse().unwrap());
        assert_eq!(tenant_id(&headers), 17);

        headers.insert(TENANT_HEADER, "tenant-a".parse().unwrap());
        assert_eq!(tenant_id(&headers), 1);
    }

    #[test]
    fn test_cli_reads_config_path() {
        let cli = Cli::parse_from(["chorus-workbench", "--config", "/etc/chorus/config.yaml"]);
        assert_eq!(cli.config, PathBuf::from("/etc/chorus/config.yaml"));
        assert_eq!(cli.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
    }
}
