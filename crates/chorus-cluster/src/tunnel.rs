//! Local port-forward tunnels to workbench pods
//!
//! A tunnel binds `127.0.0.1:0` and bridges every accepted connection to a
//! fresh kube `portforward` stream on the pod. Dropping the [`Tunnel`] or
//! cancelling its token stops the accept loop and every live bridge.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::ClusterError;

/// Port the workbench server listens on inside the pod
pub const WORKBENCH_PORT: u16 = 8080;

/// A running tunnel, stopped when dropped
#[derive(Debug)]
pub struct Tunnel {
    local_port: u16,
    stop: CancellationToken,
}

impl Tunnel {
    /// Wrap an already-bound local port and the token that stops it
    pub fn new(local_port: u16, stop: CancellationToken) -> Self {
        Self { local_port, stop }
    }

    /// Local port assigned by the OS
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Base URL for requests through the tunnel
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }

    /// Stop accepting and tear down live bridges
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether the tunnel has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Opens tunnels to a pod port
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    /// Open a tunnel to `remote_port` on `pod`
    ///
    /// Returns once the local listener is bound.
    async fn open(&self, namespace: &str, pod: &str, remote_port: u16) -> Result<Tunnel, ClusterError>;
}

/// [`TunnelOpener`] backed by the kube portforward subresource
pub struct KubeTunnelOpener {
    client: Client,
    shutdown: CancellationToken,
}

impl KubeTunnelOpener {
    /// Create an opener whose tunnels also stop when `shutdown` is cancelled
    pub fn new(client: Client, shutdown: CancellationToken) -> Self {
        Self { client, shutdown }
    }
}

#[async_trait]
impl TunnelOpener for KubeTunnelOpener {
    async fn open(&self, namespace: &str, pod: &str, remote_port: u16) -> Result<Tunnel, ClusterError> {
        let target = format!("{namespace}/{pod}");
        let (listener, local_port) = bind_local(&target).await?;
        let stop = self.shutdown.child_token();

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_name = pod.to_string();
        let connect = move || {
            let pods = pods.clone();
            let pod_name = pod_name.clone();
            async move {
                let mut forwarder = pods
                    .portforward(&pod_name, &[remote_port])
                    .await
                    .map_err(|e| ClusterError::kube(format!("portforward {pod_name}"), e))?;
                let stream = forwarder
                    .take_stream(remote_port)
                    .ok_or_else(|| ClusterError::tunnel(&pod_name, "portforward returned no stream"))?;
                tokio::spawn(async move {
                    if let Err(e) = forwarder.join().await {
                        debug!(error = %e, "portforward session closed with error");
                    }
                });
                Ok::<_, ClusterError>(stream)
            }
        };

        info!(tunnel = %target, local_port, remote_port, "tunnel listening");
        tokio::spawn(serve(listener, target, stop.clone(), connect));
        Ok(Tunnel::new(local_port, stop))
    }
}

async fn bind_local(target: &str) -> Result<(TcpListener, u16), ClusterError> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .map_err(|e| ClusterError::tunnel(target, format!("bind local listener: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| ClusterError::tunnel(target, format!("read local address: {e}")))?
        .port();
    Ok((listener, port))
}

/// Accept loop bridging local connections to upstream streams from `connect`
async fn serve<C, Fut, S>(listener: TcpListener, target: String, stop: CancellationToken, connect: C)
where
    C: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S, ClusterError>> + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connect = Arc::new(connect);
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                let connect = connect.clone();
                let stop = stop.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    bridge(conn, &target, stop, connect()).await;
                    debug!(tunnel = %target, peer = %peer, "tunnel connection closed");
                });
            }
            Err(e) => warn!(tunnel = %target, error = %e, "tunnel accept failed"),
        }
    }
    debug!(tunnel = %target, "tunnel stopped");
}

async fn bridge<Fut, S>(mut conn: TcpStream, target: &str, stop: CancellationToken, upstream: Fut)
where
    Fut: Future<Output = Result<S, ClusterError>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = match upstream.await {
        Ok(s) => s,
        Err(e) => {
            warn!(tunnel = %target, error = %e, "tunnel upstream connect failed");
            return;
        }
    };
    tokio::select! {
        _ = stop.cancelled() => {}
        res = tokio::io::copy_bidirectional(&mut conn, &mut upstream) => {
            if let Err(e) = res {
                debug!(tunnel = %target, error = %e, "tunnel bridge error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
        let addr = listener.local_addr().expect("echo addr");
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn start_tunnel(upstream: SocketAddr) -> Tunnel {
        let (listener, port) = bind_local("workspace1/pod").await.expect("bind tunnel");
        let stop = CancellationToken::new();
        let connect = move || async move {
            TcpStream::connect(upstream)
                .await
                .map_err(|e| ClusterError::tunnel("workspace1/pod", e.to_string()))
        };
        tokio::spawn(serve(listener, "workspace1/pod".to_string(), stop.clone(), connect));
        Tunnel::new(port, stop)
    }

    #[tokio::test]
    async fn test_tunnel_bridges_bytes_both_ways() {
        let upstream = echo_server().await;
        let tunnel = start_tunnel(upstream).await;

        let mut client = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
            .await
            .expect("connect tunnel");
        client.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_dropped_tunnel_stops_accepting() {
        let upstream = echo_server().await;
        let tunnel = start_tunnel(upstream).await;
        let port = tunnel.local_port();
        drop(tunnel);

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused, "listener should close after the tunnel is dropped");
    }

    #[test]
    fn test_tunnel_url_uses_loopback() {
        let tunnel = Tunnel::new(41234, CancellationToken::new());
        assert_eq!(tunnel.url(), "http://127.0.0.1:41234");
        tunnel.stop();
        assert!(tunnel.is_stopped());
    }
}
