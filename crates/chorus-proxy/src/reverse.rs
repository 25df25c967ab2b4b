//! Single-target reverse proxy for workbench streams
//!
//! The external stream prefix is stripped before forwarding, so
//! `/api/rest/v1/workbenches/42/stream/vnc` reaches the workbench as `/vnc`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Request, Response};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info};

use crate::error::ProxyError;
use crate::transport::{is_upgrade, OutboundRequest, RoundTrip, UpstreamBody};

/// Largest request body buffered for replay
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

static STREAM_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/api/rest/v1/workbenches/[0-9]+/stream").expect("valid regex"));

/// Connection-scoped headers never forwarded as-is (RFC 9110 section 7.6.1)
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Strip the external stream prefix, keeping a leading `/`
pub fn strip_stream_prefix(path: &str) -> &str {
    let stripped = match STREAM_PREFIX.find(path) {
        Some(m) => &path[m.end()..],
        None => path,
    };
    if stripped.is_empty() {
        "/"
    } else {
        stripped
    }
}

/// Reverse proxy to one upstream base URL
pub struct ReverseProxy {
    target: String,
    transport: Arc<dyn RoundTrip>,
}

impl ReverseProxy {
    /// Proxy to `target` (scheme and authority, no trailing path)
    pub fn new(target: impl Into<String>, transport: Arc<dyn RoundTrip>) -> Self {
        Self {
            target: target.into().trim_end_matches('/').to_string(),
            transport,
        }
    }

    /// Upstream base URL
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forward one request, bridging the connection on protocol upgrade
    pub async fn forward(&self, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let url = self.upstream_url(&request);
        let upgrade = is_upgrade(request.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {e}")))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers, upgrade);
        headers.remove(header::HOST);

        debug!(method = %parts.method, url = %url, upgrade, "forwarding stream request");
        let upstream = self
            .transport
            .round_trip(OutboundRequest {
                method: parts.method,
                url,
                headers,
                body,
            })
            .await?;

        let mut response = Response::builder().status(upstream.status);
        let keep_upgrade = matches!(upstream.body, UpstreamBody::Upgraded(_));
        for (name, value) in upstream.headers.iter() {
            if keep_upgrade || !HOP_BY_HOP.contains(name) {
                response = response.header(name, value);
            }
        }

        let body = match upstream.body {
            UpstreamBody::Stream(body) => body,
            UpstreamBody::Upgraded(upstream_io) => {
                let client_upgrade = client_upgrade.ok_or_else(|| {
                    ProxyError::InvalidRequest("upstream switched protocols without an upgrade request".into())
                })?;
                tokio::spawn(bridge_upgraded(client_upgrade, upstream_io));
                Body::empty()
            }
        };

        response
            .body(body)
            .map_err(|e| ProxyError::InvalidRequest(format!("failed to build response: {e}")))
    }

    fn upstream_url(&self, request: &Request<Body>) -> String {
        let path = strip_stream_prefix(request.uri().path());
        match request.uri().query() {
            Some(q) => format!("{}{}?{}", self.target, path, q),
            None => format!("{}{}", self.target, path),
        }
    }
}

async fn bridge_upgraded(client: hyper::upgrade::OnUpgrade, mut upstream: reqwest::Upgraded) {
    match client.await {
        Ok(upgraded) => {
            let mut client = hyper_util::rt::TokioIo::new(upgraded);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((from_client, from_upstream)) => {
                    info!(from_client, from_upstream, "stream session ended");
                }
                Err(e) => debug!(error = %e, "stream bridge error"),
            }
        }
        Err(e) => error!(error = %e, "failed to upgrade client connection"),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap, upgrade: bool) {
    // Headers named by Connection are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP) {
        if upgrade && (*name == header::CONNECTION || *name == header::UPGRADE) {
            continue;
        }
        headers.remove(name);
    }
    if upgrade {
        headers.insert(header::CONNECTION, header::HeaderValue::from_static("Upgrade"));
    }
}
