//! Error types for the stream proxy

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use chorus_cluster::ClusterError;

/// Failure of a single upstream round trip
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or the response head not received
    #[error("upstream request failed: {message}")]
    Request {
        /// Full error chain, outermost first
        message: String,
        /// Whether the client flagged the failure as a timeout
        timeout: bool,
    },

    /// No response head arrived in time
    #[error("upstream response header timeout after {after:?}")]
    HeaderTimeout {
        /// Configured limit
        after: Duration,
    },

    /// The upstream answered 101 but the connection could not be taken over
    #[error("upstream upgrade failed: {0}")]
    Upgrade(String),

    /// The transport could not be built from its configuration
    #[error("transport configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the failure was a timeout of any kind
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Request { timeout: true, .. } | Self::HeaderTimeout { .. }
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request {
            timeout: e.is_timeout(),
            message: error_chain(&e),
        }
    }
}

/// Render an error and all of its sources as `outer: inner: root`
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Error answered to a proxied client
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The route to the workbench could not be established
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The upstream round trip failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The incoming request could not be forwarded
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Whether the failure points at the route itself rather than the request
    ///
    /// Only these failures should tear down a cached route.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, Self::Cluster(_) | Self::Transport(_))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Cluster(_) | ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, format!("Proxy Error: {self}")).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Outer(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)",
        ));
        assert_eq!(error_chain(&err), "outer: Connection refused (os error 111)");
    }

    #[test]
    fn test_timeouts_are_flagged() {
        assert!(TransportError::HeaderTimeout {
            after: Duration::from_secs(1)
        }
        .is_timeout());
        assert!(!TransportError::Upgrade("closed".into()).is_timeout());
    }

    #[test]
    fn test_transport_failure_maps_to_bad_gateway() {
        let response = ProxyError::Transport(TransportError::Upgrade("closed".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_only_route_failures_are_upstream_failures() {
        assert!(ProxyError::Transport(TransportError::Upgrade("closed".into())).is_upstream_failure());
        assert!(!ProxyError::InvalidRequest("body too large".into()).is_upstream_failure());
    }

    #[test]
    fn test_cluster_failure_maps_to_bad_gateway() {
        let err = ProxyError::Cluster(ClusterError::PodNotFound {
            namespace: "workspace7".into(),
            workbench: "workbench42".into(),
        });
        assert_eq!(
            err.to_string(),
            "no pod found for workbench workspace7/workbench42"
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
