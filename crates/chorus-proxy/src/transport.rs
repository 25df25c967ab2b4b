//! Upstream round trips with bounded retry on transient connection errors
//!
//! Requests are buffered into [`OutboundRequest`] so a failed attempt can be
//! replayed. Upgrade requests are never replayed: the first attempt owns the
//! client's connection.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, StatusCode};
use futures::TryStreamExt;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use chorus_common::config::RoundTripperConfig;

use crate::error::TransportError;

/// Error-chain fragments that mark a connection-level, retryable failure
const TRANSIENT_ERRORS: &[&str] = &[
    "connection reset by peer",
    "broken pipe",
    "unexpected eof",
    "connection timed out",
    "operation not permitted",
    // Seen while a fresh tunnel is still warming up
    "connection refused",
];

/// A request ready to be sent upstream, replayable across attempts
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute upstream URL
    pub url: String,
    /// Headers to send
    pub headers: HeaderMap,
    /// Buffered request body
    pub body: Bytes,
}

impl OutboundRequest {
    /// Whether the request asks to switch protocols
    pub fn is_upgrade(&self) -> bool {
        is_upgrade(&self.headers)
    }
}

/// Whether any `Connection` token is `upgrade` and an `Upgrade` header is set
///
/// `Connection` is a token list, so `keep-alive, Upgrade` counts.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        && headers.contains_key(header::UPGRADE)
}

/// Body of an upstream response
pub enum UpstreamBody {
    /// Regular streamed body
    Stream(Body),
    /// Connection taken over after `101 Switching Protocols`
    Upgraded(reqwest::Upgraded),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Stream"),
            Self::Upgraded(_) => f.write_str("Upgraded"),
        }
    }
}

/// Response head plus body from the upstream
#[derive(Debug)]
pub struct UpstreamResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Body or upgraded connection
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    /// Build a response with a fixed body
    pub fn new(status: StatusCode, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: UpstreamBody::Stream(body.into()),
        }
    }
}

/// One upstream round trip
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoundTrip: Send + Sync {
    /// Send `request` and return the response head
    async fn round_trip(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError>;
}

/// [`RoundTrip`] over reqwest
///
/// Upgrade requests go through a separate HTTP/1-only client since protocol
/// switching isn't defined for HTTP/2.
pub struct HttpTransport {
    client: reqwest::Client,
    upgrade_client: reqwest::Client,
    response_header_timeout: Option<Duration>,
}

impl HttpTransport {
    /// Build both clients from the round-tripper settings
    pub fn new(config: &RoundTripperConfig) -> Result<Self, TransportError> {
        let mut builder = base_builder(config);
        if !config.force_attempt_http2 {
            builder = builder.http1_only();
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;
        let upgrade_client = base_builder(config)
            .http1_only()
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            upgrade_client,
            response_header_timeout: config.response_header_timeout,
        })
    }
}

fn base_builder(config: &RoundTripperConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.dial_timeout)
        .tcp_keepalive(config.dial_keep_alive)
        .pool_idle_timeout(config.idle_conn_timeout)
        .pool_max_idle_per_host(config.max_idle_conns_per_host)
}

#[async_trait]
impl RoundTrip for HttpTransport {
    async fn round_trip(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        let upgrade = request.is_upgrade();
        let client = if upgrade {
            &self.upgrade_client
        } else {
            &self.client
        };

        let mut builder = client
            .request(request.method, &request.url)
            .headers(request.headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = match self.response_header_timeout {
            Some(after) => tokio::time::timeout(after, builder.send())
                .await
                .map_err(|_| TransportError::HeaderTimeout { after })??,
            None => builder.send().await?,
        };

        let status = response.status();
        let headers = response.headers().clone();
        debug!(url = %request.url, status = %status, "upstream responded");

        let body = if status == StatusCode::SWITCHING_PROTOCOLS {
            let upgraded = response
                .upgrade()
                .await
                .map_err(|e| TransportError::Upgrade(e.to_string()))?;
            UpstreamBody::Upgraded(upgraded)
        } else {
            UpstreamBody::Stream(Body::from_stream(
                response.bytes_stream().map_err(std::io::Error::other),
            ))
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Retries an inner transport on transient connection errors
pub struct RetryTransport<T> {
    inner: T,
    max_attempts: u32,
}

impl<T: RoundTrip> RetryTransport<T> {
    /// Wrap `inner`, attempting at most `max_transient_retry` times
    ///
    /// A limit of 0 is treated as 1.
    pub fn new(inner: T, max_transient_retry: u32) -> Self {
        Self {
            inner,
            max_attempts: max_transient_retry.max(1),
        }
    }
}

#[async_trait]
impl<T: RoundTrip> RoundTrip for RetryTransport<T> {
    async fn round_trip(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        if request.is_upgrade() {
            return self.inner.round_trip(request).await;
        }

        let mut attempt = 1;
        loop {
            match self.inner.round_trip(request.clone()).await {
                Err(e) if attempt < self.max_attempts && is_transient(&e) => {
                    warn!(
                        url = %request.url,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "transient upstream error, retrying"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Whether a failed round trip is worth repeating
pub fn is_transient(err: &TransportError) -> bool {
    if err.is_timeout() {
        return true;
    }
    let message = err.to_string().to_lowercase();
    TRANSIENT_ERRORS.iter().any(|fragment| message.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn request() -> OutboundRequest {
        OutboundRequest {
            method: Method::GET,
            url: "http://127.0.0.1:9/".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn upgrade_request() -> OutboundRequest {
        let mut req = request();
        req.headers
            .insert(header::CONNECTION, "Upgrade".parse().expect("header value"));
        req.headers
            .insert(header::UPGRADE, "websocket".parse().expect("header value"));
        req
    }

    fn refused() -> TransportError {
        TransportError::Request {
            message: "error sending request: tcp connect error: Connection refused (os error 111)"
                .to_string(),
            timeout: false,
        }
    }

    /// Transport that counts attempts and fails until `succeed_on`
    struct Counting {
        attempts: Arc<AtomicU32>,
        succeed_on: Option<u32>,
        error: fn() -> TransportError,
    }

    #[async_trait]
    impl RoundTrip for Counting {
        async fn round_trip(&self, _request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on {
                Some(n) if attempt >= n => Ok(UpstreamResponse::new(StatusCode::OK, "ok")),
                _ => Err((self.error)()),
            }
        }
    }

    fn counting(succeed_on: Option<u32>, error: fn() -> TransportError) -> (Counting, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        (
            Counting {
                attempts: attempts.clone(),
                succeed_on,
                error,
            },
            attempts,
        )
    }

    // =========================================================================
    // Retry boundaries
    // =========================================================================

    #[tokio::test]
    async fn test_always_transient_exhausts_attempts() {
        let (inner, attempts) = counting(None, refused);
        let transport = RetryTransport::new(inner, 3);

        let err = transport.round_trip(request()).await.expect_err("fails");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_upgrade_is_attempted_once() {
        let (inner, attempts) = counting(None, refused);
        let transport = RetryTransport::new(inner, 3);

        transport.round_trip(upgrade_request()).await.expect_err("fails");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upgrade_token_in_connection_list_is_attempted_once() {
        let (inner, attempts) = counting(None, || TransportError::Request {
            message: "connection reset by peer".to_string(),
            timeout: false,
        });
        let transport = RetryTransport::new(inner, 3);

        let mut req = upgrade_request();
        req.headers.insert(
            header::CONNECTION,
            "keep-alive, Upgrade".parse().expect("header value"),
        );

        transport.round_trip(req).await.expect_err("fails");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, Upgrade".parse().expect("value"));
        assert!(!is_upgrade(&headers), "Upgrade header is required");

        headers.insert(header::UPGRADE, "websocket".parse().expect("value"));
        assert!(is_upgrade(&headers));

        headers.insert(header::CONNECTION, "keep-alive".parse().expect("value"));
        assert!(!is_upgrade(&headers));
    }

    #[tokio::test]
    async fn test_success_on_second_attempt() {
        let (inner, attempts) = counting(Some(2), refused);
        let transport = RetryTransport::new(inner, 3);

        let response = transport.round_trip(request()).await.expect("succeeds");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let (inner, attempts) = counting(None, || TransportError::Request {
            message: "invalid certificate".to_string(),
            timeout: false,
        });
        let transport = RetryTransport::new(inner, 3);

        transport.round_trip(request()).await.expect_err("fails");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_still_attempts_once() {
        let (inner, attempts) = counting(None, refused);
        let transport = RetryTransport::new(inner, 0);

        transport.round_trip(request()).await.expect_err("fails");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mocked_timeout_is_retried() {
        let mut inner = MockRoundTrip::new();
        inner.expect_round_trip().times(2).returning(|_| {
            Err(TransportError::HeaderTimeout {
                after: Duration::from_millis(10),
            })
        });
        let transport = RetryTransport::new(inner, 2);

        let err = transport.round_trip(request()).await.expect_err("fails");
        assert!(err.is_timeout());
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn test_transient_classification_is_case_insensitive() {
        for message in [
            "read: Connection reset by peer",
            "write: Broken pipe",
            "Unexpected EOF during handshake",
            "dial: Connection timed out",
            "socket: Operation not permitted",
        ] {
            let err = TransportError::Request {
                message: message.to_string(),
                timeout: false,
            };
            assert!(is_transient(&err), "{message} should be transient");
        }
        assert!(!is_transient(&TransportError::Upgrade("closed".into())));
    }

    #[test]
    fn test_connection_header_detection() {
        assert!(upgrade_request().is_upgrade());
        assert!(!request().is_upgrade());
    }
}
