//! Stream proxy for CHORUS workbenches: a retrying upstream transport, a
//! prefix-stripping reverse proxy and a per-workbench proxy cache backed by
//! port-forward tunnels.

#![deny(missing_docs)]

pub mod cache;
pub mod error;
pub mod reverse;
pub mod transport;

pub use cache::{EvictReason, PodLocator, ProxyCache, ProxyEntry, RouteCache, RouteKey};
pub use error::{ProxyError, TransportError};
pub use reverse::{strip_stream_prefix, ReverseProxy};
pub use transport::{HttpTransport, OutboundRequest, RetryTransport, RoundTrip, UpstreamBody, UpstreamResponse};
