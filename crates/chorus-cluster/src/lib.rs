//! Cluster side of the CHORUS workbench engine: the Workbench custom
//! resource, its codec, idempotent sync primitives, the watch subscription
//! and port-forward tunnels.

#![deny(missing_docs)]

pub mod adapter;
pub mod api;
pub mod codec;
pub mod crd;
pub mod error;
pub mod kind_resolver;
pub mod merge;
pub mod names;
pub mod tunnel;
pub mod watch;

pub use adapter::{ClusterAdapter, SyncOutcome};
pub use api::{ClusterApi, KubeClusterApi, ObjectKey};
pub use codec::{AppResources, ClusterApp, ClusterWorkbench, CodecConfig};
pub use crd::{AppState, AppStatus, ServerPodStatus, ServerStatus, Workbench};
pub use error::ClusterError;
pub use kind_resolver::{DiscoveryKindResolver, KindResolver};
pub use names::{AppUid, WorkbenchRef};
pub use tunnel::{KubeTunnelOpener, Tunnel, TunnelOpener, WORKBENCH_PORT};
pub use watch::{HandlerError, WatchHandlers, WorkbenchEventHandler};
