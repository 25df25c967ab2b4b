//! Error types for the workbench control service

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use chorus_cluster::ClusterError;
use chorus_proxy::ProxyError;

use crate::store::StoreError;

/// Errors from workbench control operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Persistence layer failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cluster sync failure
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Stream proxy failure
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Referenced entity does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind, e.g. `workbench`
        entity: &'static str,
        /// Entity ID
        id: u64,
    },

    /// A cluster name disagrees with the IDs it was derived from
    #[error("invalid cluster name {name}: {reason}")]
    InvalidClusterName {
        /// Offending namespace or resource name
        name: String,
        /// Why it was rejected
        reason: String,
    },
}

impl ServiceError {
    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: u64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether the error means the entity is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Store(StoreError::NotFound { .. }))
    }
}

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            Self::Proxy(e) => e.into_response(),
            e if e.is_not_found() => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
            Self::Cluster(e) => (StatusCode::BAD_GATEWAY, format!("Proxy Error: {e}")).into_response(),
            e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
}
