//! Error type for cluster-side operations

use thiserror::Error;

/// Errors raised while encoding, syncing or watching workbench resources
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes API call failed
    #[error("kubernetes error during {operation}: {source}")]
    Kube {
        /// Operation that issued the call (e.g., "sync_resource")
        operation: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Discovery does not know the requested kind
    #[error("kind {kind} is not served by the cluster")]
    KindNotFound {
        /// Requested kind
        kind: String,
    },

    /// A resource quantity string could not be parsed
    #[error("invalid quantity for {field}: {value:?}")]
    InvalidQuantity {
        /// Field carrying the quantity (e.g., "resources.limits.cpu")
        field: String,
        /// Offending value
        value: String,
    },

    /// A generated identifier could not be parsed back
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidIdentifier {
        /// Offending identifier
        value: String,
        /// What's wrong with it
        reason: String,
    },

    /// A required label is missing
    #[error("missing label {label}")]
    MissingLabel {
        /// Label key
        label: String,
    },

    /// A label value could not be parsed
    #[error("invalid value {value:?} for label {label}")]
    InvalidLabel {
        /// Label key
        label: String,
        /// Offending value
        value: String,
    },

    /// Object could not be converted to or from its wire shape
    #[error("serialization error for {kind}: {message}")]
    Serialization {
        /// Resource kind being converted
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Workbench resource does not exist
    #[error("workbench {namespace}/{name} not found")]
    WorkbenchNotFound {
        /// Workspace namespace
        namespace: String,
        /// Workbench name
        name: String,
    },

    /// No pod carries the workbench label
    #[error("no pod found for workbench {namespace}/{workbench}")]
    PodNotFound {
        /// Workspace namespace
        namespace: String,
        /// Workbench name
        workbench: String,
    },

    /// Port-forward tunnel could not be established
    #[error("tunnel error for {target}: {message}")]
    Tunnel {
        /// `namespace/workbench` of the tunnel
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Shared infrastructure error (polling timeouts, client setup)
    #[error(transparent)]
    Common(#[from] chorus_common::Error),
}

impl ClusterError {
    /// Wrap a kube error with the operation that produced it
    pub fn kube(operation: impl Into<String>, source: kube::Error) -> Self {
        Self::Kube {
            operation: operation.into(),
            source,
        }
    }

    /// Create an invalid identifier error
    pub fn invalid_identifier(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error for a resource kind
    pub fn serialization(kind: impl Into<String>, message: impl ToString) -> Self {
        Self::Serialization {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    /// Create a tunnel error
    pub fn tunnel(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tunnel {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether the error is an API 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source, .. } if chorus_common::kube_utils::is_not_found(source))
    }

    /// Whether the error is an API 409 (object already exists)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(resp), .. } if resp.code == 409)
    }
}
