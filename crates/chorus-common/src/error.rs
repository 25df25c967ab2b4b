//! Error types shared across the CHORUS workbench crates
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context (operation, resource kind) needed to
//! locate a failure from a single log line.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for shared infrastructure
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
        /// The offending config key (e.g., "clients.k8s_client.api_server")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "poll_until")
        context: String,
    },
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a config error pointing at a specific key
    pub fn config_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization_for("yaml", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_includes_context() {
        let err = Error::internal_with_context("poll_until", "timed out");
        assert_eq!(err.to_string(), "internal error [poll_until]: timed out");
    }

    #[test]
    fn internal_without_context_uses_unknown() {
        match Error::internal("boom") {
            Error::Internal { context, .. } => assert_eq!(context, UNKNOWN_CONTEXT),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn config_field_is_recorded() {
        match Error::config_field("services.workbench_service", "bad interval") {
            Error::Config { field, message } => {
                assert_eq!(field.as_deref(), Some("services.workbench_service"));
                assert_eq!(message, "bad interval");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
