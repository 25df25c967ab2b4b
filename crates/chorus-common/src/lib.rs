//! Shared infrastructure for the CHORUS workbench engine: errors,
//! configuration, telemetry, metrics and Kubernetes client helpers.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use config::Config;
pub use error::Error;

/// Result type alias using the shared Error type
pub type Result<T> = std::result::Result<T, Error>;
