//! Metrics for workbench observability
//!
//! Instruments are created lazily on the global meter, so they are no-ops
//! until [`crate::telemetry::init_telemetry`] installs an exporting provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("chorus"));

// ============================================================================
// Proxy Metrics
// ============================================================================

/// Counter of requests proxied to a workbench
///
/// Labels:
/// - `workbench`: cluster name of the workbench (e.g., "workbench42")
pub static WORKBENCH_PROXY_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("chorus_workbench_proxy_requests_total")
        .with_description("Total number of requests proxied to a workbench")
        .with_unit("{requests}")
        .build()
});

/// Counter of proxy cache evictions
///
/// Labels:
/// - `reason`: proxy_error, health_check
pub static PROXY_CACHE_EVICTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("chorus_proxy_cache_evictions_total")
        .with_description("Total number of proxy cache entries evicted")
        .with_unit("{evictions}")
        .build()
});

/// Counter of proxy hits dropped because the batch could not be persisted
pub static PROXY_HITS_LOST: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("chorus_proxy_hits_lost_total")
        .with_description("Total number of proxy hits lost on failed batch saves")
        .with_unit("{hits}")
        .build()
});

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Counter of workbench cluster syncs
///
/// Labels:
/// - `operation`: sync, delete
/// - `result`: success, error
pub static WORKBENCH_SYNCS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("chorus_workbench_sync_total")
        .with_description("Total number of workbench cluster syncs")
        .with_unit("{syncs}")
        .build()
});

/// Result label value for a successful operation
pub const RESULT_SUCCESS: &str = "success";
/// Result label value for a failed operation
pub const RESULT_ERROR: &str = "error";

/// Record one proxied request for a workbench
pub fn record_proxy_request(workbench: &str) {
    WORKBENCH_PROXY_REQUESTS.add(1, &[KeyValue::new("workbench", workbench.to_string())]);
}

/// Record a proxy cache eviction
pub fn record_eviction(reason: &'static str) {
    PROXY_CACHE_EVICTIONS.add(1, &[KeyValue::new("reason", reason)]);
}

/// Record the outcome of a workbench sync or delete
pub fn record_sync(operation: &'static str, ok: bool) {
    let result = if ok { RESULT_SUCCESS } else { RESULT_ERROR };
    WORKBENCH_SYNCS.add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
}
