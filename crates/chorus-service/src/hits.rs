//! Proxy hit batching
//!
//! Every proxied request bumps an in-memory counter. A background loop swaps
//! the counters out and persists them in one store call, so the request path
//! never waits on the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use chorus_cluster::names::workbench_name;
use chorus_common::metrics;

use crate::store::WorkbenchStore;

/// Upper bound of the random delay added to each flush interval
pub const FLUSH_JITTER: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Pending {
    counts: HashMap<u64, u64>,
    last_hits: HashMap<u64, DateTime<Utc>>,
}

/// Hit counts and last-hit times accumulated since the last flush
#[derive(Debug, Default)]
pub struct HitBatch {
    pending: Mutex<Pending>,
}

impl HitBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request to a workbench
    pub fn record(&self, workbench_id: u64) {
        metrics::record_proxy_request(&workbench_name(workbench_id));

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending.counts.entry(workbench_id).or_default() += 1;
        pending.last_hits.insert(workbench_id, Utc::now());
    }

    /// Take everything accumulated so far, leaving the batch empty
    pub fn take(&self) -> (HashMap<u64, u64>, HashMap<u64, DateTime<Utc>>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        (
            std::mem::take(&mut pending.counts),
            std::mem::take(&mut pending.last_hits),
        )
    }

    /// Persist the current batch
    ///
    /// On failure the taken hits are dropped and counted as lost.
    pub async fn flush(&self, store: &dyn WorkbenchStore) {
        let (counts, last_hits) = self.take();
        if counts.is_empty() {
            return;
        }

        let hits: u64 = counts.values().sum();
        let workbenches = counts.len();
        match store.save_batch_proxy_hit(counts, last_hits).await {
            Ok(()) => debug!(hits, workbenches, "saved batch proxy hits"),
            Err(e) => {
                metrics::PROXY_HITS_LOST.add(hits, &[]);
                error!(
                    error = %e,
                    "unable to save batch proxy hit, losing {hits} hits to {workbenches} workbenches"
                );
            }
        }
    }
}

/// Flush `batch` every `interval` plus jitter until cancelled
///
/// A final flush runs on cancellation.
pub async fn run_hit_flush(
    batch: Arc<HitBatch>,
    store: Arc<dyn WorkbenchStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "starting proxy hit flush loop");
    loop {
        let delay = interval + jitter(FLUSH_JITTER);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => batch.flush(store.as_ref()).await,
        }
    }
    batch.flush(store.as_ref()).await;
    info!("proxy hit flush loop stopped");
}

/// Uniform random duration in `[0, max)`
pub(crate) fn jitter(max: Duration) -> Duration {
    let nanos = max.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockWorkbenchStore, StoreError};

    #[tokio::test]
    async fn test_concurrent_hits_flush_exactly_once() {
        let batch = Arc::new(HitBatch::new());
        let mut handles = Vec::new();
        for i in 0..50u64 {
            let batch = batch.clone();
            handles.push(tokio::spawn(async move { batch.record(1 + i % 2) }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut store = MockWorkbenchStore::new();
        store
            .expect_save_batch_proxy_hit()
            .times(1)
            .withf(|counts, last_hits| {
                counts.values().sum::<u64>() == 50
                    && counts.get(&1) == Some(&25)
                    && last_hits.len() == 2
            })
            .returning(|_, _| Ok(()));

        batch.flush(&store).await;

        let (counts, last_hits) = batch.take();
        assert!(counts.is_empty());
        assert!(last_hits.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_skips_store() {
        let batch = HitBatch::new();
        let mut store = MockWorkbenchStore::new();
        store.expect_save_batch_proxy_hit().never();

        batch.flush(&store).await;
    }

    #[tokio::test]
    async fn test_failed_flush_drops_hits() {
        let batch = HitBatch::new();
        batch.record(42);
        batch.record(42);

        let mut store = MockWorkbenchStore::new();
        store
            .expect_save_batch_proxy_hit()
            .times(1)
            .returning(|_, _| Err(StoreError::backend("connection lost")));

        batch.flush(&store).await;
        assert!(batch.take().0.is_empty());
    }

    #[tokio::test]
    async fn test_flush_loop_flushes_on_cancel() {
        let batch = Arc::new(HitBatch::new());
        batch.record(7);

        let mut store = MockWorkbenchStore::new();
        store
            .expect_save_batch_proxy_hit()
            .times(1)
            .returning(|_, _| Ok(()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        run_hit_flush(batch.clone(), Arc::new(store), Duration::from_secs(3600), cancel).await;
        assert!(batch.take().0.is_empty());
    }

    #[test]
    fn test_jitter_stays_below_bound() {
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(5)) < Duration::from_millis(5));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
