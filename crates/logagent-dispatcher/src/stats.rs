use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub total_accepted: u64,
    pub drop_reasons: HashMap<String, u64>,
    pub per_sink_enqueued: HashMap<String, u64>,
    pub dedup_hits: u64,
    pub throttled: u64,
    pub transform_errors: u64,
}

#[derive(Default)]
pub(crate) struct DispatcherStatsInner {
    pub total_accepted: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub throttled: AtomicU64,
    pub transform_errors: AtomicU64,
    pub drop_reasons: Mutex<HashMap<String, u64>>,
    pub per_sink_enqueued: Mutex<HashMap<String, u64>>,
}

impl DispatcherStatsInner {
    pub fn record_drop(&self, reason: &str) {
        *self.drop_reasons.lock().entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_enqueued(&self, sink_name: &str) {
        *self.per_sink_enqueued.lock().entry(sink_name.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            drop_reasons: self.drop_reasons.lock().clone(),
            per_sink_enqueued: self.per_sink_enqueued.lock().clone(),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            transform_errors: self.transform_errors.load(Ordering::Relaxed),
        }
    }
}
