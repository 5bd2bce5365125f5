use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct BatcherStatsInner {
    pub enqueued: AtomicU64,
    pub sent_ok: AtomicU64,
    pub sent_failed: AtomicU64,
    pub retried: AtomicU64,
    pub dlq_routed: AtomicU64,
    pub circuit_blocked: AtomicU64,
    pub queue_full_rejections: AtomicU64,
    pub current_batch_size: AtomicUsize,
    pub current_flush_delay_ms: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct BatcherStats {
    pub enqueued: u64,
    pub sent_ok: u64,
    pub sent_failed: u64,
    pub retried: u64,
    pub dlq_routed: u64,
    pub circuit_blocked: u64,
    pub queue_full_rejections: u64,
    pub current_batch_size: usize,
    pub current_flush_delay_ms: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

impl BatcherStatsInner {
    pub fn snapshot(&self, queue_depth: usize, queue_capacity: usize) -> BatcherStats {
        BatcherStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent_ok: self.sent_ok.load(Ordering::Relaxed),
            sent_failed: self.sent_failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dlq_routed: self.dlq_routed.load(Ordering::Relaxed),
            circuit_blocked: self.circuit_blocked.load(Ordering::Relaxed),
            queue_full_rejections: self.queue_full_rejections.load(Ordering::Relaxed),
            current_batch_size: self.current_batch_size.load(Ordering::Relaxed),
            current_flush_delay_ms: self.current_flush_delay_ms.load(Ordering::Relaxed),
            queue_depth,
            queue_capacity,
        }
    }
}
