//! The dispatcher: the single entry point producers call, and the
//! orchestrator that turns an accepted line into per-sink batches.
//!
//! Pipeline order (strict, per call to `handle`):
//! 1. shutdown check
//! 2. feedback guard
//! 3. construct the `Record`
//! 4. dedup
//! 5. transform
//! 6. rate limit
//! 7. copy-fan-out to every registered sink's batcher

pub mod feedback;
pub mod ratelimit;
mod stats;
pub mod transform;

pub use feedback::{FeedbackAction, FeedbackDecision, FeedbackGuard, FeedbackGuardConfig};
pub use ratelimit::{TokenBucket, TokenBucketConfig};
pub use stats::DispatcherStats;
pub use transform::{TransformFailurePolicy, TransformFn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use logagent_batch::{AdaptiveBatcher, EnqueueError};
use logagent_core::{DedupKey, DlqEntry, DropReason, Record, SourceCursor, SourceType};
use logagent_dedup::DedupCache;
use logagent_dlq::DeadLetterQueue;
use metrics::counter;
use tracing::warn;
use stats::DispatcherStatsInner;

struct SinkEntry {
    batcher: Arc<AdaptiveBatcher>,
    dlq: Arc<DeadLetterQueue>,
}

pub struct DispatcherConfig {
    pub enqueue_wait: Duration,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
    pub dedup_timestamp_bucket_secs: i64,
    pub transform_failure_policy: TransformFailurePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enqueue_wait: Duration::from_millis(50),
            dedup_ttl: Duration::from_secs(300),
            dedup_capacity: 1_000_000,
            dedup_timestamp_bucket_secs: 0,
            transform_failure_policy: TransformFailurePolicy::default(),
        }
    }
}

/// The single producer-facing entry point, and the fan-out orchestrator
/// behind it. Holds no network/disk state of its own — every suspension
/// point (sink I/O, disk writes) lives one layer down, in the per-sink
/// `AdaptiveBatcher`s it fans out to.
pub struct Dispatcher {
    config: DispatcherConfig,
    shutdown: AtomicBool,
    feedback_guard: FeedbackGuard,
    dedup: Arc<DedupCache>,
    rate_limiter: TokenBucket,
    transform: Option<TransformFn>,
    sinks: parking_lot::RwLock<HashMap<String, SinkEntry>>,
    stats: DispatcherStatsInner,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        feedback_guard: FeedbackGuard,
        rate_limiter: TokenBucket,
        transform: Option<TransformFn>,
    ) -> Self {
        let dedup = Arc::new(DedupCache::new(config.dedup_capacity, config.dedup_ttl));
        Self {
            config,
            shutdown: AtomicBool::new(false),
            feedback_guard,
            dedup,
            rate_limiter,
            transform,
            sinks: parking_lot::RwLock::new(HashMap::new()),
            stats: DispatcherStatsInner::default(),
        }
    }

    /// Starts accepting records. A no-op today beyond clearing the
    /// shutdown flag: every background task (batchers, sweepers, flush
    /// loops) is spawned by the binary that owns this dispatcher, which
    /// is also what `Stop()` below coordinates with via their shared
    /// cancellation token.
    pub fn start(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
    }

    /// Idempotent: marks the dispatcher closed to new `handle` calls.
    /// Safe to call from multiple callers concurrently.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Registers a sink's batcher (already spawned, with its own circuit
    /// breaker, DLQ, and on-success hook) for fan-out.
    pub fn add_sink(&self, batcher: Arc<AdaptiveBatcher>, dlq: Arc<DeadLetterQueue>) {
        let name = batcher.name().to_string();
        self.sinks.write().insert(name, SinkEntry { batcher, dlq });
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot()
    }

    /// The dispatcher's single entry point. `timestamp` and `cursor` are
    /// producer-supplied metadata threaded alongside `message`/`labels` —
    /// a real file-tailer or container-stream producer has both readily
    /// available (the parsed line timestamp, and the byte range or
    /// container timestamp it just read) and passing them here is what
    /// lets the success path advance `PositionStore` and lets
    /// `TimestampGuard` see the source-assigned time rather than
    /// `processed_at`.
    pub async fn handle(
        &self,
        source_type: SourceType,
        source_id: &str,
        message: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
        labels: HashMap<String, String>,
        cursor: Option<SourceCursor>,
    ) -> Result<(), DropReason> {
        if self.is_shut_down() {
            self.stats.record_drop("shutdown");
            counter!("logagent.dispatcher.dropped", 1, "reason" => "shutdown");
            return Err(DropReason::Shutdown);
        }

        let message: String = message.into();
        let now = Utc::now();

        let feedback_decision = self.feedback_guard.check(source_id, &message, &labels, now.timestamp());
        if feedback_decision == FeedbackDecision::Drop {
            self.stats.record_drop("feedback_loop");
            counter!("logagent.dispatcher.dropped", 1, "reason" => "feedback_loop");
            return Err(DropReason::FeedbackLoop);
        }

        let inferred_timestamp = timestamp.is_none();
        let record_timestamp = timestamp.unwrap_or(now);

        let record = Record::new(source_type, source_id, message, record_timestamp, now, labels);
        let record = match cursor {
            Some(c) => record.with_cursor(c),
            None => record,
        };
        if inferred_timestamp {
            record.set_label("inferred_timestamp", "true");
        }
        if feedback_decision == FeedbackDecision::Tag {
            record.set_label("self_log", "true");
        }

        let bucket = if self.config.dedup_timestamp_bucket_secs > 0 {
            Some((record.timestamp, self.config.dedup_timestamp_bucket_secs))
        } else {
            None
        };
        let key = DedupKey::new(&record.source_id, &record.message, bucket);
        if self.dedup.seen_or_insert(key) {
            self.stats.dedup_hits.fetch_add(1, Ordering::Relaxed);
            self.stats.record_drop("duplicate");
            counter!("logagent.dispatcher.dedup_hits", 1);
            return Err(DropReason::Duplicate);
        }

        if let Some(transform) = &self.transform {
            if let Err(err) = transform(&record) {
                self.stats.transform_errors.fetch_add(1, Ordering::Relaxed);
                record.push_step(logagent_core::ProcessingStep {
                    name: "transform".to_string(),
                    duration: Duration::ZERO,
                    success: false,
                    error: Some(err.clone()),
                });
                if self.config.transform_failure_policy == TransformFailurePolicy::Drop {
                    self.stats.record_drop("invalid");
                    counter!("logagent.dispatcher.dropped", 1, "reason" => "invalid");
                    return Err(DropReason::Invalid);
                }
            }
        }

        if !self.rate_limiter.try_acquire() {
            self.stats.throttled.fetch_add(1, Ordering::Relaxed);
            self.stats.record_drop("rate_limited");
            counter!("logagent.dispatcher.dropped", 1, "reason" => "rate_limited");
            return Err(DropReason::RateLimited);
        }

        self.stats.total_accepted.fetch_add(1, Ordering::Relaxed);
        counter!("logagent.dispatcher.accepted", 1);

        let sinks: Vec<(String, Arc<AdaptiveBatcher>, Arc<DeadLetterQueue>)> = self
            .sinks
            .read()
            .values()
            .map(|e| (e.batcher.name().to_string(), e.batcher.clone(), e.dlq.clone()))
            .collect();

        let mut any_queue_full = false;
        for (sink_name, batcher, dlq) in sinks {
            let copy = record.deep_copy();
            match batcher.enqueue(copy, self.config.enqueue_wait).await {
                Ok(()) => {
                    self.stats.record_enqueued(&sink_name);
                    counter!("logagent.dispatcher.enqueued", 1, "sink" => sink_name.clone());
                }
                Err(EnqueueError::QueueFull) | Err(EnqueueError::Closed) => {
                    any_queue_full = true;
                    route_single_record_to_dlq(&dlq, &sink_name, &record);
                    counter!("logagent.dispatcher.dropped", 1, "reason" => "queue_full", "sink" => sink_name.clone());
                    warn!(sink = sink_name, "dropping record: sink queue full or closed");
                }
            }
        }

        if any_queue_full {
            self.stats.record_drop("queue_full");
            return Err(DropReason::QueueFull);
        }

        Ok(())
    }
}

fn route_single_record_to_dlq(dlq: &DeadLetterQueue, sink_name: &str, record: &Record) {
    let envelope = logagent_core::BatchEnvelope::new(sink_name, vec![record.deep_copy()]);
    let entry = DlqEntry::from_batch(&envelope, "queue_full", "sink batcher queue full or closed", HashMap::new());
    if let Err(err) = dlq.enqueue(&entry) {
        warn!(sink = sink_name, error = %err, "failed to dead-letter a queue_full record");
    }
}
