//! The unit of work handed from an `AdaptiveBatcher` to a `Sink`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SinkErrorKind;
use crate::record::Record;

/// A bounded group of records plus retry/DLQ bookkeeping, produced by an
/// `AdaptiveBatcher` and consumed by `Sink::send`.
#[derive(Debug, Clone)]
pub struct BatchEnvelope {
    pub batch_id: Uuid,
    pub sink_name: String,
    pub records: Vec<Record>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Total `Sink::send` calls made for this envelope, across every retry.
    /// Distinct from `retry_count` (which only counts *failed* attempts that
    /// triggered a requeue) so a DLQ'd envelope's `attempt_count` reports the
    /// true number of send attempts, including the final one that landed it
    /// in the DLQ.
    pub attempts: u32,
    pub failure_kind: Option<SinkErrorKind>,
    pub failure_detail: Option<String>,
}

impl BatchEnvelope {
    pub fn new(sink_name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            sink_name: sink_name.into(),
            records,
            created_at: Utc::now(),
            last_attempt_at: None,
            retry_count: 0,
            attempts: 0,
            failure_kind: None,
            failure_detail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_attempt(&mut self) {
        self.last_attempt_at = Some(Utc::now());
        self.attempts += 1;
    }

    pub fn record_failure(&mut self, kind: SinkErrorKind, detail: impl Into<String>) {
        self.failure_kind = Some(kind);
        self.failure_detail = Some(detail.into());
        self.retry_count += 1;
    }
}
