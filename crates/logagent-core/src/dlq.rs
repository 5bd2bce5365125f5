//! Dead-letter entry shape, serialized one-per-line into DLQ files.
//!
//! One entry shape, one set of field names — no parallel
//! `OriginalEntry`/`Entry` or `FailureType`/`ErrorType` split.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchEnvelope;
use crate::cursor::SourceCursor;
use crate::record::{Level, ProcessingStep, Record, SourceType};

/// Serialization-friendly mirror of `Record` (the real `Record` carries
/// non-`Serialize` locks around its maps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub message: String,
    pub level: Level,
    pub source_type: SourceType,
    pub source_id: String,
    pub cursor: Option<SourceCursor>,
    pub labels: HashMap<String, String>,
    pub fields: HashMap<String, serde_json::Value>,
    pub processing_steps: Vec<ProcessingStep>,
}

impl From<&Record> for RecordSnapshot {
    fn from(record: &Record) -> Self {
        Self {
            timestamp: record.timestamp,
            processed_at: record.processed_at,
            message: record.message.clone(),
            level: record.level,
            source_type: record.source_type,
            source_id: record.source_id.clone(),
            cursor: record.cursor.clone(),
            labels: record.labels_snapshot(),
            fields: record.fields_snapshot(),
            processing_steps: record.steps_snapshot(),
        }
    }
}

/// One failed batch, as persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub batch_id: uuid::Uuid,
    pub original_sink: String,
    pub records: Vec<RecordSnapshot>,
    pub error_kind: String,
    pub error_message: String,
    pub attempt_count: u32,
    pub context: HashMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn from_batch(
        envelope: &BatchEnvelope,
        error_kind: impl Into<String>,
        error_message: impl Into<String>,
        context: HashMap<String, String>,
    ) -> Self {
        Self {
            batch_id: envelope.batch_id,
            original_sink: envelope.sink_name.clone(),
            records: envelope.records.iter().map(RecordSnapshot::from).collect(),
            error_kind: error_kind.into(),
            error_message: error_message.into(),
            attempt_count: envelope.attempts.max(1),
            context,
            enqueued_at: Utc::now(),
        }
    }
}
