//! The structured log record and its thread-safe accessors.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cursor::SourceCursor;

/// Normalized log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" | "information" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" | "critical" => Ok(Level::Fatal),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Info
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Container,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::File => f.write_str("file"),
            SourceType::Container => f.write_str("container"),
        }
    }
}

/// One entry in a record's processing history, appended by each pipeline
/// stage that touches it (transform, dedup, sink fan-out, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStep {
    pub name: String,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// A structured log record.
///
/// Immutable once enqueued, except through the accessor methods on
/// `labels`/`fields`/`processing_steps`, which are guarded by their own
/// lock so concurrent readers (dispatcher stats, sink fan-out) never block
/// on a writer holding a network call.
#[derive(Debug, Clone)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub message: String,
    pub level: Level,
    pub source_type: SourceType,
    pub source_id: String,
    /// The producer's resume position as of this record, if it supplied
    /// one. Threaded through to `PositionStore::commit` once every sink
    /// has acknowledged the batch this record landed in — the one piece
    /// of cursor data a real file-tailer/container-stream producer needs
    /// to pass alongside the line itself.
    pub cursor: Option<SourceCursor>,
    labels: Arc<RwLock<HashMap<String, String>>>,
    fields: Arc<RwLock<HashMap<String, JsonValue>>>,
    processing_steps: Arc<RwLock<Vec<ProcessingStep>>>,
}

impl Record {
    /// Construct a record. `processed_at` is set by the caller (the
    /// dispatcher sets it to `now` at ingress).
    pub fn new(
        source_type: SourceType,
        source_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        processed_at: DateTime<Utc>,
        labels: HashMap<String, String>,
    ) -> Self {
        Self {
            timestamp,
            processed_at,
            message: message.into(),
            level: Level::Info,
            source_type,
            source_id: source_id.into(),
            cursor: None,
            labels: Arc::new(RwLock::new(labels)),
            fields: Arc::new(RwLock::new(HashMap::new())),
            processing_steps: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_cursor(mut self, cursor: SourceCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn get_label(&self, key: &str) -> Option<String> {
        self.labels.read().get(key).cloned()
    }

    pub fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.write().insert(key.into(), value.into());
    }

    pub fn labels_snapshot(&self) -> HashMap<String, String> {
        self.labels.read().clone()
    }

    pub fn get_field(&self, key: &str) -> Option<JsonValue> {
        self.fields.read().get(key).cloned()
    }

    pub fn set_field(&self, key: impl Into<String>, value: JsonValue) {
        self.fields.write().insert(key.into(), value);
    }

    pub fn fields_snapshot(&self) -> HashMap<String, JsonValue> {
        self.fields.read().clone()
    }

    pub fn push_step(&self, step: ProcessingStep) {
        self.processing_steps.write().push(step);
    }

    pub fn steps_snapshot(&self) -> Vec<ProcessingStep> {
        self.processing_steps.read().clone()
    }

    /// Content fingerprint input for the dedup layer: source id + message,
    /// optionally bucketed by timestamp (see `logagent-dedup`).
    pub fn content_key_parts(&self) -> (String, String) {
        (self.source_id.clone(), self.message.clone())
    }

    /// Produce a fully independent record, safe to mutate concurrently with
    /// `self`. Used on sink fan-out instead of sharing the lock.
    pub fn deep_copy(&self) -> Record {
        Record {
            timestamp: self.timestamp,
            processed_at: self.processed_at,
            message: self.message.clone(),
            level: self.level,
            source_type: self.source_type,
            source_id: self.source_id.clone(),
            cursor: self.cursor.clone(),
            labels: Arc::new(RwLock::new(self.labels.read().clone())),
            fields: Arc::new(RwLock::new(self.fields.read().clone())),
            processing_steps: Arc::new(RwLock::new(self.processing_steps.read().clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "x".to_string());
        Record::new(
            SourceType::File,
            "/var/log/x",
            "hello",
            Utc::now(),
            Utc::now(),
            labels,
        )
    }

    #[test]
    fn deep_copy_is_independent() {
        let original = sample();
        let copy = original.deep_copy();

        copy.set_label("app", "y");
        copy.set_field("count", JsonValue::from(1));

        assert_eq!(original.get_label("app").as_deref(), Some("x"));
        assert_eq!(copy.get_label("app").as_deref(), Some("y"));
        assert!(original.get_field("count").is_none());
    }

    #[test]
    fn level_roundtrips_through_str() {
        for lvl in [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warn,
            Level::Error,
            Level::Fatal,
        ] {
            let parsed: Level = lvl.as_str().parse().unwrap();
            assert_eq!(parsed, lvl);
        }
    }

    #[test]
    fn level_from_str_is_case_insensitive() {
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("Warning".parse::<Level>().unwrap(), Level::Warn);
    }
}
