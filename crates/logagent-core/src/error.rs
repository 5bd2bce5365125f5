//! Shared error/result taxonomies used across the dispatcher, batcher,
//! sinks, and timestamp guard.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why `Dispatcher::handle` declined a record. Never a panic path: every
/// variant is a normal, countable outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Shutdown,
    FeedbackLoop,
    Duplicate,
    RateLimited,
    QueueFull,
    Invalid,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Shutdown => "shutdown",
            DropReason::FeedbackLoop => "feedback_loop",
            DropReason::Duplicate => "duplicate",
            DropReason::RateLimited => "rate_limited",
            DropReason::QueueFull => "queue_full",
            DropReason::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Classification of a `Sink::send` outcome. Drives the batcher's
/// retry/DLQ decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkErrorKind {
    /// Network/5xx/transport failure: retry with backoff.
    Temporary,
    /// Bad record or permanently rejected by the sink: no retry, straight
    /// to DLQ.
    Permanent,
    /// 429-style throttling: retry, honoring `retry_after` as a floor.
    RateLimit,
    /// Sink-side 5xx, handled like `Temporary` but kept distinct for
    /// metrics/diagnostics.
    Server,
    /// The circuit breaker refused the attempt; no send was made.
    CircuitOpen,
    /// The sink rejected the batch because its timestamps are too old for
    /// it to accept (e.g. Loki's "entry too far behind").
    TimestampTooOld,
}

impl SinkErrorKind {
    /// Whether the batcher should ever retry a batch that failed this way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkErrorKind::Temporary | SinkErrorKind::Server | SinkErrorKind::RateLimit)
    }

    /// Whether a failure of this kind should trip the circuit breaker.
    /// Permanent/record-level failures indicate a bad record, not a bad
    /// sink, and must not count against it.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, SinkErrorKind::Temporary | SinkErrorKind::Server | SinkErrorKind::RateLimit)
    }
}

impl fmt::Display for SinkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SinkErrorKind::Temporary => "temporary",
            SinkErrorKind::Permanent => "permanent",
            SinkErrorKind::RateLimit => "rate_limit",
            SinkErrorKind::Server => "server",
            SinkErrorKind::CircuitOpen => "circuit_open",
            SinkErrorKind::TimestampTooOld => "timestamp_too_old",
        };
        f.write_str(s)
    }
}

/// Error returned by `Sink::send`.
#[derive(Debug, Clone, Error)]
#[error("sink error ({kind}): {message}")]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl SinkError {
    pub fn new(kind: SinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Why `TimestampGuard::validate` rejected a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    TooOld,
    TooNew,
    Zero,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectKind::TooOld => "too_old",
            RejectKind::TooNew => "too_new",
            RejectKind::Zero => "zero",
        };
        f.write_str(s)
    }
}
