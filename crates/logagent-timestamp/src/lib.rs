//! Guards a sink against timestamps it will permanently reject, and learns
//! the sink's true acceptance window from rejection feedback so later
//! records don't round-trip through a doomed send attempt.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use logagent_core::RejectKind;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Safety buffer subtracted from `max_acceptable_age` when a rejection
/// message can't be parsed for an explicit age.
const DEFAULT_SHRINK_BUFFER: StdDuration = StdDuration::from_secs(3600);

pub struct TimestampGuardConfig {
    pub initial_max_acceptable_age: StdDuration,
    pub max_future_skew: StdDuration,
    pub min_learning_window: StdDuration,
    pub shrink_buffer: StdDuration,
    pub clamp_enabled: bool,
}

impl Default for TimestampGuardConfig {
    fn default() -> Self {
        Self {
            initial_max_acceptable_age: StdDuration::from_secs(86_400),
            max_future_skew: StdDuration::from_secs(60),
            min_learning_window: StdDuration::from_secs(300),
            shrink_buffer: DEFAULT_SHRINK_BUFFER,
            clamp_enabled: false,
        }
    }
}

struct State {
    max_acceptable_age: StdDuration,
    last_learn_at: Option<DateTime<Utc>>,
}

/// `Validate`/`Learn`/`Clamp` as described for the sink-side timestamp
/// guard. `max_acceptable_age` only ever shrinks for the lifetime of the
/// guard; nothing in this type widens it again.
pub struct TimestampGuard {
    max_future_skew: StdDuration,
    min_learning_window: StdDuration,
    shrink_buffer: StdDuration,
    clamp_enabled: bool,
    state: Mutex<State>,
}

impl TimestampGuard {
    pub fn new(config: TimestampGuardConfig) -> Self {
        Self {
            max_future_skew: config.max_future_skew,
            min_learning_window: config.min_learning_window,
            shrink_buffer: config.shrink_buffer,
            clamp_enabled: config.clamp_enabled,
            state: Mutex::new(State {
                max_acceptable_age: config.initial_max_acceptable_age,
                last_learn_at: None,
            }),
        }
    }

    pub fn max_acceptable_age(&self) -> StdDuration {
        self.state.lock().max_acceptable_age
    }

    pub fn validate(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), RejectKind> {
        if timestamp.timestamp_nanos_opt() == Some(0) || timestamp == DateTime::<Utc>::UNIX_EPOCH {
            counter!("logagent.timestamp_guard.rejected", 1, "kind" => "zero");
            return Err(RejectKind::Zero);
        }

        let max_age = self.state.lock().max_acceptable_age;

        if timestamp < now {
            let age = (now - timestamp).to_std().unwrap_or(StdDuration::ZERO);
            if age > max_age {
                counter!("logagent.timestamp_guard.rejected", 1, "kind" => "too_old");
                return Err(RejectKind::TooOld);
            }
        } else {
            let skew = (timestamp - now).to_std().unwrap_or(StdDuration::ZERO);
            if skew > self.max_future_skew {
                counter!("logagent.timestamp_guard.rejected", 1, "kind" => "too_new");
                return Err(RejectKind::TooNew);
            }
        }

        Ok(())
    }

    /// Clamps `timestamp` forward to the edge of the acceptable window if
    /// it's too old. Only meaningful when `clamp_enabled` is set; callers
    /// should check `Validate` first and only call this for `TooOld`.
    pub fn clamp(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.clamp_enabled {
            return None;
        }
        let max_age = self.state.lock().max_acceptable_age;
        let floor = now - chrono::Duration::from_std(max_age).ok()? + chrono::Duration::milliseconds(1);
        if timestamp < floor {
            Some(floor)
        } else {
            None
        }
    }

    /// Updates the learned `max_acceptable_age` from a sink's rejection
    /// message, or shrinks it by the safety buffer if no explicit age can
    /// be parsed out. Rate-limited by `min_learning_window` to avoid
    /// oscillation when a burst of rejections arrives together.
    pub fn learn(&self, message: &str, now: DateTime<Utc>) {
        let mut state = self.state.lock();

        if let Some(last) = state.last_learn_at {
            let since = (now - last).to_std().unwrap_or(StdDuration::ZERO);
            if since < self.min_learning_window {
                debug!(since_secs = since.as_secs(), "timestamp guard learning rate-limited");
                return;
            }
        }

        let new_age = match extract_age_hint(message) {
            Some(parsed) if parsed < state.max_acceptable_age => {
                info!(parsed_secs = parsed.as_secs(), "timestamp guard learned age from rejection message");
                parsed
            }
            _ => {
                let shrunk = state.max_acceptable_age.saturating_sub(self.shrink_buffer);
                info!(
                    previous_secs = state.max_acceptable_age.as_secs(),
                    new_secs = shrunk.as_secs(),
                    "timestamp guard shrinking max_acceptable_age by safety buffer"
                );
                shrunk
            }
        };

        state.max_acceptable_age = new_age;
        state.last_learn_at = Some(now);
    }
}

/// Scans a rejection message for a duration token like `30m`, `24h`, or
/// `7d` and returns it as a `Duration`. Sinks don't agree on an error
/// format, so this is a best-effort heuristic, not a parser for any one
/// wire format; `learn` falls back to the safety buffer when it finds
/// nothing.
fn extract_age_hint(message: &str) -> Option<StdDuration> {
    let bytes = message.as_bytes();
    let mut i = 0;
    let mut best: Option<StdDuration> = None;

    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let Ok(number) = message[start..i].parse::<u64>() else {
                continue;
            };
            if i < bytes.len() {
                let unit = bytes[i] as char;
                let secs = match unit {
                    's' => Some(number),
                    'm' => Some(number * 60),
                    'h' => Some(number * 3600),
                    'd' => Some(number * 86_400),
                    _ => None,
                };
                if let Some(secs) = secs {
                    best = Some(StdDuration::from_secs(secs));
                    i += 1;
                }
            }
        } else {
            i += 1;
        }
    }

    best
}
