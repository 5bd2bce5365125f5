//! Three-state circuit breaker guarding a single sink.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use logagent_core::{BreakerState, CircuitSnapshot};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{info, warn};

pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: StdDuration,
    pub max_open_timeout: StdDuration,
    pub max_probe_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: StdDuration::from_secs(30),
            max_open_timeout: StdDuration::from_secs(300),
            max_probe_requests: 1,
        }
    }
}

struct State {
    breaker_state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_probe_at: Option<DateTime<Utc>>,
    current_open_timeout: StdDuration,
    probes_in_flight: u32,
}

/// `Allow`/`RecordSuccess`/`RecordFailure` as described for the per-sink
/// breaker. A `half_open` probe budget of `max_probe_requests` in flight
/// caps how many concurrent workers retest a recovering sink at once.
pub struct CircuitBreaker {
    failure_threshold: u32,
    max_open_timeout: StdDuration,
    max_probe_requests: u32,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            max_open_timeout: config.max_open_timeout,
            max_probe_requests: config.max_probe_requests,
            state: Mutex::new(State {
                breaker_state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                next_probe_at: None,
                current_open_timeout: config.open_timeout,
                probes_in_flight: 0,
            }),
        }
    }

    /// Whether a caller may attempt a send right now. Transitions
    /// `open` -> `half_open` in place once the probe deadline has passed.
    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match state.breaker_state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let Some(next_probe_at) = state.next_probe_at else {
                    return true;
                };
                if now >= next_probe_at {
                    state.breaker_state = BreakerState::HalfOpen;
                    state.probes_in_flight = 0;
                    info!("circuit breaker transitioning to half_open");
                    counter!("logagent.circuit.transitions", 1, "to" => "half_open");
                    state.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if state.probes_in_flight < self.max_probe_requests {
                    state.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.breaker_state != BreakerState::Closed {
            info!("circuit breaker closing after successful probe");
            counter!("logagent.circuit.transitions", 1, "to" => "closed");
        }
        state.breaker_state = BreakerState::Closed;
        state.consecutive_failures = 0;
        state.next_probe_at = None;
        state.probes_in_flight = 0;
    }

    /// Records a failure that counts against the breaker. Callers must
    /// filter out permanent/record-level failures before calling this —
    /// see `SinkErrorKind::counts_against_breaker`.
    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.last_failure_at = Some(now);

        match state.breaker_state {
            BreakerState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    state.breaker_state = BreakerState::Open;
                    state.next_probe_at = Some(now + to_chrono(state.current_open_timeout));
                    warn!(
                        consecutive_failures = state.consecutive_failures,
                        "circuit breaker opening"
                    );
                    counter!("logagent.circuit.transitions", 1, "to" => "open");
                }
            }
            BreakerState::HalfOpen => {
                state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
                state.current_open_timeout =
                    (state.current_open_timeout * 2).min(self.max_open_timeout);
                state.breaker_state = BreakerState::Open;
                state.next_probe_at = Some(now + to_chrono(state.current_open_timeout));
                warn!(
                    open_timeout_secs = state.current_open_timeout.as_secs(),
                    "probe failed, reopening circuit breaker with doubled timeout"
                );
                counter!("logagent.circuit.transitions", 1, "to" => "open");
            }
            BreakerState::Open => {
                // A failure can arrive here if a probe was already in
                // flight when another worker's attempt also failed.
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state.lock().breaker_state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            state: state.breaker_state,
            consecutive_failures: state.consecutive_failures,
            last_failure_at: state.last_failure_at,
            next_probe_at: state.next_probe_at,
        }
    }
}

fn to_chrono(d: StdDuration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            open_timeout: StdDuration::from_secs(30),
            max_open_timeout: StdDuration::from_secs(300),
            max_probe_requests: 1,
        })
    }

    #[test]
    fn closed_allows_until_threshold() {
        let b = breaker(3);
        let now = Utc::now();
        assert!(b.allow(now));
        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn open_blocks_until_probe_deadline() {
        let b = breaker(1);
        let now = Utc::now();
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow(now + chrono::Duration::seconds(1)));
        assert!(b.allow(now + chrono::Duration::seconds(31)));
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_caps_probes_in_flight() {
        let b = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: StdDuration::from_secs(1),
            max_open_timeout: StdDuration::from_secs(60),
            max_probe_requests: 2,
        });
        let now = Utc::now();
        b.record_failure(now);
        let probe_time = now + chrono::Duration::seconds(2);
        assert!(b.allow(probe_time));
        assert!(b.allow(probe_time));
        assert!(!b.allow(probe_time), "third concurrent probe must be refused");
    }

    #[test]
    fn half_open_success_closes_and_resets() {
        let b = breaker(1);
        let now = Utc::now();
        b.record_failure(now);
        assert!(b.allow(now + chrono::Duration::seconds(31)));
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_doubles_timeout_capped() {
        let b = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: StdDuration::from_secs(100),
            max_open_timeout: StdDuration::from_secs(150),
            max_probe_requests: 1,
        });
        let now = Utc::now();
        b.record_failure(now);
        assert!(b.allow(now + chrono::Duration::seconds(101)));
        b.record_failure(now + chrono::Duration::seconds(101));
        let snap = b.snapshot();
        assert_eq!(snap.state, BreakerState::Open);
        let next_probe = snap.next_probe_at.unwrap();
        let timeout = next_probe - (now + chrono::Duration::seconds(101));
        assert_eq!(timeout.num_seconds(), 150, "timeout should double but cap at max_open_timeout");
    }
}
