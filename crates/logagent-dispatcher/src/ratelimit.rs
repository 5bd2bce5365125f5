//! Global token-bucket rate limiter for `Dispatcher::handle`'s step 6.
//!
//! One bucket, shared across every caller. The source-specific fairness
//! policies a multi-tenant setup would want are out of scope here — this
//! is the single rate-limit decision the spec calls for, not the two
//! duplicated checks the source carried.

use std::time::Instant;

use parking_lot::Mutex;

pub struct TokenBucketConfig {
    pub rate_per_sec: f64,
    pub burst: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self { rate_per_sec: 10_000.0, burst: 20_000.0 }
    }
}

struct State {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            rate_per_sec: config.rate_per_sec,
            burst: config.burst,
            state: Mutex::new(State { tokens: config.burst, last_refill: Instant::now() }),
        }
    }

    /// Attempts to take one token. `true` means allowed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn allows_up_to_burst_then_denies() {
        let bucket = TokenBucket::new(TokenBucketConfig { rate_per_sec: 0.0, burst: 3.0 });
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire(), "bucket should be empty after burst is exhausted");
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(TokenBucketConfig { rate_per_sec: 1000.0, burst: 1.0 });
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        sleep(Duration::from_millis(20));
        assert!(bucket.try_acquire(), "bucket should have refilled after waiting");
    }
}
