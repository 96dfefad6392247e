// Exponential backoff with jitter for peer reconnects and subscribe retries

use std::time::{Duration, Instant};

use rand::Rng;

use crate::constants::BACKOFF_MAX_EXPONENT;

/// Delay grows as 2^n seconds (n capped at `max_exponent`) plus up to one
/// second of random jitter. A long pause between two calls restarts the
/// sequence from one second.
#[derive(Debug)]
pub struct ExponentialBackoff {
    exponent: u32,
    max_exponent: u32,
    reset_after: Duration,
    last_invocation: Instant,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BACKOFF_MAX_EXPONENT)
    }
}

impl ExponentialBackoff {
    pub fn new(max_exponent: u32) -> Self {
        ExponentialBackoff {
            exponent: 0,
            max_exponent,
            reset_after: Duration::from_secs(1u64 << max_exponent),
            last_invocation: Instant::now(),
        }
    }

    /// Next delay to sleep before retrying
    pub fn delay(&mut self) -> Duration {
        let now = Instant::now();
        if now.duration_since(self.last_invocation) > self.reset_after {
            self.exponent = 0;
        }
        self.last_invocation = now;

        let jitter_ms = rand::thread_rng().gen_range(0..=1000u64);
        let delay = Duration::from_secs(1u64 << self.exponent) + Duration::from_millis(jitter_ms);
        self.exponent = (self.exponent + 1).min(self.max_exponent);
        delay
    }

    pub fn reset(&mut self) {
        self.exponent = 0;
    }

    /// Longest delay this backoff can produce
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(1u64 << self.max_exponent) + Duration::from_secs(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = ExponentialBackoff::new(4);
        let expected_base = [1, 2, 4, 8, 16, 16, 16];
        for base in expected_base {
            let delay = backoff.delay();
            assert!(delay >= Duration::from_secs(base), "{:?} < {}s", delay, base);
            assert!(delay <= Duration::from_secs(base + 1), "{:?} > {}s", delay, base + 1);
        }
        assert!(backoff.delay() <= backoff.max_delay());
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(4);
        backoff.delay();
        backoff.delay();
        backoff.reset();
        assert!(backoff.delay() <= Duration::from_secs(2));
    }
}
