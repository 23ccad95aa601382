use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Strategy {
    capacity: f64,
    refill_per_sec: f64,
}

impl Strategy {
    #[must_use]
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.1),
        }
    }
}

/// Outcome of one frame against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitOutcome {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateLimitOutcome {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Per-connection token bucket. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    strategy: Strategy,
}

impl TokenBucket {
    #[must_use]
    pub fn new(strategy: Strategy) -> Self {
        Self {
            tokens: strategy.capacity,
            last_refill: Instant::now(),
            strategy,
        }
    }

    pub fn take(&mut self) -> RateLimitOutcome {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitOutcome::Allowed {
                remaining: self.tokens.floor() as u32,
            }
        } else {
            let needed = 1.0 - self.tokens;
            RateLimitOutcome::Denied {
                retry_after: Duration::from_secs_f64(needed / self.strategy.refill_per_sec),
            }
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        self.tokens =
            (self.tokens + elapsed * self.strategy.refill_per_sec).min(self.strategy.capacity);
        self.last_refill = now;
    }
}
