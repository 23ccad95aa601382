use std::{collections::HashMap, time::Duration};

use tokio::{sync::Mutex, time::Instant};

/// Length of one counting window; rates are reported per window.
const WINDOW: Duration = Duration::from_secs(60);

/// Accesses in the current and the previous minute.
///
/// The rate is the sliding-window estimate: the previous bucket weighted by
/// how much of it still overlaps the last minute, plus the current bucket.
#[derive(Debug, Clone, Copy)]
struct Counter {
    current: u64,
    previous: u64,
    window_start: Instant,
    last_access: Instant,
    last_decay: Instant,
}

impl Counter {
    fn new(now: Instant) -> Self {
        Self {
            current: 0,
            previous: 0,
            window_start: now,
            last_access: now,
            last_decay: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= WINDOW * 2 {
            self.previous = 0;
            self.current = 0;
            self.window_start = now;
        } else if elapsed >= WINDOW {
            self.previous = self.current;
            self.current = 0;
            self.window_start += WINDOW;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate(mut self, now: Instant) -> f64 {
        self.roll(now);
        let into_window = now.duration_since(self.window_start).as_secs_f64();
        let overlap = 1.0 - into_window / WINDOW.as_secs_f64();
        self.previous as f64 * overlap + self.current as f64
    }
}

/// Rolling per-minute access counters used to detect hot keys.
///
/// Counters live in their own map behind their own lock; a background sweep
/// halves a counter after each `decay_after` of inactivity and drops it after
/// `evict_after` of inactivity.
#[derive(Debug)]
pub struct HotKeyTracker {
    counters: Mutex<HashMap<String, Counter>>,
    decay_after: Duration,
    evict_after: Duration,
}

impl HotKeyTracker {
    #[must_use]
    pub fn new(decay_after: Duration, evict_after: Duration) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            decay_after,
            evict_after,
        }
    }

    pub async fn record(&self, key: &str) {
        let now = Instant::now();
        let mut guard = self.counters.lock().await;
        let counter = guard
            .entry(key.to_string())
            .or_insert_with(|| Counter::new(now));
        counter.roll(now);
        counter.current = counter.current.saturating_add(1);
        counter.last_access = now;
    }

    /// Accesses over the last minute.
    pub async fn rate_per_minute(&self, key: &str) -> f64 {
        let now = Instant::now();
        let guard = self.counters.lock().await;
        guard.get(key).map_or(0.0, |counter| counter.rate(now))
    }

    pub async fn tracked(&self) -> usize {
        self.counters.lock().await.len()
    }

    /// Apply decay and eviction. Returns the number of evicted counters.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.counters.lock().await;
        let before = guard.len();

        guard.retain(|_, counter| {
            if now.duration_since(counter.last_access) >= self.evict_after {
                return false;
            }
            counter.roll(now);
            let quiet_since = counter.last_access.max(counter.last_decay);
            if !self.decay_after.is_zero() && now.duration_since(quiet_since) >= self.decay_after {
                counter.current /= 2;
                counter.previous /= 2;
                counter.last_decay = now;
            }
            true
        });

        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn tracker() -> HotKeyTracker {
        HotKeyTracker::new(Duration::from_secs(600), Duration::from_secs(3_600))
    }

    fn close(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() < 1e-9
    }

    #[tokio::test(start_paused = true)]
    async fn rate_slides_over_the_last_minute() {
        let tracker = tracker();
        for _ in 0..150 {
            tracker.record("k").await;
        }
        assert!(close(tracker.rate_per_minute("k").await, 150.0));

        advance(Duration::from_secs(60)).await;
        assert!(close(tracker.rate_per_minute("k").await, 150.0));

        advance(Duration::from_secs(30)).await;
        assert!(close(tracker.rate_per_minute("k").await, 75.0));

        advance(Duration::from_secs(30)).await;
        assert!(close(tracker.rate_per_minute("k").await, 0.0));
        assert!(close(tracker.rate_per_minute("missing").await, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn long_lived_key_turns_hot_on_a_burst() {
        let tracker = tracker();
        for _ in 0..59 {
            tracker.record("k").await;
            advance(WINDOW).await;
        }
        assert!(tracker.rate_per_minute("k").await <= 1.0);

        for _ in 0..1_000 {
            tracker.record("k").await;
        }
        assert!(close(tracker.rate_per_minute("k").await, 1_001.0));
    }

    #[tokio::test(start_paused = true)]
    async fn counters_halve_after_quiet_period_then_evict() {
        let tracker = HotKeyTracker::new(Duration::from_secs(20), Duration::from_secs(3_600));
        for _ in 0..8 {
            tracker.record("k").await;
        }

        advance(Duration::from_secs(20)).await;
        tracker.sweep().await;
        assert!(close(tracker.rate_per_minute("k").await, 4.0));

        advance(Duration::from_secs(10)).await;
        tracker.sweep().await;
        // Only ten quiet seconds since the last halving.
        assert!(close(tracker.rate_per_minute("k").await, 4.0));

        advance(Duration::from_secs(10)).await;
        tracker.sweep().await;
        assert!(close(tracker.rate_per_minute("k").await, 2.0));

        advance(Duration::from_secs(3_560)).await;
        assert_eq!(tracker.sweep().await, 1);
        assert_eq!(tracker.tracked().await, 0);
    }
}
