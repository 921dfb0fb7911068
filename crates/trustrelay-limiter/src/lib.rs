//! Keyed token buckets with continuous refill and idle eviction.
//!
//! Buckets are created lazily on first use and refill fractionally on every
//! consume, so a rate of one token per day still accumulates. Callers pass
//! capacity and refill rate on each call; the bucket adopts the latest values
//! while keeping its accumulated tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long an untouched bucket is kept before a cleanup pass removes it.
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(60 * 60);

/// How often the background cleaner scans for idle buckets.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Time source, injectable so refill math is deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_active: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_active).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_active = now;
        }
    }
}

/// Collection of token buckets addressed by string key.
///
/// The outer map takes a readers-writer lock for lookup and cleanup only;
/// refill and consume run under the individual bucket's mutex.
pub struct Limiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    clock: Arc<dyn Clock>,
    time_to_live: Duration,
    cleanup_interval: Duration,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Limiter {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_TIME_TO_LIVE, DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_settings(time_to_live: Duration, cleanup_interval: Duration) -> Self {
        Self::with_clock(time_to_live, cleanup_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(
        time_to_live: Duration,
        cleanup_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            clock,
            time_to_live,
            cleanup_interval,
        }
    }

    /// Consumes one token. Convenience wrapper over [`Limiter::consume`].
    pub fn allow(&self, key: &str, capacity: f64, refill_rate: f64) -> bool {
        self.consume(key, 1.0, capacity, refill_rate)
    }

    /// Attempts to consume `cost` tokens from the bucket for `key`.
    ///
    /// The bucket adopts the supplied `capacity` and `refill_rate` before
    /// refilling, preserving accumulated tokens up to the new capacity.
    /// Returns false without subtracting when the balance is insufficient;
    /// the refill side effect is kept either way.
    pub fn consume(&self, key: &str, cost: f64, capacity: f64, refill_rate: f64) -> bool {
        let bucket = self.bucket(key, capacity, refill_rate);
        let mut b = bucket.lock();
        b.capacity = capacity;
        b.refill_rate = refill_rate;
        b.tokens = b.tokens.min(capacity);
        b.refill(self.clock.now());
        if b.tokens < cost {
            return false;
        }
        b.tokens -= cost;
        true
    }

    /// Current token balance for a key, refilled to now. Diagnostic only;
    /// returns 0.0 for unknown keys without creating a bucket.
    pub fn tokens(&self, key: &str) -> f64 {
        let Some(bucket) = self.buckets.read().get(key).cloned() else {
            return 0.0;
        };
        let mut b = bucket.lock();
        b.refill(self.clock.now());
        b.tokens
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// Removes buckets idle longer than the time-to-live. Returns how many
    /// were dropped. A re-created bucket starts full, which is the same
    /// balance an untouched bucket would have refilled to.
    pub fn clean(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.buckets.write();
        let before = map.len();
        map.retain(|_, bucket| {
            now.duration_since(bucket.lock().last_active) <= self.time_to_live
        });
        let removed = before - map.len();
        trustrelay_metrics::record_bucket_evictions(removed);
        trustrelay_metrics::record_bucket_count(map.len());
        removed
    }

    /// Spawns the periodic cleanup task. The task exits when the shutdown
    /// channel fires or its sender is dropped.
    pub fn spawn_cleaner(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.clean();
                        if removed > 0 {
                            debug!(removed, "removed idle rate-limit buckets");
                        }
                    }
                }
            }
        })
    }

    fn bucket(&self, key: &str, capacity: f64, refill_rate: f64) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return bucket.clone();
        }

        let mut map = self.buckets.write();
        // Re-check after taking the write lock.
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: capacity,
                    capacity,
                    refill_rate,
                    last_active: self.clock.now(),
                }))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockClock {
        now: Mutex<Instant>,
    }

    impl MockClock {
        fn starting_now() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, dur: Duration) {
            *self.now.lock() += dur;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    fn limiter_with_clock(clock: Arc<MockClock>) -> Limiter {
        Limiter::with_clock(DEFAULT_TIME_TO_LIVE, DEFAULT_CLEANUP_INTERVAL, clock)
    }

    #[test]
    fn bucket_starts_full_and_drains() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock);

        assert!(limiter.allow("k", 2.0, 1.0));
        assert!(limiter.allow("k", 2.0, 1.0));
        assert!(!limiter.allow("k", 2.0, 1.0));
    }

    #[test]
    fn refill_is_continuous() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock.clone());

        assert!(limiter.consume("k", 2.0, 2.0, 1.0));
        assert!(!limiter.allow("k", 2.0, 1.0));

        // Half a second buys half a token, not enough for a whole one.
        clock.advance(Duration::from_millis(500));
        assert!(!limiter.allow("k", 2.0, 1.0));

        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("k", 2.0, 1.0));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock.clone());

        assert!(limiter.allow("k", 3.0, 10.0));
        clock.advance(Duration::from_secs(60));
        assert!((limiter.tokens("k") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn failed_consume_keeps_the_refill() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock.clone());

        assert!(limiter.consume("k", 1.0, 1.0, 0.5));
        clock.advance(Duration::from_secs(1));
        assert!(!limiter.allow("k", 1.0, 0.5));
        // The refill from the failed attempt is retained.
        assert!((limiter.tokens("k") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn parameters_update_in_place() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock.clone());

        assert!(limiter.allow("k", 10.0, 1.0));
        assert!((limiter.tokens("k") - 9.0).abs() < 1e-9);

        // Shrinking the capacity clamps the accumulated balance.
        assert!(limiter.allow("k", 2.0, 1.0));
        assert!((limiter.tokens("k") - 1.0).abs() < 1e-9);

        // A raised refill rate applies from the next elapsed interval.
        clock.advance(Duration::from_secs(2));
        assert!(limiter.consume("k", 2.0, 4.0, 1.0));
    }

    #[test]
    fn successful_consumes_are_bounded_by_capacity_plus_refill() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock.clone());

        let capacity = 5.0;
        let rate = 2.0;
        let mut granted = 0u32;
        for _ in 0..4 {
            for _ in 0..10 {
                if limiter.allow("k", capacity, rate) {
                    granted += 1;
                }
            }
            clock.advance(Duration::from_secs(1));
        }
        // capacity + rate * 3 elapsed seconds
        assert!(granted as f64 <= capacity + rate * 3.0);
    }

    #[test]
    fn distinct_keys_do_not_share_budgets() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock);

        assert!(limiter.allow("a", 1.0, 0.1));
        assert!(!limiter.allow("a", 1.0, 0.1));
        assert!(limiter.allow("b", 1.0, 0.1));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn unknown_key_reports_zero_tokens() {
        let clock = MockClock::starting_now();
        let limiter = limiter_with_clock(clock);
        assert_eq!(limiter.tokens("missing"), 0.0);
        assert!(limiter.is_empty());
    }

    #[test]
    fn clean_removes_idle_buckets_only() {
        let clock = MockClock::starting_now();
        let limiter = Limiter::with_clock(
            Duration::from_secs(60),
            DEFAULT_CLEANUP_INTERVAL,
            clock.clone(),
        );

        assert!(limiter.allow("stale", 1.0, 1.0));
        clock.advance(Duration::from_secs(120));
        assert!(limiter.allow("active", 1.0, 1.0));

        assert_eq!(limiter.clean(), 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.tokens("active") >= 0.0);
    }

    #[tokio::test]
    async fn cleaner_task_stops_on_shutdown() {
        let limiter = Arc::new(Limiter::with_settings(
            Duration::from_secs(1),
            Duration::from_millis(10),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = limiter.spawn_cleaner(rx);

        assert!(limiter.allow("k", 1.0, 1.0));
        tx.send(true).expect("send shutdown");
        handle.await.expect("cleaner joins");
    }
}
