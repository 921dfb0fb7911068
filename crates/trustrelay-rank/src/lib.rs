//! Trust-score cache with asynchronous batch refresh.
//!
//! The cache answers non-blocking lookups on the admission path and keeps
//! itself warm through a background refresher. Misses and stale hits are
//! queued best-effort; a bounded queue means overload degrades to "treat as
//! unknown" instead of blocking admissions. Blocking lookups collapse per
//! key, so a burst of events from one unknown identity costs a single oracle
//! round-trip.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use trustrelay_bus::{BusError, PubScore, ScoreSource};
use trustrelay_core::{IdentityKey, TrustScore};

/// Cache entry: a score and the oracle's response time for it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeRank {
    pub score: TrustScore,
    /// Unix seconds from the oracle response, not the local write time.
    pub fetched_at: i64,
}

#[derive(Clone, Debug)]
pub struct RankCacheConfig {
    /// Age beyond which a cached entry is still served but queued for
    /// refresh. Also the refresher's periodic flush interval.
    pub stale_threshold: Duration,
    /// Age beyond which an entry is evicted outright.
    pub max_refresh_interval: Duration,
    /// Capacity of the best-effort refresh queue.
    pub queue_capacity: usize,
    /// Largest batch sent to the oracle in one request.
    pub max_batch: usize,
}

impl Default for RankCacheConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(24 * 60 * 60),
            max_refresh_interval: Duration::from_secs(7 * 24 * 60 * 60),
            queue_capacity: 100,
            max_batch: 1000,
        }
    }
}

/// Failure surfaced by a blocking lookup. Cloneable so every caller merged
/// into one in-flight refresh observes the same error.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RankError {
    #[error("trust score refresh failed: {0}")]
    Refresh(String),
}

type FlightResult = Result<f64, RankError>;

/// In-memory score cache backed by an oracle.
pub struct RankCache {
    entries: RwLock<HashMap<String, TimeRank>>,
    refresh_tx: mpsc::Sender<IdentityKey>,
    refresh_rx: Mutex<Option<mpsc::Receiver<IdentityKey>>>,
    flights: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    last_clean: Mutex<OffsetDateTime>,
    oracle: Arc<dyn ScoreSource>,
    config: RankCacheConfig,
}

impl RankCache {
    pub fn new(oracle: Arc<dyn ScoreSource>, config: RankCacheConfig) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            entries: RwLock::new(HashMap::new()),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            flights: Mutex::new(HashMap::new()),
            last_clean: Mutex::new(OffsetDateTime::now_utc()),
            oracle,
            config,
        }
    }

    /// Non-blocking lookup for the admission hot path.
    ///
    /// A miss queues the key for asynchronous refresh and reports
    /// `(0.0, false)`. A hit older than the stale threshold is still
    /// returned, with a refresh queued behind it.
    pub fn peek(&self, pubkey: &IdentityKey) -> (f64, bool) {
        let cached = self.entries.read().get(pubkey.as_str()).copied();
        match cached {
            None => {
                trustrelay_metrics::record_rank_cache_miss();
                self.enqueue(pubkey);
                (0.0, false)
            }
            Some(entry) => {
                if self.age(entry.fetched_at) > self.config.stale_threshold {
                    self.enqueue(pubkey);
                }
                trustrelay_metrics::record_rank_cache_hit();
                (entry.score.get(), true)
            }
        }
    }

    /// Queues a key for asynchronous refresh. Best-effort: when the queue is
    /// full the key is dropped and will be re-queued by the next miss.
    pub fn enqueue(&self, pubkey: &IdentityKey) {
        if self.refresh_tx.try_send(pubkey.clone()).is_err() {
            trustrelay_metrics::record_refresh_enqueue_dropped();
            debug!(pubkey = %pubkey, "refresh queue full, dropping enqueue");
        }
    }

    /// Blocking lookup. Returns the cached value when fresh, otherwise
    /// drives a refresh for this key alone. Concurrent calls for one key
    /// collapse into a single oracle round-trip; every caller observes the
    /// same outcome.
    ///
    /// On refresh failure the zero sentinel is cached with the current time
    /// to hold off a retry storm, and the error is surfaced.
    pub async fn fetch(&self, pubkey: &IdentityKey) -> Result<f64, RankError> {
        if let Some(entry) = self.entries.read().get(pubkey.as_str()) {
            if self.age(entry.fetched_at) <= self.config.stale_threshold {
                return Ok(entry.score.get());
            }
        }

        let follower_rx = {
            let mut flights = self.flights.lock();
            match flights.get(pubkey.as_str()) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    flights.insert(pubkey.0.clone(), sender);
                    None
                }
            }
        };

        if let Some(mut rx) = follower_rx {
            return match rx.recv().await {
                Ok(result) => result,
                // The leader was cancelled before broadcasting; fall back to
                // whatever its partial progress left in the cache.
                Err(_) => Ok(self.cached_score(pubkey).unwrap_or(0.0)),
            };
        }

        let mut flight = FlightGuard {
            cache: self,
            key: pubkey.as_str(),
            armed: true,
        };
        let result = self.refresh_single(pubkey).await;
        // Past the await there is nothing left to cancel; the explicit
        // removal below takes over from the guard.
        flight.armed = false;
        if let Some(sender) = self.flights.lock().remove(pubkey.as_str()) {
            let _ = sender.send(result.clone());
        }
        result
    }

    /// Writes entries, clamping scores into [0, 1].
    pub fn update(&self, fetched_at: i64, scores: &[PubScore]) {
        let mut entries = self.entries.write();
        for score in scores {
            entries.insert(
                score.pubkey.0.clone(),
                TimeRank {
                    score: TrustScore::clamped(score.score),
                    fetched_at,
                },
            );
        }
        trustrelay_metrics::record_rank_cache_size(entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Spawns the background refresher. It drains the refresh queue into a
    /// deduplicated batch, flushing when the batch is full or on a periodic
    /// tick, and exits when the shutdown channel fires.
    ///
    /// # Panics
    ///
    /// Panics when called twice; the queue receiver is single-consumer.
    pub fn spawn_refresher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut queue = cache
            .refresh_rx
            .lock()
            .take()
            .expect("refresher already spawned");

        tokio::spawn(async move {
            let mut batch: Vec<IdentityKey> = Vec::with_capacity(cache.config.max_batch);
            let mut seen: HashSet<String> = HashSet::with_capacity(cache.config.max_batch);
            let mut ticker = tokio::time::interval(cache.config.stale_threshold);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = queue.recv() => {
                        let Some(pubkey) = received else { break };
                        // Skip keys already waiting in this batch.
                        if !seen.insert(pubkey.0.clone()) {
                            continue;
                        }
                        batch.push(pubkey);
                        if batch.len() >= cache.config.max_batch {
                            cache.flush(&mut batch, &mut seen).await;
                        }
                    }
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            cache.flush(&mut batch, &mut seen).await;
                        }
                    }
                }
            }
        })
    }

    fn cached_score(&self, pubkey: &IdentityKey) -> Option<f64> {
        self.entries
            .read()
            .get(pubkey.as_str())
            .map(|entry| entry.score.get())
    }

    async fn refresh_single(&self, pubkey: &IdentityKey) -> Result<f64, RankError> {
        match self.refresh_batch(std::slice::from_ref(pubkey)).await {
            Ok(()) => match self.cached_score(pubkey) {
                Some(score) => Ok(score),
                None => {
                    // The oracle omitted the key; cache zero so later peeks
                    // settle instead of re-queueing.
                    self.update(
                        now_unix(),
                        &[PubScore {
                            pubkey: pubkey.clone(),
                            score: 0.0,
                        }],
                    );
                    Ok(0.0)
                }
            },
            Err(e) => {
                self.update(
                    now_unix(),
                    &[PubScore {
                        pubkey: pubkey.clone(),
                        score: 0.0,
                    }],
                );
                Err(RankError::Refresh(e.to_string()))
            }
        }
    }

    async fn refresh_batch(&self, batch: &[IdentityKey]) -> Result<(), BusError> {
        if batch.is_empty() {
            return Ok(());
        }
        let result = self.oracle.trust_scores(batch).await?;
        trustrelay_metrics::record_refresh_batch(batch.len());
        self.update_and_clean(result.responded_at, &result.scores);
        Ok(())
    }

    async fn flush(&self, batch: &mut Vec<IdentityKey>, seen: &mut HashSet<String>) {
        if let Err(e) = self.refresh_batch(batch).await {
            warn!(error = %e, keys = batch.len(), "failed to refresh trust scores");
        }
        batch.clear();
        seen.clear();
    }

    /// Writes entries and, when enough time has passed since the previous
    /// pass, evicts everything older than the max refresh interval. Holds
    /// the write lock once for both.
    fn update_and_clean(&self, fetched_at: i64, scores: &[PubScore]) {
        let mut entries = self.entries.write();
        for score in scores {
            entries.insert(
                score.pubkey.0.clone(),
                TimeRank {
                    score: TrustScore::clamped(score.score),
                    fetched_at,
                },
            );
        }

        let now = OffsetDateTime::now_utc();
        let clean_interval = (self.config.max_refresh_interval.as_secs() / 2) as i64;
        let clean_due = {
            let last = self.last_clean.lock();
            (now - *last).whole_seconds() >= clean_interval
        };
        if clean_due {
            let cutoff = now.unix_timestamp() - self.config.max_refresh_interval.as_secs() as i64;
            let before = entries.len();
            entries.retain(|_, entry| entry.fetched_at >= cutoff);
            let removed = before - entries.len();
            if removed > 0 {
                debug!(removed, "evicted expired trust scores");
            }
            *self.last_clean.lock() = now;
        }
        trustrelay_metrics::record_rank_cache_size(entries.len());
    }

    fn age(&self, fetched_at: i64) -> Duration {
        let delta = now_unix().saturating_sub(fetched_at);
        Duration::from_secs(delta.max(0) as u64)
    }
}

/// Removes the single-flight registration when the owning call is dropped
/// before broadcasting, so waiters never hang on a cancelled leader.
struct FlightGuard<'a> {
    cache: &'a RankCache,
    key: &'a str,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.flights.lock().remove(self.key);
        }
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
