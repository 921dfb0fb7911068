//! End-to-end admission scenarios against a scripted oracle and an
//! in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use time::OffsetDateTime;

use trustrelay_bus::{MockOracle, PubScore};
use trustrelay_core::{Event, Filter, Keys};
use trustrelay_engine::{
    AdmissionConfig, AdmissionEngine, AdmissionError, EventStore, Rejection, StoreError,
    TIMESTAMP_SANITY_WINDOW,
};
use trustrelay_limiter::Limiter;
use trustrelay_rank::{RankCache, RankCacheConfig};

#[derive(Default)]
struct MemStore {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
}

impl MemStore {
    fn len(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl EventStore for MemStore {
    async fn save(&self, event: &Event) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn query(
        &self,
        filter: &Filter,
    ) -> Result<BoxStream<'static, Result<Event, StoreError>>, StoreError> {
        let matched: Vec<Result<Event, StoreError>> = self
            .events
            .lock()
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(matched)))
    }
}

struct Harness {
    oracle: Arc<MockOracle>,
    rank: Arc<RankCache>,
    limiter: Arc<Limiter>,
    store: Arc<MemStore>,
    engine: Arc<AdmissionEngine<MemStore>>,
}

fn harness(config: AdmissionConfig) -> Harness {
    let oracle = Arc::new(MockOracle::new());
    let rank = Arc::new(RankCache::new(oracle.clone(), RankCacheConfig::default()));
    let limiter = Arc::new(Limiter::new());
    let store = Arc::new(MemStore::default());
    let engine = Arc::new(
        AdmissionEngine::new(config, rank.clone(), limiter.clone(), store.clone())
            .with_fetch_deadline(Duration::from_millis(500)),
    );
    Harness {
        oracle,
        rank,
        limiter,
        store,
        engine,
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn note(keys: &Keys, kind: u16, content: &str) -> Event {
    Event::builder(kind, content).sign(keys).unwrap()
}

fn note_at(keys: &Keys, kind: u16, created_at: i64) -> Event {
    Event::builder(kind, "note")
        .created_at(created_at)
        .sign(keys)
        .unwrap()
}

fn bucket_key(keys: &Keys) -> String {
    format!("pub:{}", keys.public_key())
}

#[tokio::test]
async fn cold_newcomer_is_scored_then_rate_limited() {
    let h = harness(AdmissionConfig::default());
    let keys = Keys::generate();
    h.oracle.set_score(keys.public_key(), 0.3);

    // First event resolves the score synchronously.
    h.engine
        .admit(&note(&keys, 1, "one"), "198.51.100.0/24")
        .await
        .unwrap();
    // Second in the same second fits the one-hour burst capacity (~2.5).
    h.engine
        .admit(&note(&keys, 1, "two"), "198.51.100.0/24")
        .await
        .unwrap();
    // Third exhausts it.
    let third = h.engine.admit(&note(&keys, 1, "three"), "198.51.100.0/24").await;
    assert!(matches!(
        third,
        Err(AdmissionError::Rejected(Rejection::RateLimited))
    ));

    assert_eq!(h.store.len(), 2);
    // Later admissions reused the cached score.
    assert_eq!(h.oracle.calls(), 1);
    assert_eq!(h.rank.peek(&keys.public_key()), (0.3, true));
}

#[tokio::test]
async fn kind_gate_rejects_before_any_bucket_interaction() {
    let h = harness(AdmissionConfig::default());
    let keys = Keys::generate();
    h.rank.update(
        now_unix(),
        &[PubScore {
            pubkey: keys.public_key(),
            score: 0.2,
        }],
    );

    let result = h.engine.admit(&note(&keys, 3, "contacts"), "ip").await;
    assert!(matches!(
        result,
        Err(AdmissionError::Rejected(Rejection::KindNotAllowed))
    ));
    assert_eq!(h.store.len(), 0);
    assert_eq!(h.limiter.tokens(&bucket_key(&keys)), 0.0);
}

#[tokio::test]
async fn high_tier_backfill_skips_the_bucket() {
    let h = harness(AdmissionConfig {
        high_threshold: Some(0.9),
        ..Default::default()
    });
    let keys = Keys::generate();
    h.rank.update(
        now_unix(),
        &[PubScore {
            pubkey: keys.public_key(),
            score: 0.95,
        }],
    );

    let old = note_at(&keys, 1, now_unix() - 48 * 3600);
    h.engine.admit(&old, "ip").await.unwrap();

    assert_eq!(h.store.len(), 1);
    // No bucket was created, let alone charged.
    assert_eq!(h.limiter.tokens(&bucket_key(&keys)), 0.0);

    // A current event from the same identity does consume tokens.
    h.engine.admit(&note(&keys, 1, "fresh"), "ip").await.unwrap();
    assert!(h.limiter.tokens(&bucket_key(&keys)) > 0.0);
}

#[tokio::test]
async fn oracle_outage_degrades_to_the_lowest_tier() {
    let h = harness(AdmissionConfig::default());
    h.oracle.set_failing(true);
    let keys = Keys::generate();

    // The lookup fails, the event is admitted under the score-0 allowance
    // of one event per day (burst capacity floored at 1).
    h.engine.admit(&note(&keys, 1, "one"), "ip").await.unwrap();
    assert_eq!(h.rank.peek(&keys.public_key()), (0.0, true));

    let second = h.engine.admit(&note(&keys, 1, "two"), "ip").await;
    assert!(matches!(
        second,
        Err(AdmissionError::Rejected(Rejection::RateLimited))
    ));

    // Non-note kinds stay gated while the oracle is down.
    let other = Keys::generate();
    let gated = h.engine.admit(&note(&other, 3, "contacts"), "ip").await;
    assert!(matches!(
        gated,
        Err(AdmissionError::Rejected(Rejection::KindNotAllowed))
    ));
}

#[tokio::test]
async fn ip_group_budget_caps_synchronous_lookups() {
    let h = harness(AdmissionConfig {
        rank_queue_ip_daily_limit: 3.0,
        ..Default::default()
    });

    for i in 0..5 {
        let keys = Keys::generate();
        h.engine
            .admit(&note(&keys, 1, &format!("note {i}")), "203.0.113.0/24")
            .await
            .unwrap();
    }
    // Only the first three lookups reached the oracle; the rest proceeded
    // with score 0 under their own pubkey buckets.
    assert_eq!(h.oracle.calls(), 3);
    assert_eq!(h.store.len(), 5);

    // Another group has its own budget.
    let keys = Keys::generate();
    h.engine
        .admit(&note(&keys, 1, "elsewhere"), "192.0.2.0/24")
        .await
        .unwrap();
    assert_eq!(h.oracle.calls(), 4);
}

#[tokio::test]
async fn concurrent_admissions_for_one_identity_share_a_lookup() {
    let h = harness(AdmissionConfig::default());
    let keys = Keys::generate();
    h.oracle.set_score(keys.public_key(), 0.9);
    h.oracle.set_delay(Duration::from_millis(100));

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = h.engine.clone();
        let event = note(&keys, 1, &format!("note {i}"));
        handles.push(tokio::spawn(async move {
            engine.admit(&event, "ip").await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.oracle.calls(), 1);
    assert_eq!(h.store.len(), 10);
}

#[tokio::test]
async fn future_timestamps_beyond_the_window_are_rejected() {
    let h = harness(AdmissionConfig::default());
    let keys = Keys::generate();
    h.rank.update(
        now_unix(),
        &[PubScore {
            pubkey: keys.public_key(),
            score: 0.6,
        }],
    );
    let window = TIMESTAMP_SANITY_WINDOW.as_secs() as i64;

    let just_inside = note_at(&keys, 1, now_unix() + window - 5);
    h.engine.admit(&just_inside, "ip").await.unwrap();

    let too_far = note_at(&keys, 1, now_unix() + window + 5);
    let result = h.engine.admit(&too_far, "ip").await;
    assert!(matches!(
        result,
        Err(AdmissionError::Rejected(Rejection::InvalidTimestamp))
    ));

    // Past-dated events are never rejected on timestamp grounds.
    let old = note_at(&keys, 1, now_unix() - 10 * 24 * 3600);
    h.engine.admit(&old, "ip").await.unwrap();
}

#[tokio::test]
async fn capacity_floor_grants_low_trust_one_spendable_token() {
    let h = harness(AdmissionConfig::default());
    let keys = Keys::generate();
    h.rank.update(
        now_unix(),
        &[PubScore {
            pubkey: keys.public_key(),
            score: 0.01,
        }],
    );

    // daily is ~3 events, one hour of which is under a single token; the
    // floor still lets one through.
    h.engine.admit(&note(&keys, 1, "one"), "ip").await.unwrap();
    let second = h.engine.admit(&note(&keys, 1, "two"), "ip").await;
    assert!(matches!(
        second,
        Err(AdmissionError::Rejected(Rejection::RateLimited))
    ));
}

#[tokio::test]
async fn url_policy_applies_below_the_mid_threshold_only() {
    let h = harness(AdmissionConfig {
        url_policy_enabled: true,
        ..Default::default()
    });
    let low = Keys::generate();
    let high = Keys::generate();
    h.rank.update(
        now_unix(),
        &[
            PubScore {
                pubkey: low.public_key(),
                score: 0.2,
            },
            PubScore {
                pubkey: high.public_key(),
                score: 0.8,
            },
        ],
    );

    let result = h
        .engine
        .admit(&note(&low, 1, "read https://example.com"), "ip")
        .await;
    assert!(matches!(
        result,
        Err(AdmissionError::Rejected(Rejection::UrlNotAllowed))
    ));

    h.engine
        .admit(&note(&low, 1, "no links here"), "ip")
        .await
        .unwrap();
    h.engine
        .admit(&note(&high, 1, "read https://example.com"), "ip")
        .await
        .unwrap();
}

#[tokio::test]
async fn store_failure_surfaces_without_refunding_the_token() {
    let h = harness(AdmissionConfig::default());
    let keys = Keys::generate();
    h.rank.update(
        now_unix(),
        &[PubScore {
            pubkey: keys.public_key(),
            score: 0.3,
        }],
    );
    h.store.failing.store(true, Ordering::Relaxed);

    let result = h.engine.admit(&note(&keys, 1, "lost"), "ip").await;
    assert!(matches!(result, Err(AdmissionError::Store(_))));

    // The bucket was charged before the store failed.
    let remaining = h.limiter.tokens(&bucket_key(&keys));
    let capacity = trustrelay_engine::daily_rate(0.3, h.engine.config()) / 24.0;
    assert!((remaining - (capacity - 1.0)).abs() < 0.05);
}

#[tokio::test]
async fn queries_stream_stored_events() {
    use futures::StreamExt;

    let h = harness(AdmissionConfig::default());
    let keys = Keys::generate();
    h.oracle.set_score(keys.public_key(), 0.9);

    h.engine.admit(&note(&keys, 1, "hello"), "ip").await.unwrap();

    let filter = Filter::new().author(keys.public_key()).kind(1);
    let mut stream = h.store.query(&filter).await.unwrap();
    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.content, "hello");
    assert!(stream.next().await.is_none());
}
