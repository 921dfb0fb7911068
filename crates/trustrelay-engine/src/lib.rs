//! Reputation-gated admission pipeline.
//!
//! Each incoming event is scored through the rank cache, gated by tier
//! rules, charged against its identity's token bucket, and finally handed
//! to the event store. Score lookups are best-effort with hard deadlines;
//! every failure degrades to "unknown identity" rather than blocking the
//! hot path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use time::OffsetDateTime;
use tracing::debug;

use trustrelay_core::{Event, Filter, IdentityKey};
use trustrelay_limiter::Limiter;
use trustrelay_rank::RankCache;

pub mod url;

/// Kind for plain text notes, the only kind open to low-trust identities.
pub const TEXT_NOTE_KIND: u16 = 1;

/// Events dated further than this into the future are rejected.
pub const TIMESTAMP_SANITY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Events older than this qualify for the high-tier backfill exemption.
pub const BACKFILL_AGE_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Ceiling on a synchronous score lookup from the admission path.
pub const FETCH_DEADLINE: Duration = Duration::from_secs(2);

const SECONDS_PER_DAY: f64 = 86_400.0;
const RANK_QUEUE_KEY_PREFIX: &str = "rank-queue:";
const PUBKEY_KEY_PREFIX: &str = "pub:";

/// Client-facing rejection reasons, each with a stable machine code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("kind-not-allowed: only text notes are accepted at this trust level")]
    KindNotAllowed,
    #[error("invalid-timestamp: event timestamp is too far in the future")]
    InvalidTimestamp,
    #[error("url-not-allowed: only text notes without links at this trust level")]
    UrlNotAllowed,
    #[error("rate-limited: please try again later")]
    RateLimited,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::KindNotAllowed => "kind-not-allowed",
            Self::InvalidTimestamp => "invalid-timestamp",
            Self::UrlNotAllowed => "url-not-allowed",
            Self::RateLimited => "rate-limited",
        }
    }
}

/// Failure from the event store, surfaced to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend failed: {0}")]
    Backend(String),
    #[error("stored event is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence the pipeline hands admitted events to. The backend is not
/// prescribed here.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn save(&self, event: &Event) -> Result<(), StoreError>;
    async fn query(
        &self,
        filter: &Filter,
    ) -> Result<BoxStream<'static, Result<Event, StoreError>>, StoreError>;
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("mid threshold must be between 0 and 1, got {0}")]
    MidThresholdOutOfRange(f64),
    #[error("high threshold must be between 0 and 1, got {0}")]
    HighThresholdOutOfRange(f64),
    #[error("high threshold {high} must be greater than mid threshold {mid}")]
    ThresholdsOutOfOrder { mid: f64, high: f64 },
}

/// Thresholds and policy switches for the admission pipeline.
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Trust score above which all kinds are allowed.
    pub mid_threshold: f64,
    /// Trust score granting the top tier and the backfill exemption. When
    /// unset there is no distinct high tier.
    pub high_threshold: Option<f64>,
    /// Whether to reject URLs in notes from identities below the mid
    /// threshold.
    pub url_policy_enabled: bool,
    /// Daily budget of synchronous score refreshes per IP group.
    pub rank_queue_ip_daily_limit: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            mid_threshold: 0.5,
            high_threshold: None,
            url_policy_enabled: false,
            rank_queue_ip_daily_limit: 250.0,
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.mid_threshold) {
            return Err(ConfigError::MidThresholdOutOfRange(self.mid_threshold));
        }
        if let Some(high) = self.high_threshold {
            if !(0.0..=1.0).contains(&high) {
                return Err(ConfigError::HighThresholdOutOfRange(high));
            }
            if high <= self.mid_threshold {
                return Err(ConfigError::ThresholdsOutOfOrder {
                    mid: self.mid_threshold,
                    high,
                });
            }
        }
        Ok(())
    }
}

/// Allowed events per day for a trust score.
///
/// Piecewise linear and monotone: 1 at score 0, 100 at the mid threshold,
/// 5000 at the high threshold, 10000 beyond it (or beyond mid when no high
/// tier is configured).
pub fn daily_rate(score: f64, config: &AdmissionConfig) -> f64 {
    let mid = config.mid_threshold;
    if score <= 0.0 {
        return 1.0;
    }
    if score < mid {
        return 1.0 + (score / mid) * 99.0;
    }
    match config.high_threshold {
        Some(high) if score < high => 100.0 + ((score - mid) / (high - mid)) * 4900.0,
        _ => 10_000.0,
    }
}

/// The per-event decision procedure.
pub struct AdmissionEngine<S> {
    config: AdmissionConfig,
    rank: Arc<RankCache>,
    limiter: Arc<Limiter>,
    store: Arc<S>,
    fetch_deadline: Duration,
}

impl<S: EventStore> AdmissionEngine<S> {
    pub fn new(
        config: AdmissionConfig,
        rank: Arc<RankCache>,
        limiter: Arc<Limiter>,
        store: Arc<S>,
    ) -> Self {
        Self {
            config,
            rank,
            limiter,
            store,
            fetch_deadline: FETCH_DEADLINE,
        }
    }

    /// Overrides the synchronous lookup deadline, mainly for tests.
    pub fn with_fetch_deadline(mut self, deadline: Duration) -> Self {
        self.fetch_deadline = deadline;
        self
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Decides one event: resolve the sender's score, apply the tier rules,
    /// charge the sender's bucket, persist.
    pub async fn admit(&self, event: &Event, ip_group: &str) -> Result<(), AdmissionError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let score = self.lookup_score(&event.pubkey, ip_group).await;

        if score < self.config.mid_threshold && event.kind != TEXT_NOTE_KIND {
            return Err(self.reject(Rejection::KindNotAllowed));
        }

        if self.config.url_policy_enabled
            && score < self.config.mid_threshold
            && event.kind == TEXT_NOTE_KIND
            && url::contains_url(&event.content)
        {
            return Err(self.reject(Rejection::UrlNotAllowed));
        }

        if event.created_at - now > TIMESTAMP_SANITY_WINDOW.as_secs() as i64 {
            return Err(self.reject(Rejection::InvalidTimestamp));
        }

        // Old events from the highest tier are persisted without touching
        // the sender's bucket, so history imports keep the live budget.
        if let Some(high) = self.config.high_threshold {
            if score >= high && now - event.created_at > BACKFILL_AGE_THRESHOLD.as_secs() as i64 {
                return self.persist(event).await;
            }
        }

        let daily = daily_rate(score, &self.config);
        let refill_rate = daily / SECONDS_PER_DAY;
        // An event costs one token; a capacity under one would lock the
        // identity out forever.
        let capacity = (daily / 24.0).max(1.0);
        let bucket_key = format!("{PUBKEY_KEY_PREFIX}{}", event.pubkey);
        if !self.limiter.allow(&bucket_key, capacity, refill_rate) {
            return Err(self.reject(Rejection::RateLimited));
        }

        self.persist(event).await
    }

    fn reject(&self, rejection: Rejection) -> AdmissionError {
        trustrelay_metrics::record_event_rejected(rejection.code());
        rejection.into()
    }

    async fn persist(&self, event: &Event) -> Result<(), AdmissionError> {
        self.store.save(event).await?;
        trustrelay_metrics::record_event_admitted(event.kind);
        Ok(())
    }

    /// Resolves the trust score for a pubkey, best effort.
    ///
    /// On a cache miss the synchronous refresh is gated per IP group so one
    /// group cannot amplify oracle load, and bounded by the fetch deadline.
    /// Every failure path falls back to score 0.
    async fn lookup_score(&self, pubkey: &IdentityKey, ip_group: &str) -> f64 {
        let (score, found) = self.rank.peek(pubkey);
        if found {
            return score;
        }

        let limit = self.config.rank_queue_ip_daily_limit;
        let throttle_key = format!("{RANK_QUEUE_KEY_PREFIX}{ip_group}");
        if !self.limiter.allow(&throttle_key, limit, limit / SECONDS_PER_DAY) {
            debug!(ip_group, "score refresh throttled for ip group");
            return 0.0;
        }

        match tokio::time::timeout(self.fetch_deadline, self.rank.fetch(pubkey)).await {
            Ok(Ok(score)) => score,
            Ok(Err(e)) => {
                debug!(error = %e, pubkey = %pubkey, "score refresh failed, treating as unknown");
                self.rank.enqueue(pubkey);
                0.0
            }
            Err(_) => {
                debug!(pubkey = %pubkey, "score refresh timed out, treating as unknown");
                self.rank.enqueue(pubkey);
                0.0
            }
        }
    }
}
