//! Oracle client for trustrelay.
//!
//! The ranking oracle is a remote service addressed by public key on the
//! event bus. A request and its response are both kind-25910 events; the
//! request carries a JSON-RPC payload and the response links back through an
//! `e` tag with the request's event id. This crate owns the bus connection,
//! the envelope codec, and the trait seams the rank resolver builds on.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use trustrelay_core::{Event, EventError, Filter, IdentityKey, Keys};

mod mock;
mod relay;
mod rpc;

pub use mock::{MockBus, MockOracle};
pub use relay::{RelayBus, ROUND_TRIP_TIMEOUT};
pub use rpc::{encode_request, parse_response, PubScore, TRUST_SCORES_TOOL};

/// Event kind shared by oracle requests and responses.
pub const ORACLE_RPC_KIND: u16 = 25910;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to oracle relay: {0}")]
    Connect(String),
    #[error("failed to publish to oracle relay: {0}")]
    Publish(String),
    #[error("oracle transport failed: {0}")]
    Transport(String),
    #[error("no oracle response within the deadline")]
    Timeout,
    #[error("failed to parse oracle payload: {0}")]
    Parse(String),
    #[error("oracle reported an error: {0}")]
    Rpc(String),
    #[error("failed to sign oracle request: {0}")]
    Sign(String),
}

impl From<EventError> for BusError {
    fn from(e: EventError) -> Self {
        BusError::Sign(e.to_string())
    }
}

/// Publish-and-await-response exchange over the bus. Real traffic goes
/// through [`RelayBus`]; tests plug in [`MockBus`].
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Publishes the request event, then resolves to the first event
    /// matching the filter.
    async fn request(&self, event: Event, filter: Filter) -> Result<Event, BusError>;
}

/// Batch of scores together with the oracle's response timestamp.
#[derive(Clone, Debug)]
pub struct ScoreBatch {
    /// Creation time of the response event (unix seconds), used by the
    /// cache for staleness, not the local receive time.
    pub responded_at: i64,
    pub scores: Vec<PubScore>,
}

/// Source of trust scores for batches of identity keys.
#[async_trait]
pub trait ScoreSource: Send + Sync {
    async fn trust_scores(&self, targets: &[IdentityKey]) -> Result<ScoreBatch, BusError>;
}

/// Client for the remote ranking oracle.
pub struct OracleClient {
    bus: Arc<dyn BusConnector>,
    oracle_pubkey: IdentityKey,
    keys: Keys,
}

impl OracleClient {
    pub fn new(bus: Arc<dyn BusConnector>, oracle_pubkey: IdentityKey, keys: Keys) -> Self {
        Self {
            bus,
            oracle_pubkey,
            keys,
        }
    }
}

#[async_trait]
impl ScoreSource for OracleClient {
    async fn trust_scores(&self, targets: &[IdentityKey]) -> Result<ScoreBatch, BusError> {
        if targets.is_empty() {
            return Ok(ScoreBatch {
                responded_at: OffsetDateTime::now_utc().unix_timestamp(),
                scores: Vec::new(),
            });
        }

        let content = rpc::encode_request(targets)?;
        let request = Event::builder(ORACLE_RPC_KIND, content)
            .address_to(&self.oracle_pubkey)
            .sign(&self.keys)?;
        let filter = Filter::new()
            .kind(ORACLE_RPC_KIND)
            .author(self.oracle_pubkey.clone())
            .reference_event(request.id.clone());

        debug!(targets = targets.len(), request = %request.id, "requesting trust scores");
        let started = Instant::now();
        let result = self.bus.request(request, filter).await;
        trustrelay_metrics::record_oracle_round_trip(result.is_ok(), started.elapsed());

        let response = result?;
        let scores = rpc::parse_response(&response.content)?;
        Ok(ScoreBatch {
            responded_at: response.created_at,
            scores,
        })
    }
}
