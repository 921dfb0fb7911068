//! In-memory doubles for the bus and the oracle, used across the workspace's
//! tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use time::OffsetDateTime;

use trustrelay_core::{Event, Filter, IdentityKey, Keys};

use crate::{BusConnector, BusError, PubScore, ScoreBatch, ScoreSource, ORACLE_RPC_KIND};

/// Scripted bus that plays the oracle's side of the wire protocol.
///
/// Requests are answered with a properly signed kind-25910 response event
/// correlated by `e` tag, so the client code under test exercises the same
/// parsing and filtering as against a live relay.
pub struct MockBus {
    oracle_keys: Keys,
    scores: Mutex<HashMap<String, f64>>,
    error_message: Mutex<Option<String>>,
    silent: AtomicBool,
    requests: Mutex<Vec<Event>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            oracle_keys: Keys::generate(),
            scores: Mutex::new(HashMap::new()),
            error_message: Mutex::new(None),
            silent: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Identity the scripted oracle signs responses with.
    pub fn oracle_pubkey(&self) -> IdentityKey {
        self.oracle_keys.public_key()
    }

    pub fn set_score(&self, pubkey: IdentityKey, score: f64) {
        self.scores.lock().insert(pubkey.0, score);
    }

    /// Makes every subsequent request fail with a JSON-RPC error envelope.
    pub fn respond_with_error(&self, message: impl Into<String>) {
        *self.error_message.lock() = Some(message.into());
    }

    /// Makes the oracle stop answering; requests time out.
    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::Relaxed);
    }

    pub fn last_request(&self) -> Option<Event> {
        self.requests.lock().last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn response_content(&self, request: &Event) -> String {
        if let Some(message) = self.error_message.lock().clone() {
            return json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32000, "message": message }
            })
            .to_string();
        }

        let targets: Vec<String> = serde_json::from_str::<serde_json::Value>(&request.content)
            .ok()
            .and_then(|v| {
                serde_json::from_value(v["params"]["arguments"]["targetPubkeys"].clone()).ok()
            })
            .unwrap_or_default();

        let scores = self.scores.lock();
        let trust_scores: Vec<serde_json::Value> = targets
            .iter()
            .filter_map(|pk| {
                scores
                    .get(pk)
                    .map(|score| json!({ "targetPubkey": pk, "score": score }))
            })
            .collect();

        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "structuredContent": { "trustScores": trust_scores },
                "isError": false
            }
        })
        .to_string()
    }
}

#[async_trait]
impl BusConnector for MockBus {
    async fn request(&self, event: Event, filter: Filter) -> Result<Event, BusError> {
        self.requests.lock().push(event.clone());
        if self.silent.load(Ordering::Relaxed) {
            return Err(BusError::Timeout);
        }

        let response = Event::builder(ORACLE_RPC_KIND, self.response_content(&event))
            .reference_event(&event.id)
            .sign(&self.oracle_keys)?;
        debug_assert!(filter.matches(&response));
        Ok(response)
    }
}

/// Scripted [`ScoreSource`] for tests above the wire layer.
#[derive(Default)]
pub struct MockOracle {
    scores: Mutex<HashMap<String, f64>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<IdentityKey>>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_score(&self, pubkey: IdentityKey, score: f64) {
        self.scores.lock().insert(pubkey.0, score);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Adds latency to each lookup, for exercising concurrent callers.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Number of batches requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> Vec<Vec<IdentityKey>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl ScoreSource for MockOracle {
    async fn trust_scores(&self, targets: &[IdentityKey]) -> Result<ScoreBatch, BusError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.batches.lock().push(targets.to_vec());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(BusError::Timeout);
        }

        let scores = self.scores.lock();
        Ok(ScoreBatch {
            responded_at: OffsetDateTime::now_utc().unix_timestamp(),
            scores: targets
                .iter()
                .filter_map(|pk| {
                    scores.get(pk.as_str()).map(|score| PubScore {
                        pubkey: pk.clone(),
                        score: *score,
                    })
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_bus_response_is_signed_and_correlated() {
        let bus = MockBus::new();
        let target = IdentityKey::new(hex::encode([7u8; 32]));
        bus.set_score(target.clone(), 0.4);

        let keys = Keys::generate();
        let content = crate::encode_request(&[target]).unwrap();
        let request = Event::builder(ORACLE_RPC_KIND, content)
            .address_to(&bus.oracle_pubkey())
            .sign(&keys)
            .unwrap();
        let filter = Filter::new()
            .kind(ORACLE_RPC_KIND)
            .author(bus.oracle_pubkey())
            .reference_event(request.id.clone());

        let response = bus.request(request.clone(), filter).await.unwrap();
        response.verify().unwrap();
        assert!(response.references_event(&request.id));
        assert_eq!(bus.request_count(), 1);
    }

    #[tokio::test]
    async fn mock_oracle_records_batches() {
        let oracle = MockOracle::new();
        let key = IdentityKey::new("aa".repeat(32));
        oracle.set_score(key.clone(), 0.9);

        let batch = oracle.trust_scores(&[key.clone()]).await.unwrap();
        assert_eq!(batch.scores[0].score, 0.9);
        assert_eq!(oracle.calls(), 1);
        assert_eq!(oracle.batches(), vec![vec![key]]);

        oracle.set_failing(true);
        assert!(oracle.trust_scores(&[]).await.is_err());
    }
}
