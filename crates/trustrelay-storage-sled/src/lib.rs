//! Sled-backed event store.
//!
//! Events are immutable and written once. Storage keys:
//! - `events` tree: `{event_id}` -> serialized `Event`
//! - `log` tree: `{created_at:020}/{event_id}` -> `event_id`
//!
//! The log key is zero-padded decimal so range scans come back in event
//! time order.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use sled::IVec;

use trustrelay_core::{Event, Filter};
use trustrelay_engine::{EventStore, StoreError};

const LOG_TS_WIDTH: usize = 20;

#[derive(Debug, Clone)]
pub struct SledConfig {
    pub path: PathBuf,
    pub flush_on_write: bool,
}

impl SledConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_on_write: true,
        }
    }
}

/// Sled-backed implementation of [`EventStore`].
pub struct SledEventStore {
    db: sled::Db,
    events: sled::Tree,
    log: sled::Tree,
    flush_on_write: bool,
}

impl SledEventStore {
    pub fn open(config: SledConfig) -> Result<Self, StoreError> {
        let db = sled::open(&config.path).map_err(backend)?;
        let events = db.open_tree("events").map_err(backend)?;
        let log = db.open_tree("log").map_err(backend)?;
        Ok(Self {
            db,
            events,
            log,
            flush_on_write: config.flush_on_write,
        })
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn log_key(created_at: i64, id: &str) -> Vec<u8> {
        format!("{:0width$}/{id}", created_at.max(0), width = LOG_TS_WIDTH).into_bytes()
    }

    fn decode(value: &IVec) -> Result<Event, StoreError> {
        bincode::serde::decode_from_slice(value, bincode::config::standard())
            .map(|(event, _)| event)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn load(&self, id: &[u8]) -> Result<Option<Event>, StoreError> {
        self.events
            .get(id)
            .map_err(backend)?
            .map(|value| Self::decode(&value))
            .transpose()
    }

    fn scan(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let mut results = Vec::new();
        let limit = filter.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(results);
        }

        if !filter.ids.is_empty() {
            for id in &filter.ids {
                if let Some(event) = self.load(id.as_str().as_bytes())? {
                    if filter.matches(&event) {
                        results.push(event);
                        if results.len() >= limit {
                            break;
                        }
                    }
                }
            }
            return Ok(results);
        }

        let start = format!("{:0width$}", filter.since.unwrap_or(0).max(0), width = LOG_TS_WIDTH);
        let end = format!(
            "{:0width$}",
            filter
                .until
                .map(|u| u.saturating_add(1))
                .unwrap_or(i64::MAX)
                .max(0),
            width = LOG_TS_WIDTH
        );

        for entry in self.log.range(start.as_bytes()..end.as_bytes()) {
            let (_, id) = entry.map_err(backend)?;
            let Some(event) = self.load(&id)? else {
                continue;
            };
            if filter.matches(&event) {
                results.push(event);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl EventStore for SledEventStore {
    async fn save(&self, event: &Event) -> Result<(), StoreError> {
        let id = event.id.as_str().as_bytes();
        // Duplicate submissions of an immutable record are no-ops.
        if self.events.contains_key(id).map_err(backend)? {
            return Ok(());
        }

        let value = bincode::serde::encode_to_vec(event, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.events.insert(id, value).map_err(backend)?;
        self.log
            .insert(Self::log_key(event.created_at, event.id.as_str()), id)
            .map_err(backend)?;

        if self.flush_on_write {
            self.db.flush_async().await.map_err(backend)?;
        }
        Ok(())
    }

    /// Streams matches in event time order (oldest first).
    async fn query(
        &self,
        filter: &Filter,
    ) -> Result<BoxStream<'static, Result<Event, StoreError>>, StoreError> {
        let results = self.scan(filter)?;
        Ok(Box::pin(stream::iter(results.into_iter().map(Ok))))
    }
}

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;
    use trustrelay_core::Keys;

    fn open(tmp: &TempDir) -> SledEventStore {
        SledEventStore::open(SledConfig::new(tmp.path())).expect("open sled store")
    }

    fn note_at(keys: &Keys, kind: u16, created_at: i64, content: &str) -> Event {
        Event::builder(kind, content)
            .created_at(created_at)
            .sign(keys)
            .unwrap()
    }

    async fn collect(store: &SledEventStore, filter: &Filter) -> Vec<Event> {
        let stream = store.query(filter).await.unwrap();
        stream
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn save_and_query_by_author_and_kind() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let alice = Keys::generate();
        let bob = Keys::generate();

        store.save(&note_at(&alice, 1, 100, "a1")).await.unwrap();
        store.save(&note_at(&alice, 7, 200, "a2")).await.unwrap();
        store.save(&note_at(&bob, 1, 300, "b1")).await.unwrap();

        let notes = collect(&store, &Filter::new().kind(1)).await;
        assert_eq!(notes.len(), 2);

        let from_alice = collect(&store, &Filter::new().author(alice.public_key())).await;
        assert_eq!(from_alice.len(), 2);

        let both = collect(
            &store,
            &Filter::new().author(bob.public_key()).kind(1),
        )
        .await;
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].content, "b1");
    }

    #[tokio::test]
    async fn duplicate_saves_are_no_ops() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let keys = Keys::generate();
        let event = note_at(&keys, 1, 100, "once");

        store.save(&event).await.unwrap();
        store.save(&event).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn time_window_and_order() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let keys = Keys::generate();

        // Insert out of order; scans come back in time order.
        store.save(&note_at(&keys, 1, 300, "late")).await.unwrap();
        store.save(&note_at(&keys, 1, 100, "early")).await.unwrap();
        store.save(&note_at(&keys, 1, 200, "middle")).await.unwrap();

        let all = collect(&store, &Filter::new()).await;
        let contents: Vec<_> = all.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["early", "middle", "late"]);

        let window = collect(&store, &Filter::new().since(150).until(250)).await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "middle");

        let limited = collect(&store, &Filter::new().limit(2)).await;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].content, "early");
    }

    #[tokio::test]
    async fn query_by_id() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let keys = Keys::generate();
        let event = note_at(&keys, 1, 100, "target");
        store.save(&event).await.unwrap();
        store.save(&note_at(&keys, 1, 101, "other")).await.unwrap();

        let found = collect(&store, &Filter::new().id(event.id.clone())).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, event.id);
    }

    #[tokio::test]
    async fn events_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let keys = Keys::generate();
        {
            let store = open(&tmp);
            store.save(&note_at(&keys, 1, 100, "durable")).await.unwrap();
        }
        let store = open(&tmp);
        let all = collect(&store, &Filter::new()).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "durable");
        all[0].verify().unwrap();
    }
}
