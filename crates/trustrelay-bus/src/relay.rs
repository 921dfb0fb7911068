//! Cached WebSocket connection to the oracle's relay.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use trustrelay_core::wire::{ClientFrame, RelayFrame};
use trustrelay_core::{Event, Filter};

use crate::{BusConnector, BusError};

/// Hard ceiling on a publish-and-await-response exchange.
pub const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Single long-lived relay connection, re-established on failure.
///
/// The connection is cached under a mutex. Each round-trip takes the socket
/// out of the cache and only puts it back after a clean exchange, so any
/// publish or read failure (including a deadline hit, which would leave a
/// subscription dangling) makes the next call reconnect.
pub struct RelayBus {
    url: String,
    round_trip_timeout: Duration,
    conn: Mutex<Option<Socket>>,
}

impl RelayBus {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            round_trip_timeout: ROUND_TRIP_TIMEOUT,
            conn: Mutex::new(None),
        }
    }

    /// Overrides the round-trip deadline, mainly for tests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout = timeout;
        self
    }

    /// Drops the cached connection so the next request reconnects.
    pub async fn disconnect(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(mut socket) = guard.take() {
            let _ = socket.close(None).await;
            debug!(url = %self.url, "dropped oracle relay connection");
        }
    }

    async fn acquire(&self, cached: Option<Socket>) -> Result<Socket, BusError> {
        if let Some(socket) = cached {
            return Ok(socket);
        }
        let (socket, _) = connect_async(&self.url)
            .await
            .map_err(|e| BusError::Connect(format!("{}: {e}", self.url)))?;
        info!(url = %self.url, "connected to oracle relay");
        Ok(socket)
    }

    /// Publishes the request, subscribes for its response, and resolves to
    /// the first matching event. Returns the socket for reuse only after a
    /// clean exchange.
    async fn round_trip(
        &self,
        cached: Option<Socket>,
        event: Event,
        filter: Filter,
    ) -> Result<(Event, Option<Socket>), BusError> {
        let mut socket = self.acquire(cached).await?;

        let publish = ClientFrame::Event(event)
            .encode()
            .map_err(|e| BusError::Parse(e.to_string()))?;
        socket
            .send(Message::Text(publish))
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        let subscription = new_subscription_id();
        let req = ClientFrame::Req {
            subscription: subscription.clone(),
            filters: vec![filter.clone()],
        }
        .encode()
        .map_err(|e| BusError::Parse(e.to_string()))?;
        socket
            .send(Message::Text(req))
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        loop {
            let message = match socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(BusError::Transport(e.to_string())),
                None => return Err(BusError::Transport("connection closed".into())),
            };

            match message {
                Message::Text(text) => match RelayFrame::decode(&text) {
                    Ok(RelayFrame::Event {
                        subscription: sub,
                        event,
                    }) if sub == subscription && filter.matches(&event) => {
                        // Stop the subscription before handing the socket
                        // back, so late duplicate responses never reach us.
                        let close = ClientFrame::Close(subscription)
                            .encode()
                            .map_err(|e| BusError::Parse(e.to_string()))?;
                        let reusable = match socket.send(Message::Text(close)).await {
                            Ok(()) => Some(socket),
                            Err(_) => None,
                        };
                        return Ok((event, reusable));
                    }
                    Ok(RelayFrame::Ok {
                        accepted: false,
                        message,
                        ..
                    }) => return Err(BusError::Publish(message)),
                    Ok(RelayFrame::Closed { message, .. }) => {
                        return Err(BusError::Transport(format!(
                            "subscription closed by relay: {message}"
                        )));
                    }
                    Ok(_) => {
                        // OK acks, EOSE before the oracle answers, notices,
                        // and events for other subscriptions.
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "ignoring undecodable relay frame");
                        continue;
                    }
                },
                Message::Ping(payload) => {
                    socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| BusError::Transport(e.to_string()))?;
                }
                Message::Close(_) => {
                    return Err(BusError::Transport("connection closed by relay".into()));
                }
                _ => continue,
            }
        }
    }
}

#[async_trait::async_trait]
impl BusConnector for RelayBus {
    async fn request(&self, event: Event, filter: Filter) -> Result<Event, BusError> {
        let mut guard = self.conn.lock().await;
        let cached = guard.take();
        match tokio::time::timeout(
            self.round_trip_timeout,
            self.round_trip(cached, event, filter),
        )
        .await
        {
            Ok(Ok((event, socket))) => {
                *guard = socket;
                Ok(event)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BusError::Timeout),
        }
    }
}

fn new_subscription_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
