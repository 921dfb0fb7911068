//! Per-connection WebSocket session handling.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use tracing::{debug, error};

use trustrelay_core::wire::{ClientFrame, RelayFrame};
use trustrelay_core::Event;
use trustrelay_engine::{AdmissionError, EventStore};

use crate::AppState;

/// Maps a client address to its coarse throttling group: the /24 network
/// for IPv4, the /48 prefix for IPv6.
pub fn ip_group(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0/24")
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}::/48",
                segments[0], segments[1], segments[2]
            )
        }
    }
}

/// Drives one client connection until it closes.
pub async fn run_session(mut socket: WebSocket, state: AppState, ip_group: String) {
    debug!(ip_group, "session opened");
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered by the websocket layer.
            Ok(_) => continue,
        };

        let responses = match ClientFrame::decode(&text) {
            Ok(frame) => respond_to_frame(frame, &state, &ip_group).await,
            Err(e) => vec![RelayFrame::Notice(format!("could not parse frame: {e}"))],
        };

        for response in responses {
            let encoded = match response.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(error = %e, "failed to encode relay frame");
                    continue;
                }
            };
            if socket.send(Message::Text(encoded)).await.is_err() {
                debug!(ip_group, "session closed mid-send");
                return;
            }
        }
    }
    debug!(ip_group, "session closed");
}

/// Computes the relay's responses to one client frame.
pub async fn respond_to_frame(
    frame: ClientFrame,
    state: &AppState,
    ip_group: &str,
) -> Vec<RelayFrame> {
    match frame {
        ClientFrame::Event(event) => vec![handle_event(event, state, ip_group).await],
        ClientFrame::Req {
            subscription,
            filters,
        } => handle_req(subscription, filters, state).await,
        // No live subscriptions are held open, so there is nothing to
        // tear down.
        ClientFrame::Close(_) => Vec::new(),
    }
}

async fn handle_event(event: Event, state: &AppState, ip_group: &str) -> RelayFrame {
    if let Err(e) = event.verify() {
        return RelayFrame::Ok {
            event_id: event.id,
            accepted: false,
            message: format!("invalid: {e}"),
        };
    }

    match state.engine.admit(&event, ip_group).await {
        Ok(()) => RelayFrame::Ok {
            event_id: event.id,
            accepted: true,
            message: String::new(),
        },
        Err(AdmissionError::Rejected(rejection)) => RelayFrame::Ok {
            event_id: event.id,
            accepted: false,
            message: rejection.to_string(),
        },
        Err(AdmissionError::Store(e)) => {
            error!(error = %e, event = %event.id, "failed to persist event");
            RelayFrame::Ok {
                event_id: event.id,
                accepted: false,
                message: "error: could not persist event".into(),
            }
        }
    }
}

async fn handle_req(
    subscription: String,
    filters: Vec<trustrelay_core::Filter>,
    state: &AppState,
) -> Vec<RelayFrame> {
    let mut responses = Vec::new();
    for filter in &filters {
        let mut stream = match state.store.query(filter).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "query failed");
                responses.push(RelayFrame::Notice(format!("query failed: {e}")));
                continue;
            }
        };
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => responses.push(RelayFrame::Event {
                    subscription: subscription.clone(),
                    event,
                }),
                Err(e) => {
                    error!(error = %e, "query stream failed");
                    break;
                }
            }
        }
    }
    responses.push(RelayFrame::Eose(subscription));
    responses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_groups_by_slash_24() {
        let addr: SocketAddr = "203.0.113.57:4455".parse().unwrap();
        assert_eq!(ip_group(&addr), "203.0.113.0/24");
    }

    #[test]
    fn ipv6_groups_by_slash_48() {
        let addr: SocketAddr = "[2001:db8:abcd:12::1]:443".parse().unwrap();
        assert_eq!(ip_group(&addr), "2001:db8:abcd::/48");
    }
}
