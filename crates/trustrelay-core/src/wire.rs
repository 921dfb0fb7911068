//! Wire frames exchanged between clients and the relay.
//!
//! Frames are JSON arrays with a leading type label, e.g.
//! `["EVENT", {..}]` or `["REQ", "sub-1", {..filter..}]`.

use serde_json::{json, Value};

use crate::{Event, EventId, Filter};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames sent by clients.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    Event(Event),
    Req {
        subscription: String,
        filters: Vec<Filter>,
    },
    Close(String),
}

impl ClientFrame {
    pub fn decode(raw: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(raw)?;
        let items = value
            .as_array()
            .ok_or_else(|| WireError::Malformed("frame must be an array".into()))?;
        let label = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| WireError::Malformed("missing frame label".into()))?;

        match label {
            "EVENT" => {
                let event = items
                    .get(1)
                    .cloned()
                    .ok_or_else(|| WireError::Malformed("EVENT frame missing payload".into()))?;
                Ok(Self::Event(serde_json::from_value(event)?))
            }
            "REQ" => {
                let subscription = items
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        WireError::Malformed("REQ frame missing subscription id".into())
                    })?
                    .to_string();
                let filters = items[2..]
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()?;
                if filters.is_empty() {
                    return Err(WireError::Malformed("REQ frame missing filters".into()));
                }
                Ok(Self::Req {
                    subscription,
                    filters,
                })
            }
            "CLOSE" => {
                let subscription = items
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        WireError::Malformed("CLOSE frame missing subscription id".into())
                    })?
                    .to_string();
                Ok(Self::Close(subscription))
            }
            other => Err(WireError::Malformed(format!("unknown frame label {other}"))),
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        let value = match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req {
                subscription,
                filters,
            } => {
                let mut items = vec![json!("REQ"), json!(subscription)];
                for filter in filters {
                    items.push(serde_json::to_value(filter)?);
                }
                Value::Array(items)
            }
            Self::Close(subscription) => json!(["CLOSE", subscription]),
        };
        Ok(value.to_string())
    }
}

/// Frames sent by the relay.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayFrame {
    Event {
        subscription: String,
        event: Event,
    },
    Ok {
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    Eose(String),
    Closed {
        subscription: String,
        message: String,
    },
    Notice(String),
}

impl RelayFrame {
    pub fn decode(raw: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(raw)?;
        let items = value
            .as_array()
            .ok_or_else(|| WireError::Malformed("frame must be an array".into()))?;
        let label = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| WireError::Malformed("missing frame label".into()))?;

        let text = |idx: usize, what: &str| -> Result<String, WireError> {
            items
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| WireError::Malformed(format!("{label} frame missing {what}")))
        };

        match label {
            "EVENT" => {
                let subscription = text(1, "subscription id")?;
                let event = items
                    .get(2)
                    .cloned()
                    .ok_or_else(|| WireError::Malformed("EVENT frame missing payload".into()))?;
                Ok(Self::Event {
                    subscription,
                    event: serde_json::from_value(event)?,
                })
            }
            "OK" => {
                let event_id = EventId::new(text(1, "event id")?);
                let accepted = items
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| WireError::Malformed("OK frame missing verdict".into()))?;
                let message = text(3, "message").unwrap_or_default();
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(Self::Eose(text(1, "subscription id")?)),
            "CLOSED" => Ok(Self::Closed {
                subscription: text(1, "subscription id")?,
                message: text(2, "message").unwrap_or_default(),
            }),
            "NOTICE" => Ok(Self::Notice(text(1, "message")?)),
            other => Err(WireError::Malformed(format!("unknown frame label {other}"))),
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        let value = match self {
            Self::Event {
                subscription,
                event,
            } => json!(["EVENT", subscription, event]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Eose(subscription) => json!(["EOSE", subscription]),
            Self::Closed {
                subscription,
                message,
            } => json!(["CLOSED", subscription, message]),
            Self::Notice(message) => json!(["NOTICE", message]),
        };
        Ok(value.to_string())
    }
}
