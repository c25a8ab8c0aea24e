// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire frames and the packets derived from them.
//!
//! Frames are JSON arrays exchanged as single WebSocket text messages:
//! outgoing `["REQ", subId, …filters]`, `["CLOSE", subId]`,
//! `["EVENT", event]`, `["AUTH", event]`; incoming `["EVENT", subId,
//! event]`, `["EOSE", subId]`, `["OK", eventId, accepted, message?]`,
//! `["NOTICE", msg]`, `["AUTH", challenge]`, `["CLOSED", subId, msg]`.

use serde::Serialize;
use serde_json::{json, Value};

use crate::event::{Event, Filter};
use crate::relay::ConnectionState;

/// Client→relay frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    Event { event: Event },
    Auth { event: Event },
}

impl ClientMessage {
    /// Serialize to the JSON array text sent as one WebSocket message.
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Req { sub_id, filters } => {
                let mut arr = vec![json!("REQ"), json!(sub_id)];
                for filter in filters {
                    arr.push(json!(filter));
                }
                Value::Array(arr)
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]),
            Self::Event { event } => json!(["EVENT", event]),
            Self::Auth { event } => json!(["AUTH", event]),
        };
        value.to_string()
    }

    /// The subscription id carried by REQ/CLOSE frames.
    pub fn sub_id(&self) -> Option<&str> {
        match self {
            Self::Req { sub_id, .. } | Self::Close { sub_id } => Some(sub_id),
            _ => None,
        }
    }
}

/// Relay→client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Ok { event_id: String, accepted: bool, message: Option<String> },
    Notice { message: String },
    Auth { challenge: String },
    Closed { sub_id: String, message: String },
}

impl RelayMessage {
    /// Parse one incoming WebSocket text message.
    ///
    /// Returns `None` for malformed frames; callers suppress those per
    /// the transport contract.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let arr = value.as_array()?;
        let kind = arr.first()?.as_str()?;

        match kind {
            "EVENT" => {
                let sub_id = arr.get(1)?.as_str()?.to_owned();
                let event: Event = serde_json::from_value(arr.get(2)?.clone()).ok()?;
                Some(Self::Event { sub_id, event })
            }
            "EOSE" => Some(Self::Eose { sub_id: arr.get(1)?.as_str()?.to_owned() }),
            "OK" => {
                let event_id = arr.get(1)?.as_str()?.to_owned();
                let accepted = arr.get(2)?.as_bool()?;
                let message = arr.get(3).and_then(Value::as_str).map(str::to_owned);
                Some(Self::Ok { event_id, accepted, message })
            }
            "NOTICE" => Some(Self::Notice { message: arr.get(1)?.as_str()?.to_owned() }),
            "AUTH" => Some(Self::Auth { challenge: arr.get(1)?.as_str()?.to_owned() }),
            "CLOSED" => Some(Self::Closed {
                sub_id: arr.get(1)?.as_str()?.to_owned(),
                message: arr.get(2).and_then(Value::as_str).unwrap_or_default().to_owned(),
            }),
            _ => None,
        }
    }

    /// The subscription id this frame belongs to, if any.
    pub fn sub_id(&self) -> Option<&str> {
        match self {
            Self::Event { sub_id, .. } | Self::Eose { sub_id } | Self::Closed { sub_id, .. } => {
                Some(sub_id)
            }
            _ => None,
        }
    }
}

// -- Packets ------------------------------------------------------------------

/// Any parsed frame, tagged with the relay that produced it.
#[derive(Debug, Clone)]
pub struct MessagePacket {
    pub from: String,
    pub message: RelayMessage,
}

/// An EVENT frame routed to a subscription.
#[derive(Debug, Clone)]
pub struct EventPacket {
    pub from: String,
    pub sub_id: String,
    pub event: Event,
}

/// A publication acknowledgement from one relay.
#[derive(Debug, Clone, Serialize)]
pub struct OkPacket {
    pub from: String,
    pub id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A terminal transport failure, emitted once per exhausted retry budget.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPacket {
    pub from: String,
    pub reason: String,
}

/// A connection-state transition on one relay.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatePacket {
    pub from: String,
    pub state: ConnectionState,
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
