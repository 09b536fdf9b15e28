//! # Bus Adapter
//!
//! Translates between the host notification bus and the bridge's canonical
//! [`Message`]. The host bus knows two shapes:
//!
//! ```text
//! inbound   MQTT_SEND { topic, message }   publish this to MQTT
//! outbound  <topic>   message              an MQTT message arrived
//!           SHOW_ALERT { message }         diagnostic
//! ```
//!
//! Each shape is a variant here, so the bridge matches on them exhaustively
//! instead of comparing notification strings. The translation functions are
//! pure and hold no state.

pub mod envelope;

use crate::message::{Direction, Message};
use bytes::Bytes;

/// Content of a bus `message` field
#[derive(Debug, Clone, PartialEq)]
pub enum BusPayload {
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl BusPayload {
    pub fn into_bytes(self) -> Bytes {
        match self {
            BusPayload::Text(text) => Bytes::from(text),
            BusPayload::Binary(raw) => Bytes::from(raw),
            BusPayload::Json(value) => Bytes::from(value.to_string()),
        }
    }

    pub fn from_bytes(payload: Bytes) -> Self {
        match String::from_utf8(payload.to_vec()) {
            Ok(text) => BusPayload::Text(text),
            Err(err) => BusPayload::Binary(err.into_bytes()),
        }
    }
}

impl From<&str> for BusPayload {
    fn from(text: &str) -> Self {
        BusPayload::Text(text.to_string())
    }
}

/// Calls the bus makes into the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BusCall {
    MqttSend { topic: String, message: BusPayload },
}

/// Calls the bridge makes onto the bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Notification { topic: String, message: BusPayload },
    Alert { message: String },
}

impl BusEvent {
    pub fn alert(message: impl Into<String>) -> Self {
        BusEvent::Alert {
            message: message.into(),
        }
    }
}

pub fn to_bus_shape(message: Message) -> BusEvent {
    let (topic, payload) = message.into_parts();
    BusEvent::Notification {
        topic,
        message: BusPayload::from_bytes(payload),
    }
}

pub fn from_bus_shape(call: BusCall) -> Message {
    match call {
        BusCall::MqttSend { topic, message } => {
            Message::new(topic, message.into_bytes(), Direction::BusToMqtt)
        }
    }
}
