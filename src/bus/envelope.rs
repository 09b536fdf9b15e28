//! JSON line format of the host bus
//!
//! One envelope per line: `{"notification": "<name>", "payload": <any>}`.
//!
//! A `message` that is not UTF-8 travels as an array of byte values. On the
//! way in, any non-empty array of integers in `0..=255` is read back as raw
//! bytes, so `[255, 0]` is published as two bytes and not as the text
//! `[255,0]`.

use super::{BusCall, BusEvent, BusPayload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub const MQTT_SEND: &str = "MQTT_SEND";
pub const SHOW_ALERT: &str = "SHOW_ALERT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub notification: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct SendPayload {
    topic: String,
    #[serde(default)]
    message: Value,
}

impl BusEnvelope {
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Converts an incoming envelope into a bridge call
    ///
    /// Returns `Ok(None)` for notifications the bridge does not handle.
    pub fn into_call(self) -> Result<Option<BusCall>, serde_json::Error> {
        if self.notification != MQTT_SEND {
            debug!("Ignoring bus notification {}", self.notification);
            return Ok(None);
        }
        let send: SendPayload = serde_json::from_value(self.payload)?;
        let message = match send.message {
            Value::String(text) => BusPayload::Text(text),
            other => match byte_array(&other) {
                Some(raw) => BusPayload::Binary(raw),
                None => BusPayload::Json(other),
            },
        };
        Ok(Some(BusCall::MqttSend {
            topic: send.topic,
            message,
        }))
    }
}

impl From<BusEvent> for BusEnvelope {
    fn from(event: BusEvent) -> Self {
        match event {
            BusEvent::Notification { topic, message } => BusEnvelope {
                notification: topic,
                payload: payload_value(message),
            },
            BusEvent::Alert { message } => BusEnvelope {
                notification: SHOW_ALERT.to_string(),
                payload: json!({ "message": message }),
            },
        }
    }
}

fn byte_array(value: &Value) -> Option<Vec<u8>> {
    let items = value.as_array().filter(|items| !items.is_empty())?;
    items
        .iter()
        .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

fn payload_value(payload: BusPayload) -> Value {
    match payload {
        BusPayload::Text(text) => Value::String(text),
        BusPayload::Binary(raw) => Value::Array(raw.into_iter().map(Value::from).collect()),
        BusPayload::Json(value) => value,
    }
}
