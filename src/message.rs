use bytes::Bytes;
use chrono::{DateTime, Local};
use std::fmt;

const PREVIEW_LEN: usize = 32;

/// Which side of the bridge a message travels to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    MqttToBus,
    BusToMqtt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::MqttToBus => write!(f, "mqtt->bus"),
            Direction::BusToMqtt => write!(f, "bus->mqtt"),
        }
    }
}

/// Canonical message relayed by the bridge
///
/// Created at ingress, consumed on handoff to the other side. Fields are
/// private so a message cannot change after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
    direction: Direction,
    created_at: DateTime<Local>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, direction: Direction) -> Self {
        Message {
            topic: topic.into(),
            payload: payload.into(),
            direction,
            created_at: Local::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.topic, self.payload)
    }

    /// Short printable form of the payload for log lines
    pub fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        if text.chars().count() <= PREVIEW_LEN {
            text.into_owned()
        } else {
            let cut: String = text.chars().take(PREVIEW_LEN).collect();
            format!("{cut}...")
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.created_at.format("%H:%M:%S%.3f"),
            self.direction,
            self.topic,
            self.preview()
        )
    }
}
