//! Topic routing between broker topics and bus event names
//!
//! Inbound, a configured broker topic maps to a bus event of the same name.
//! Outbound, the event name the bus hands over is used as the MQTT topic
//! unchanged. All matching is literal.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Name of a notification on the host bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusEventName(String);

impl BusEventName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for BusEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    inbound: HashMap<String, BusEventName>,
}

impl TopicRouter {
    pub fn new(topics: &BTreeSet<String>) -> Self {
        let inbound = topics
            .iter()
            .map(|topic| (topic.clone(), BusEventName::new(topic.clone())))
            .collect();
        Self { inbound }
    }

    pub fn resolve_inbound(&self, topic: &str) -> Option<BusEventName> {
        self.inbound.get(topic).cloned()
    }

    /// Returns `None` for names MQTT cannot publish to
    pub fn resolve_outbound(&self, event: &BusEventName) -> Option<String> {
        let name = event.as_str();
        if name.is_empty() || name.contains(['+', '#', '\0']) {
            return None;
        }
        Some(name.to_string())
    }
}
