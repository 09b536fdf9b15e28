//! # Broker Connection Manager
//!
//! Owns the one MQTT session of the gateway: connect, optional
//! username/password auth, literal topic subscriptions, reconnect with
//! exponential backoff and clean shutdown.
//!
//! ```text
//! mqtt/
//! ├── backoff.rs     - reconnect delay (1s, 2s, 4s ... 60s)
//! ├── connection.rs  - ConnectionManager: public contract and state lock
//! ├── driver.rs      - statum driver running the session in a tokio task
//! └── link.rs        - BrokerLink seam and the rumqttc implementation
//! ```
//!
//! Session failures never leave this module as errors. The driver converts
//! them into [`LinkNotice::Diagnostic`] and keeps retrying until
//! [`ConnectionManager::disconnect`] is called.

pub mod backoff;
pub mod connection;
mod driver;
pub mod link;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::Backoff;
pub use connection::{ConnectionManager, ConnectionState, LinkNotice};
pub use link::{mqtt_options, BrokerLink, LinkEvent, LinkPublisher, RumqttLink};
