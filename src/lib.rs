//! # mqtt-bus-gateway
//!
//! Relays messages between one MQTT broker and a host notification bus.
//!
//! ```text
//!                 ┌──────────────┐
//! MQTT broker ◄──►│ mqtt         │ ConnectionManager, reconnect, subscriptions
//!                 └──────┬───────┘
//!                        │ LinkNotice
//!                 ┌──────▼───────┐
//!                 │ bridge       │ routing via router, at-most-once relay
//!                 └──────┬───────┘
//!                        │ BusEvent / BusCall
//!                 ┌──────▼───────┐
//!   host bus  ◄──►│ bus          │ translation to and from Message
//!                 └──────────────┘
//! ```

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod message;
pub mod mqtt;
pub mod router;

pub use bridge::Bridge;
pub use config::{BridgeSettings, EndpointConfig, GatewayConfig};
pub use error::{BridgeError, ConfigError, ConnError, PublishError, RouteError};
pub use message::{Direction, Message};
