//! Error types for the gateway
//!
//! Every broker-side failure is recoverable: the connection driver turns it
//! into a diagnostic and keeps retrying. Nothing in here is meant to end the
//! process except [`ConfigError`] during startup.

use thiserror::Error;

/// Failures of the broker session
///
/// Produced by a [`crate::mqtt::BrokerLink`] and consumed by the connection
/// driver's reconnect loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnError {
    /// The broker answered the CONNECT with a refusal other than bad credentials
    #[error("connection refused by broker: {0}")]
    Refused(String),

    /// Username/password rejected or client not authorized
    #[error("authentication rejected by broker")]
    Auth,

    /// TCP level failure: unreachable host, reset, timeout
    #[error("network error: {0}")]
    Network(String),

    /// TLS handshake or certificate failure
    #[error("tls error: {0}")]
    Tls(String),

    /// Unexpected packet or client state error
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `connect` was called while a driver is still running
    #[error("connection manager is already running")]
    AlreadyRunning,

    /// The link's request queue is gone
    #[error("broker link closed")]
    Closed,
}

/// Failures of a single outbound publish
///
/// The message is dropped in every case; nothing is retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,

    #[error("publish queue full")]
    QueueFull,

    #[error("publish failed: {0}")]
    Link(#[from] ConnError),
}

/// A message that has no destination on the other side of the bridge
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Broker delivered a topic that is not in the configured set
    #[error("no route for topic '{0}'")]
    Unmapped(String),

    /// Bus asked for a topic MQTT does not allow publishing to
    #[error("cannot publish to topic '{0}'")]
    Unpublishable(String),
}

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("broker host must not be empty")]
    InvalidHost,

    #[error("broker port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("invalid topic '{0}': {1}")]
    InvalidTopic(String, &'static str),

    #[error("invalid setting {0}: {1}")]
    InvalidSetting(&'static str, String),
}

/// Errors surfaced by [`crate::bridge::Bridge`] lifecycle calls
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is already started")]
    AlreadyStarted,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnError),
}
