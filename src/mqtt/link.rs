//! Broker link: the seam between the connection driver and the MQTT client
//!
//! [`BrokerLink`] is what the driver polls and commands. [`RumqttLink`] is the
//! production implementation on top of rumqttc's `AsyncClient`/`EventLoop`
//! pair; polling the event loop again after an error makes rumqttc open a new
//! session.

use crate::config::EndpointConfig;
use crate::error::{ConnError, PublishError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, SubscribeFilter, SubscribeReasonCode, Transport,
};
use std::sync::Arc;
use tracing::debug;

/// What the driver learns from one poll of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Session accepted by the broker
    ConnAck,
    /// The next queued SUBSCRIBE went out under `pkid`
    SubscribeSent { pkid: u16 },
    /// Result of the SUBSCRIBE sent under `pkid`, one flag per topic
    SubAck { pkid: u16, granted: Vec<bool> },
    Publish { topic: String, payload: Bytes },
    /// Our DISCONNECT has been written to the socket
    DisconnectSent,
    Other,
}

/// Non-blocking publish handle, usable from any thread
pub trait LinkPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError>;
}

#[async_trait]
pub trait BrokerLink: Send {
    async fn poll(&mut self) -> Result<LinkEvent, ConnError>;

    /// Queues a single SUBSCRIBE carrying all `topics`
    ///
    /// Queued requests survive a dropped session and go out, in order, once
    /// the next one is up. Each is reported by a later `SubscribeSent`.
    fn subscribe(&mut self, topics: &[String]) -> Result<(), ConnError>;

    fn disconnect(&mut self) -> Result<(), ConnError>;

    fn publisher(&self) -> Arc<dyn LinkPublisher>;
}

/// Builds the rumqttc options for an endpoint
///
/// Credentials are only set when a username is configured; an anonymous
/// CONNECT carries neither username nor password.
pub fn mqtt_options(config: &EndpointConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options
        .set_keep_alive(config.keep_alive)
        .set_clean_session(true);

    if let Some(credentials) = &config.credentials {
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

pub struct RumqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl RumqttLink {
    pub fn new(config: &EndpointConfig, capacity: usize) -> Self {
        debug!(
            "Creating MQTT client {} for {}:{} (anonymous: {})",
            config.client_id,
            config.host,
            config.port,
            config.is_anonymous()
        );
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), capacity);
        Self { client, eventloop }
    }
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn poll(&mut self) -> Result<LinkEvent, ConnError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(LinkEvent::ConnAck),
            Ok(Event::Incoming(Packet::SubAck(ack))) => Ok(LinkEvent::SubAck {
                pkid: ack.pkid,
                granted: ack
                    .return_codes
                    .iter()
                    .map(|code| matches!(code, SubscribeReasonCode::Success(_)))
                    .collect(),
            }),
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(LinkEvent::Publish {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => Ok(LinkEvent::SubscribeSent { pkid }),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => Ok(LinkEvent::DisconnectSent),
            Ok(_) => Ok(LinkEvent::Other),
            Err(e) => Err(map_connection_error(e)),
        }
    }

    fn subscribe(&mut self, topics: &[String]) -> Result<(), ConnError> {
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| ConnError::Protocol(e.to_string()))
    }

    fn disconnect(&mut self) -> Result<(), ConnError> {
        self.client.try_disconnect().map_err(|_| ConnError::Closed)
    }

    fn publisher(&self) -> Arc<dyn LinkPublisher> {
        Arc::new(RumqttPublisher {
            client: self.client.clone(),
        })
    }
}

struct RumqttPublisher {
    client: AsyncClient,
}

impl LinkPublisher for RumqttPublisher {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| match e {
                ClientError::TryRequest(_) => PublishError::QueueFull,
                ClientError::Request(_) => PublishError::Link(ConnError::Closed),
            })
    }
}

fn map_connection_error(error: ConnectionError) -> ConnError {
    match error {
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized,
        ) => ConnError::Auth,
        ConnectionError::ConnectionRefused(code) => ConnError::Refused(format!("{code:?}")),
        ConnectionError::Io(e) => ConnError::Network(e.to_string()),
        ConnectionError::NetworkTimeout => ConnError::Network("network timeout".to_string()),
        ConnectionError::FlushTimeout => ConnError::Network("flush timeout".to_string()),
        ConnectionError::Tls(e) => ConnError::Tls(e.to_string()),
        ConnectionError::RequestsDone => ConnError::Closed,
        other => ConnError::Protocol(other.to_string()),
    }
}
