//! # Bridge Core
//!
//! Relays messages between the broker session and the host bus.
//!
//! ```text
//!             LinkNotice (mpsc)              BusEvent (mpsc)
//! driver task ─────────────────► relay task ─────────────────► host bus
//!
//! host bus ──BusCall──► Bridge::on_bus_message ──publish──► ConnectionManager
//! ```
//!
//! Delivery is at-most-once in both directions. A message that cannot be
//! routed or published is dropped and a `SHOW_ALERT` diagnostic goes to the
//! bus instead; no error is returned to the caller.

use crate::bus::{self, BusCall, BusEvent};
use crate::config::{BridgeSettings, EndpointConfig};
use crate::error::{BridgeError, RouteError};
use crate::message::{Direction, Message};
use crate::mqtt::{BrokerLink, ConnectionManager, ConnectionState, LinkNotice, RumqttLink};
use crate::router::{BusEventName, TopicRouter};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routing half of the bridge, shared with the relay task
pub struct BridgeCore {
    router: TopicRouter,
    bus: mpsc::Sender<BusEvent>,
    connection: ConnectionManager,
}

impl BridgeCore {
    /// Handles one message delivered by the broker
    ///
    /// Waits for bus capacity, which holds back the broker side while the
    /// bus is slow.
    pub async fn on_broker_message(&self, topic: &str, payload: Bytes) {
        let Some(event) = self.router.resolve_inbound(topic) else {
            let err = RouteError::Unmapped(topic.to_string());
            warn!("Dropping broker message: {}", err);
            self.emit_diagnostic(err.to_string());
            return;
        };

        let message = Message::new(event.into_string(), payload, Direction::MqttToBus);
        info!(
            "Received MQTT message - topic: {}, message: {}",
            message.topic(),
            message.preview()
        );
        if self.bus.send(bus::to_bus_shape(message)).await.is_err() {
            warn!("Bus receiver dropped, discarding broker message");
        }
    }

    /// Handles one call from the bus. Never blocks.
    pub fn on_bus_message(&self, call: BusCall) {
        let message = bus::from_bus_shape(call);
        let event = BusEventName::new(message.topic());
        let Some(topic) = self.router.resolve_outbound(&event) else {
            let err = RouteError::Unpublishable(event.into_string());
            warn!("Dropping bus message: {}", err);
            self.emit_diagnostic(err.to_string());
            return;
        };

        info!(
            "Received bus notification - topic: {}, message: {}",
            topic,
            message.preview()
        );
        let (_, payload) = message.into_parts();
        if let Err(e) = self.connection.publish(&topic, payload) {
            warn!("Dropping bus message for {}: {}", topic, e);
            self.emit_diagnostic(e.to_string());
        }
    }

    fn emit_diagnostic(&self, message: String) {
        if let Err(e) = self.bus.try_send(BusEvent::alert(message)) {
            warn!("Could not deliver diagnostic to bus: {}", e);
        }
    }

    async fn relay(&self, notice: LinkNotice) {
        match notice {
            LinkNotice::Message { topic, payload } => self.on_broker_message(&topic, payload).await,
            LinkNotice::Diagnostic(text) => {
                debug!("Forwarding diagnostic: {}", text);
                self.emit_diagnostic(text);
            }
        }
    }
}

struct RunningRelay {
    cancel: CancellationToken,
    task: JoinHandle<mpsc::Receiver<LinkNotice>>,
}

/// Lifecycle owner of one bridge instance
pub struct Bridge {
    config: EndpointConfig,
    settings: BridgeSettings,
    core: Arc<BridgeCore>,
    notices: Mutex<Option<mpsc::Receiver<LinkNotice>>>,
    relay: Mutex<Option<RunningRelay>>,
}

impl Bridge {
    pub fn new(
        config: EndpointConfig,
        settings: BridgeSettings,
        bus: mpsc::Sender<BusEvent>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::channel(settings.channel_capacity);
        let core = BridgeCore {
            router: TopicRouter::new(&config.topics),
            bus,
            connection: ConnectionManager::new(settings.clone(), notice_tx),
        };
        Self {
            config,
            settings,
            core: Arc::new(core),
            notices: Mutex::new(Some(notice_rx)),
            relay: Mutex::new(None),
        }
    }

    /// Connects to the configured broker over rumqttc
    pub fn start(&self) -> Result<(), BridgeError> {
        let link = RumqttLink::new(&self.config, self.settings.channel_capacity);
        self.start_with_link(Box::new(link))
    }

    pub fn start_with_link(&self, link: Box<dyn BrokerLink>) -> Result<(), BridgeError> {
        let mut relay = self.relay.lock();
        if relay.is_some() {
            return Err(BridgeError::AlreadyStarted);
        }
        let Some(mut rx) = self.notices.lock().take() else {
            return Err(BridgeError::AlreadyStarted);
        };

        if let Err(e) = self.core.connection.connect(link, self.config.topics.clone()) {
            *self.notices.lock() = Some(rx);
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    notice = rx.recv() => match notice {
                        Some(notice) => {
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => break,
                                _ = core.relay(notice) => {}
                            }
                        }
                        None => break,
                    },
                }
            }
            rx
        });

        *relay = Some(RunningRelay { cancel, task });
        info!(
            "Bridge started for {}:{} with {} topics",
            self.config.host,
            self.config.port,
            self.config.topics.len()
        );
        Ok(())
    }

    /// Disconnects and stops relaying. Safe to call repeatedly.
    pub async fn stop(&self) {
        let relay = self.relay.lock().take();
        self.core.connection.disconnect().await;

        let Some(relay) = relay else {
            debug!("Bridge already stopped");
            return;
        };
        relay.cancel.cancel();
        match relay.task.await {
            Ok(rx) => *self.notices.lock() = Some(rx),
            Err(e) => error!("Relay task failed: {}", e),
        }
        info!("Bridge stopped");
    }

    pub async fn on_broker_message(&self, topic: &str, payload: Bytes) {
        self.core.on_broker_message(topic, payload).await
    }

    pub fn on_bus_message(&self, call: BusCall) {
        self.core.on_bus_message(call)
    }

    pub fn state(&self) -> ConnectionState {
        self.core.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.connection.watch_state()
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.core.connection.subscriptions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusPayload;
    use crate::config::BrokerSection;
    use crate::error::ConnError;
    use crate::mqtt::testing::scripted_link;
    use crate::mqtt::LinkEvent;
    use std::time::Duration;

    fn bridge(topics: &[&str]) -> (Bridge, mpsc::Receiver<BusEvent>) {
        let config = EndpointConfig::try_from(&BrokerSection {
            host: "localhost".to_string(),
            port: 1883,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            username: String::new(),
            password: String::new(),
            ..Default::default()
        })
        .unwrap();
        let (tx, rx) = mpsc::channel(16);
        (Bridge::new(config, BridgeSettings::default(), tx), rx)
    }

    async fn wait_connected(bridge: &Bridge) {
        let mut rx = bridge.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("bridge never connected")
        .expect("state channel closed");
    }

    async fn next_event(rx: &mut mpsc::Receiver<BusEvent>) -> BusEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no bus event")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn broker_message_reaches_bus() {
        let (bridge, mut bus) = bridge(&["temp"]);
        let (link, script) = scripted_link();
        bridge.start_with_link(Box::new(link)).unwrap();

        script.push(Ok(LinkEvent::ConnAck));
        script.push(Ok(LinkEvent::SubAck {
            pkid: 1,
            granted: vec![true],
        }));
        wait_connected(&bridge).await;
        script.push(Ok(LinkEvent::Publish {
            topic: "temp".to_string(),
            payload: Bytes::from_static(b"21.5"),
        }));

        assert_eq!(
            next_event(&mut bus).await,
            BusEvent::Notification {
                topic: "temp".to_string(),
                message: BusPayload::Text("21.5".to_string()),
            }
        );
        script.settle().await;
        assert_eq!(bridge.subscriptions(), BTreeSet::from(["temp".to_string()]));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn bus_message_while_disconnected_emits_not_connected() {
        let (bridge, mut bus) = bridge(&["temp"]);
        assert_eq!(bridge.state(), ConnectionState::Disconnected);

        bridge.on_bus_message(BusCall::MqttSend {
            topic: "alert".to_string(),
            message: BusPayload::from("fire"),
        });
        assert_eq!(bus.try_recv().unwrap(), BusEvent::alert("not connected"));
        assert!(bus.try_recv().is_err());
    }

    #[tokio::test]
    async fn bus_message_while_connected_is_published() {
        let (bridge, mut bus) = bridge(&[]);
        let (link, script) = scripted_link();
        bridge.start_with_link(Box::new(link)).unwrap();
        script.push(Ok(LinkEvent::ConnAck));
        wait_connected(&bridge).await;

        bridge.on_bus_message(BusCall::MqttSend {
            topic: "alert".to_string(),
            message: BusPayload::from("fire"),
        });
        assert_eq!(
            script.published(),
            vec![("alert".to_string(), Bytes::from_static(b"fire"))]
        );
        assert!(bus.try_recv().is_err());
        bridge.stop().await;
    }

    #[tokio::test]
    async fn unmapped_broker_topic_is_dropped_with_diagnostic() {
        let (bridge, mut bus) = bridge(&["temp"]);
        bridge
            .on_broker_message("humidity", Bytes::from_static(b"40"))
            .await;
        assert_eq!(
            bus.try_recv().unwrap(),
            BusEvent::alert("no route for topic 'humidity'")
        );
    }

    #[tokio::test]
    async fn wildcard_bus_topic_is_dropped_with_diagnostic() {
        let (bridge, mut bus) = bridge(&[]);
        bridge.on_bus_message(BusCall::MqttSend {
            topic: "home/#".to_string(),
            message: BusPayload::from("on"),
        });
        assert_eq!(
            bus.try_recv().unwrap(),
            BusEvent::alert("cannot publish to topic 'home/#'")
        );
    }

    #[tokio::test]
    async fn session_errors_surface_as_alerts() {
        let (bridge, mut bus) = bridge(&["temp"]);
        let (link, script) = scripted_link();
        bridge.start_with_link(Box::new(link)).unwrap();
        script.push(Err(ConnError::Auth));
        assert_eq!(
            next_event(&mut bus).await,
            BusEvent::alert("authentication rejected by broker")
        );
        assert_eq!(bridge.state(), ConnectionState::Reconnecting);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_allows_restart() {
        let (bridge, _bus) = bridge(&["temp"]);
        bridge.stop().await;

        let (link, script) = scripted_link();
        bridge.start_with_link(Box::new(link)).unwrap();
        script.push(Ok(LinkEvent::ConnAck));
        wait_connected(&bridge).await;

        bridge.stop().await;
        bridge.stop().await;
        assert_eq!(bridge.state(), ConnectionState::Disconnected);

        let (again, again_script) = scripted_link();
        bridge.start_with_link(Box::new(again)).unwrap();
        again_script.push(Ok(LinkEvent::ConnAck));
        wait_connected(&bridge).await;
        bridge.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (bridge, _bus) = bridge(&[]);
        let (link, _script) = scripted_link();
        bridge.start_with_link(Box::new(link)).unwrap();
        let (other, _other_script) = scripted_link();
        assert!(matches!(
            bridge.start_with_link(Box::new(other)),
            Err(BridgeError::AlreadyStarted)
        ));
        bridge.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bus_calls_and_broker_messages_flow_concurrently() {
        const COUNT: usize = 200;
        let (bridge, mut bus) = bridge(&["temp"]);
        let bridge = Arc::new(bridge);
        let (link, script) = scripted_link();
        bridge.start_with_link(Box::new(link)).unwrap();
        script.push(Ok(LinkEvent::ConnAck));
        wait_connected(&bridge).await;

        let sender = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                for i in 0..COUNT {
                    bridge.on_bus_message(BusCall::MqttSend {
                        topic: "alert".to_string(),
                        message: BusPayload::Text(i.to_string()),
                    });
                    tokio::task::yield_now().await;
                }
            })
        };
        for i in 0..COUNT {
            script.push(Ok(LinkEvent::Publish {
                topic: "temp".to_string(),
                payload: Bytes::from(i.to_string()),
            }));
        }

        let mut received = Vec::new();
        while received.len() < COUNT {
            match next_event(&mut bus).await {
                BusEvent::Notification {
                    message: BusPayload::Text(text),
                    ..
                } => received.push(text),
                other => panic!("unexpected bus event {other:?}"),
            }
        }
        sender.await.unwrap();

        let expected: Vec<String> = (0..COUNT).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
        let published: Vec<(String, Bytes)> = expected
            .into_iter()
            .map(|i| ("alert".to_string(), Bytes::from(i)))
            .collect();
        assert_eq!(script.published(), published);
        assert!(bus.try_recv().is_err());

        bridge.stop().await;
    }
}
