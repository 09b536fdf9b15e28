use super::driver::{ConnectionDriver, Shared};
use super::link::BrokerLink;
use crate::config::BridgeSettings;
use crate::error::{ConnError, PublishError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

/// What the connection driver reports to the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    Message { topic: String, payload: Bytes },
    Diagnostic(String),
}

struct RunningDriver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of the single broker session
///
/// Callers on any thread may publish, subscribe and read the state; the
/// session itself is driven by a background task started with
/// [`ConnectionManager::connect`]. State, subscriptions and publishes all go
/// through one lock, which is never held across an await.
pub struct ConnectionManager {
    settings: BridgeSettings,
    shared: Arc<Shared>,
    notices: mpsc::Sender<LinkNotice>,
    running: Mutex<Option<RunningDriver>>,
}

impl ConnectionManager {
    pub fn new(settings: BridgeSettings, notices: mpsc::Sender<LinkNotice>) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared::new()),
            notices,
            running: Mutex::new(None),
        }
    }

    /// Starts the session driver for `link`
    ///
    /// Returns as soon as the driver is spawned. Session failures are retried
    /// with backoff and reported as [`LinkNotice::Diagnostic`].
    pub fn connect(
        &self,
        link: Box<dyn BrokerLink>,
        topics: BTreeSet<String>,
    ) -> Result<(), ConnError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            warn!("connect called while a session driver is running");
            return Err(ConnError::AlreadyRunning);
        }

        {
            let mut inner = self.shared.inner.lock();
            if !self.shared.set_state(&mut inner, ConnectionState::Connecting) {
                return Err(ConnError::AlreadyRunning);
            }
            inner.desired = topics;
            inner.subscriptions.clear();
            inner.requested.clear();
            inner.publisher = Some(link.publisher());
        }

        let cancel = CancellationToken::new();
        let driver = ConnectionDriver::create(
            link,
            self.shared.clone(),
            self.notices.clone(),
            self.settings.clone(),
        )
        .start();

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let closing = driver.run_until_cancelled(token).await;
            closing.shutdown().await;
        });

        *running = Some(RunningDriver { cancel, task });
        info!("Connection manager started");
        Ok(())
    }

    /// Adds topics to the subscription set
    ///
    /// Requested at once when connected, otherwise on the next ConnAck.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = String>) {
        let mut inner = self.shared.inner.lock();
        let mut wake = false;
        for topic in topics {
            if inner.desired.insert(topic.clone()) && inner.state == ConnectionState::Connected {
                inner.requested.push(topic);
                wake = true;
            }
        }
        drop(inner);
        if wake {
            self.shared.wakeup.notify_one();
        }
    }

    /// Hands a QoS 0 publish to the link without waiting
    pub fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        let inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        match &inner.publisher {
            Some(publisher) => publisher.publish(topic, payload),
            None => Err(PublishError::NotConnected),
        }
    }

    /// Closes the session. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let Some(driver) = self.running.lock().take() else {
            debug!("disconnect: no session driver running");
            self.settle_disconnected();
            return;
        };

        {
            let mut inner = self.shared.inner.lock();
            self.shared.set_state(&mut inner, ConnectionState::Closing);
        }
        driver.cancel.cancel();
        if let Err(e) = driver.task.await {
            error!("Connection driver task failed: {}", e);
        }
        self.settle_disconnected();
        info!("Connection manager stopped");
    }

    fn settle_disconnected(&self) {
        let mut inner = self.shared.inner.lock();
        inner.subscriptions.clear();
        inner.requested.clear();
        inner.publisher = None;
        self.shared.set_state(&mut inner, ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Topics the broker has acknowledged on the current session
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.shared.inner.lock().subscriptions.clone()
    }
}
