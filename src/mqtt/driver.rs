//! Connection driver with statum state machine
//!
//! Owns the [`BrokerLink`] for the lifetime of one `connect` call and runs in
//! its own tokio task.
//!
//! ```text
//! Idle ──start──► Running ──cancel──► Closing ──shutdown──► (task ends)
//! ```
//!
//! While `Running` it walks the session through the connection states:
//!
//! ```text
//! Connecting ──ConnAck──► Connected ──error──► Reconnecting ──backoff──► Connecting
//! ```

use super::backoff::Backoff;
use super::connection::{ConnectionState, LinkNotice};
use super::link::{BrokerLink, LinkEvent, LinkPublisher};
use crate::config::BridgeSettings;
use crate::error::ConnError;
use parking_lot::Mutex;
use statum::{machine, state};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything guarded by the single connection lock
pub struct LinkInner {
    pub state: ConnectionState,
    pub subscriptions: BTreeSet<String>,
    pub desired: BTreeSet<String>,
    pub requested: Vec<String>,
    pub publisher: Option<Arc<dyn LinkPublisher>>,
}

/// State shared between the manager's callers and the driver task
pub struct Shared {
    pub inner: Mutex<LinkInner>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub wakeup: Notify,
}

impl Shared {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Mutex::new(LinkInner {
                state: ConnectionState::Disconnected,
                subscriptions: BTreeSet::new(),
                desired: BTreeSet::new(),
                requested: Vec::new(),
                publisher: None,
            }),
            state_tx,
            wakeup: Notify::new(),
        }
    }

    /// Must be called with the lock held so readers never see a stale state
    ///
    /// Once `Closing`, only `Disconnected` is accepted. Returns whether the
    /// state was applied.
    pub fn set_state(&self, inner: &mut LinkInner, state: ConnectionState) -> bool {
        if inner.state == ConnectionState::Closing
            && !matches!(state, ConnectionState::Closing | ConnectionState::Disconnected)
        {
            debug!("Connection closing, ignoring {:?}", state);
            return false;
        }
        if inner.state != state {
            debug!("Connection state {:?} -> {:?}", inner.state, state);
        }
        inner.state = state;
        self.state_tx.send_replace(state);
        true
    }
}

enum Step {
    Cancelled,
    Requested,
    RetrySubscribe,
    Event(Result<LinkEvent, ConnError>),
}

#[state]
#[derive(Debug, Clone)]
pub enum DriverState {
    Idle,
    Running,
    Closing,
}

#[machine]
pub struct ConnectionDriver<S: DriverState> {
    link: Box<dyn BrokerLink>,
    shared: Arc<Shared>,
    notices: mpsc::Sender<LinkNotice>,
    settings: BridgeSettings,
    backoff: Backoff,
    /// Handed to the link, not yet written. Kept across sessions.
    queued: VecDeque<Vec<String>>,
    /// Written on the current session, keyed by packet id
    awaiting: HashMap<u16, Vec<String>>,
    retry: Vec<String>,
    retry_at: Option<Instant>,
    session_up: bool,
}

impl ConnectionDriver<Idle> {
    pub fn create(
        link: Box<dyn BrokerLink>,
        shared: Arc<Shared>,
        notices: mpsc::Sender<LinkNotice>,
        settings: BridgeSettings,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        Self::new(
            link,
            shared,
            notices,
            settings,
            backoff,
            VecDeque::new(), // queued
            HashMap::new(),  // awaiting
            Vec::new(),      // retry
            None,            // retry_at
            false,           // session_up
        )
    }

    pub fn start(self) -> ConnectionDriver<Running> {
        info!("Starting connection driver");
        self.transition()
    }
}

impl ConnectionDriver<Running> {
    /// Main session loop, returns once `cancel` fires
    pub async fn run_until_cancelled(
        mut self,
        cancel: CancellationToken,
    ) -> ConnectionDriver<Closing> {
        loop {
            let retry_at = self.retry_at;
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = self.shared.wakeup.notified() => Step::Requested,
                _ = sleep_until_or_never(retry_at) => Step::RetrySubscribe,
                event = self.link.poll() => Step::Event(event),
            };

            match step {
                Step::Cancelled => break,
                Step::Requested => {
                    let topics = {
                        let mut inner = self.shared.inner.lock();
                        let requested = std::mem::take(&mut inner.requested);
                        if inner.state != ConnectionState::Connected {
                            Vec::new()
                        } else {
                            requested
                                .into_iter()
                                .filter(|t| !inner.subscriptions.contains(t))
                                .collect()
                        }
                    };
                    self.request(topics);
                }
                Step::RetrySubscribe => {
                    self.retry_at = None;
                    let topics = std::mem::take(&mut self.retry);
                    if self.session_up {
                        info!("Retrying subscription for {:?}", topics);
                        self.request(topics);
                    }
                }
                Step::Event(Ok(event)) => self.handle_event(event, &cancel).await,
                Step::Event(Err(e)) => {
                    if self.session_lost(e, &cancel).await {
                        break;
                    }
                }
            }
        }

        info!("Connection driver cancelled");
        self.transition()
    }

    async fn handle_event(&mut self, event: LinkEvent, cancel: &CancellationToken) {
        match event {
            LinkEvent::ConnAck => {
                self.session_up = true;
                self.backoff.reset();
                self.retry.clear();
                self.retry_at = None;
                let topics: Vec<String> = {
                    let mut inner = self.shared.inner.lock();
                    if !self.shared.set_state(&mut inner, ConnectionState::Connected) {
                        return;
                    }
                    inner.subscriptions.clear();
                    inner.requested.clear();
                    inner.desired.iter().cloned().collect()
                };
                info!("Connected to broker, subscribing to {} topics", topics.len());
                self.request(topics);
            }
            LinkEvent::SubscribeSent { pkid } => match self.queued.pop_front() {
                Some(batch) => {
                    debug!("Subscribe {:?} sent as pkid {}", batch, pkid);
                    self.awaiting.insert(pkid, batch);
                }
                None => warn!("Subscribe pkid {} sent without a queued request", pkid),
            },
            LinkEvent::SubAck { pkid, granted } => {
                let Some(batch) = self.awaiting.remove(&pkid) else {
                    debug!("Ignoring SubAck for unknown pkid {}", pkid);
                    return;
                };
                let mut rejected = Vec::new();
                {
                    let mut inner = self.shared.inner.lock();
                    for (idx, topic) in batch.into_iter().enumerate() {
                        if granted.get(idx).copied().unwrap_or(false) {
                            inner.subscriptions.insert(topic);
                        } else {
                            rejected.push(topic);
                        }
                    }
                }
                if !rejected.is_empty() {
                    warn!("Broker rejected subscription for {:?}", rejected);
                    let message = format!("subscription rejected for {}", rejected.join(", "));
                    self.schedule_retry(rejected);
                    send_notice(&self.notices, LinkNotice::Diagnostic(message), cancel).await;
                }
            }
            LinkEvent::Publish { topic, payload } => {
                debug!("Incoming publish on {} ({} bytes)", topic, payload.len());
                send_notice(&self.notices, LinkNotice::Message { topic, payload }, cancel).await;
            }
            LinkEvent::DisconnectSent | LinkEvent::Other => {}
        }
    }

    /// Drops the session and waits out the backoff. Returns true if cancelled.
    async fn session_lost(&mut self, e: ConnError, cancel: &CancellationToken) -> bool {
        error!("MQTT session error: {}", e);
        self.session_up = false;
        // unacked SUBSCRIBEs are not resent on a clean session
        self.awaiting.clear();
        self.retry.clear();
        self.retry_at = None;
        {
            let mut inner = self.shared.inner.lock();
            inner.subscriptions.clear();
            inner.requested.clear();
            self.shared.set_state(&mut inner, ConnectionState::Reconnecting);
        }
        send_notice(&self.notices, LinkNotice::Diagnostic(e.to_string()), cancel).await;

        let delay = self.backoff.next_delay();
        info!("Reconnecting in {:?}", delay);
        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = sleep(delay) => false,
        };
        if cancelled {
            return true;
        }

        let mut inner = self.shared.inner.lock();
        self.shared.set_state(&mut inner, ConnectionState::Connecting);
        false
    }

    fn request(&mut self, topics: Vec<String>) {
        if topics.is_empty() {
            return;
        }
        match self.link.subscribe(&topics) {
            Ok(()) => {
                debug!("Subscribe requested for {:?}", topics);
                self.queued.push_back(topics);
            }
            Err(e) => {
                warn!("Failed to queue subscribe: {}", e);
                self.schedule_retry(topics);
            }
        }
    }

    fn schedule_retry(&mut self, topics: Vec<String>) {
        self.retry.extend(topics);
        if self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + self.settings.subscribe_retry);
        }
    }
}

impl ConnectionDriver<Closing> {
    /// Sends DISCONNECT and flushes it for at most `flush_timeout`
    pub async fn shutdown(mut self) {
        if !self.session_up {
            debug!("No live session, skipping DISCONNECT");
            return;
        }
        if let Err(e) = self.link.disconnect() {
            debug!("Could not queue DISCONNECT: {}", e);
            return;
        }
        let link = &mut self.link;
        let flushed = tokio::time::timeout(self.settings.flush_timeout, async {
            loop {
                match link.poll().await {
                    Ok(LinkEvent::DisconnectSent) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        match flushed {
            Ok(()) => info!("Disconnected from broker"),
            Err(_) => warn!("Timed out flushing DISCONNECT"),
        }
    }
}

/// Waits for channel capacity unless the driver is cancelled first
async fn send_notice(
    notices: &mpsc::Sender<LinkNotice>,
    notice: LinkNotice,
    cancel: &CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        res = notices.send(notice) => {
            if res.is_err() {
                debug!("Notice receiver dropped");
            }
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
