//! In-memory broker link for driving the connection manager in tests

use super::link::{BrokerLink, LinkEvent, LinkPublisher};
use crate::error::{ConnError, PublishError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Subscribe(Vec<String>),
    Disconnect,
}

#[derive(Default)]
struct Log {
    calls: Vec<LinkCall>,
    published: Vec<(String, Bytes)>,
    hold_subscribes: bool,
}

/// Queued SUBSCRIBEs go out as `SubscribeSent` with pkids 1, 2, 3... while
/// a session is up, and stay queued across a scripted error.
pub struct ScriptedLink {
    events: mpsc::UnboundedReceiver<Result<LinkEvent, ConnError>>,
    log: Arc<Mutex<Log>>,
    disconnecting: bool,
    session_up: bool,
    unsent: usize,
    next_pkid: u16,
}

/// Test-side handle: feeds poll results and inspects what the driver did
#[derive(Clone)]
pub struct LinkScript {
    events: mpsc::UnboundedSender<Result<LinkEvent, ConnError>>,
    log: Arc<Mutex<Log>>,
}

pub fn scripted_link() -> (ScriptedLink, LinkScript) {
    let (tx, rx) = mpsc::unbounded_channel();
    let log = Arc::new(Mutex::new(Log::default()));
    (
        ScriptedLink {
            events: rx,
            log: log.clone(),
            disconnecting: false,
            session_up: false,
            unsent: 0,
            next_pkid: 1,
        },
        LinkScript { events: tx, log },
    )
}

impl LinkScript {
    pub fn push(&self, event: Result<LinkEvent, ConnError>) {
        self.events.send(event).expect("link dropped");
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.log.lock().calls.clone()
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.log.lock().published.clone()
    }

    /// While held, queued SUBSCRIBEs are not written
    pub fn hold_subscribes(&self, hold: bool) {
        self.log.lock().hold_subscribes = hold;
    }

    /// Lets spawned tasks run without advancing time
    pub async fn settle(&self) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    pub async fn wait_for_call(&self, call: &LinkCall) {
        for _ in 0..2_000 {
            if self.calls().contains(call) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("link call {call:?} never happened, saw {:?}", self.calls());
    }
}

#[async_trait]
impl BrokerLink for ScriptedLink {
    async fn poll(&mut self) -> Result<LinkEvent, ConnError> {
        if self.disconnecting {
            self.disconnecting = false;
            return Ok(LinkEvent::DisconnectSent);
        }
        if self.session_up && self.unsent > 0 && !self.log.lock().hold_subscribes {
            self.unsent -= 1;
            let pkid = self.next_pkid;
            self.next_pkid += 1;
            return Ok(LinkEvent::SubscribeSent { pkid });
        }
        let event = match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        };
        match &event {
            Ok(LinkEvent::ConnAck) => self.session_up = true,
            Err(_) => self.session_up = false,
            Ok(_) => {}
        }
        event
    }

    fn subscribe(&mut self, topics: &[String]) -> Result<(), ConnError> {
        self.log
            .lock()
            .calls
            .push(LinkCall::Subscribe(topics.to_vec()));
        self.unsent += 1;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ConnError> {
        self.log.lock().calls.push(LinkCall::Disconnect);
        self.disconnecting = true;
        Ok(())
    }

    fn publisher(&self) -> Arc<dyn LinkPublisher> {
        Arc::new(ScriptedPublisher {
            log: self.log.clone(),
        })
    }
}

struct ScriptedPublisher {
    log: Arc<Mutex<Log>>,
}

impl LinkPublisher for ScriptedPublisher {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        self.log.lock().published.push((topic.to_string(), payload));
        Ok(())
    }
}
