//! In-memory [`BrokerSession`] for tests. The test keeps a [`ScriptedBroker`]
//! to feed events, queue connect failures and inspect what the session was
//! asked to do.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{
    BrokerSession, ConnectError, PublishError, SessionEvent, SubscribeError, TlsCredentials,
};
use crate::model::{InboundMessage, QualityOfService};
use crate::topic::TopicFilter;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionCall {
    Connect,
    Subscribe(String, QualityOfService),
    Unsubscribe(String),
    Publish { topic: String, payload: Vec<u8> },
    Close,
}

#[derive(Default)]
struct Script {
    connect_results: VecDeque<Result<(), ConnectError>>,
    subscribe_failures: VecDeque<SubscribeError>,
    publish_failures: VecDeque<PublishError>,
    connected: bool,
    calls: Vec<SessionCall>,
}

#[derive(Clone)]
pub(crate) struct ScriptedBroker {
    script: Arc<Mutex<Script>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

pub(crate) struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub(crate) fn scripted() -> (ScriptedSession, ScriptedBroker) {
    let script = Arc::new(Mutex::new(Script::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ScriptedSession {
            script: script.clone(),
            events: rx,
        },
        ScriptedBroker { script, events: tx },
    )
}

pub(crate) fn credentials() -> TlsCredentials {
    TlsCredentials {
        ca: b"ca".to_vec(),
        cert: b"cert".to_vec(),
        key: b"key".to_vec(),
    }
}

impl ScriptedBroker {
    pub(crate) fn fail_connects(&self, count: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script
                .connect_results
                .push_back(Err(ConnectError::Transport("connection refused".to_string())));
        }
    }

    pub(crate) fn fail_next_subscribe(&self, error: SubscribeError) {
        self.script.lock().unwrap().subscribe_failures.push_back(error);
    }

    pub(crate) fn fail_next_publish(&self, error: PublishError) {
        self.script.lock().unwrap().publish_failures.push_back(error);
    }

    pub(crate) fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let _ = self
            .events
            .send(SessionEvent::Message(InboundMessage::new(topic, payload)));
    }

    pub(crate) fn drop_connection(&self, reason: &str) {
        let _ = self.events.send(SessionEvent::Closed {
            reason: reason.to_string(),
        });
    }

    /// Answers an earlier SUBSCRIBE for `filter` with a failure code.
    pub(crate) fn refuse_subscription(&self, filter: &str) {
        let _ = self.events.send(SessionEvent::SubscriptionRejected {
            filter: filter.to_string(),
            reason: "not authorized".to_string(),
        });
    }

    pub(crate) fn calls(&self) -> Vec<SessionCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == SessionCall::Connect)
            .count()
    }

    /// Filters subscribed since the most recent connect, in order.
    pub(crate) fn subscriptions_since_last_connect(&self) -> Vec<String> {
        let calls = self.calls();
        let start = calls
            .iter()
            .rposition(|call| *call == SessionCall::Connect)
            .map_or(0, |index| index + 1);
        calls[start..]
            .iter()
            .filter_map(|call| match call {
                SessionCall::Subscribe(filter, _) => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SessionCall::Publish { topic, payload } => {
                    Some((topic, serde_json::from_slice(&payload).unwrap()))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl BrokerSession for ScriptedSession {
    async fn connect(&mut self, _credentials: &TlsCredentials) -> Result<(), ConnectError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(SessionCall::Connect);
        let result = script.connect_results.pop_front().unwrap_or(Ok(()));
        script.connected = result.is_ok();
        result
    }

    async fn subscribe(
        &mut self,
        filter: &TopicFilter,
        qos: QualityOfService,
    ) -> Result<(), SubscribeError> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(SessionCall::Subscribe(filter.to_string(), qos));
        match script.subscribe_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn unsubscribe(&mut self, filter: &TopicFilter) -> Result<(), SubscribeError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(SessionCall::Unsubscribe(filter.to_string()));
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QualityOfService,
    ) -> Result<(), PublishError> {
        let mut script = self.script.lock().unwrap();
        if !script.connected {
            return Err(PublishError::NotConnected);
        }
        if let Some(error) = script.publish_failures.pop_front() {
            return Err(error);
        }
        script.calls.push(SessionCall::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> SessionEvent {
        match self.events.recv().await {
            Some(event) => {
                if matches!(event, SessionEvent::Closed { .. }) {
                    self.script.lock().unwrap().connected = false;
                }
                event
            }
            // broker handle dropped, nothing will ever arrive
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        let mut script = self.script.lock().unwrap();
        script.connected = false;
        script.calls.push(SessionCall::Close);
    }
}
