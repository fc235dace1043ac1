//! rumqttc backed [`BrokerSession`].
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and polls it
//! until the broker answers with CONNACK. After that a pump task keeps polling
//! the event loop and forwards publishes into a channel, which is what
//! `next_event` reads. The pump ends after the first connection error so the
//! event loop never reconnects behind the supervisor's back.
//!
//! SUBACKs are matched to their filters in the pump. A failure code becomes
//! [`SessionEvent::SubscriptionRejected`].
//!
//! While the event buffer is full the pump stops polling, and rumqttc stops
//! draining its request queue. Publishes therefore never wait for queue space
//! and fail instead, and subscribe requests give up after `connect_timeout`.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, SubAck, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    BrokerSession, ConnectError, PublishError, SessionEvent, SubscribeError, TlsCredentials,
};
use crate::model::{InboundMessage, QualityOfService};
use crate::topic::TopicFilter;

/// Inbound events buffered between the pump task and `next_event`.
const EVENT_BUFFER: usize = 256;

/// Connection parameters that do not change between reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    /// Mutual TLS with the session credentials. Plain TCP otherwise.
    pub tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub request_capacity: usize,
}

struct Connection {
    client: AsyncClient,
    events: mpsc::Receiver<SessionEvent>,
    /// Filters in the order their SUBSCRIBE requests were queued.
    subscribed: mpsc::UnboundedSender<String>,
    pump: JoinHandle<()>,
}

pub struct MqttSession {
    settings: MqttSettings,
    connection: Option<Connection>,
}

impl MqttSession {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            connection: None,
        }
    }

    fn options(&self, credentials: &TlsCredentials) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.endpoint.clone(),
            self.settings.port,
        );
        options
            .set_keep_alive(self.settings.keep_alive)
            .set_clean_session(true);

        if self.settings.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: credentials.ca.clone(),
                alpn: None,
                client_auth: Some((credentials.cert.clone(), credentials.key.clone())),
            }));
        }
        options
    }

    fn client(&self) -> Option<&AsyncClient> {
        self.connection.as_ref().map(|connection| &connection.client)
    }

    /// Bounds a request that waits for space in the rumqttc request queue.
    async fn queued<F>(&self, request: F) -> Result<(), SubscribeError>
    where
        F: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        let timeout = self.settings.connect_timeout;
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| {
                SubscribeError::Transport(format!("request queue full for {:?}", timeout))
            })?
            .map_err(|e| SubscribeError::Transport(e.to_string()))
    }

    async fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.client.disconnect().await {
                debug!("Disconnect request not delivered: {}", e);
            }
            connection.pump.abort();
        }
    }
}

async fn await_connack(event_loop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(ConnectError::Refused(format!("{:?}", code))),
                };
            }
            Ok(event) => debug!("Ignoring {:?} while waiting for CONNACK", event),
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(format!("{:?}", code)))
            }
            Err(e) => return Err(ConnectError::Transport(e.to_string())),
        }
    }
}

/// Pairs SUBSCRIBE packet ids with filters. rumqttc sends requests in queue
/// order, so the n-th outgoing SUBSCRIBE carries the n-th queued filter.
struct SubscribeTracker {
    queued: mpsc::UnboundedReceiver<String>,
    sent: HashMap<u16, String>,
}

impl SubscribeTracker {
    fn new(queued: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            queued,
            sent: HashMap::new(),
        }
    }

    fn sent(&mut self, pkid: u16) {
        match self.queued.try_recv() {
            Ok(filter) => {
                self.sent.insert(pkid, filter);
            }
            Err(_) => warn!("SUBSCRIBE {} sent for an unknown filter", pkid),
        }
    }

    fn acked(&mut self, ack: SubAck) -> Option<SessionEvent> {
        let Some(filter) = self.sent.remove(&ack.pkid) else {
            warn!("SUBACK {} matches no SUBSCRIBE", ack.pkid);
            return None;
        };
        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            error!("Broker refused subscription {}", filter);
            return Some(SessionEvent::SubscriptionRejected {
                filter,
                reason: "SUBACK failure return code".to_string(),
            });
        }
        debug!("Subscription {} granted: {:?}", filter, ack.return_codes);
        None
    }
}

async fn pump(
    mut event_loop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    mut subscriptions: SubscribeTracker,
) {
    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => SessionEvent::Message(
                InboundMessage::new(publish.topic, publish.payload.to_vec()),
            ),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                subscriptions.sent(pkid);
                continue;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => match subscriptions.acked(ack) {
                Some(event) => event,
                None => continue,
            },
            Ok(Event::Incoming(Packet::Disconnect)) => SessionEvent::Closed {
                reason: "broker sent DISCONNECT".to_string(),
            },
            Ok(_) => continue,
            Err(e) => SessionEvent::Closed {
                reason: e.to_string(),
            },
        };

        let closed = matches!(event, SessionEvent::Closed { .. });
        if events.send(event).await.is_err() || closed {
            return;
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn connect(&mut self, credentials: &TlsCredentials) -> Result<(), ConnectError> {
        self.drop_connection().await;

        info!(
            "Connecting to {}:{} as {}",
            self.settings.endpoint, self.settings.port, self.settings.client_id
        );
        let (client, mut event_loop) =
            AsyncClient::new(self.options(credentials), self.settings.request_capacity);

        let timeout = self.settings.connect_timeout;
        tokio::time::timeout(timeout, await_connack(&mut event_loop))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let (subscribed, queued) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(event_loop, tx, SubscribeTracker::new(queued)));
        self.connection = Some(Connection {
            client,
            events,
            subscribed,
            pump,
        });
        Ok(())
    }

    async fn subscribe(
        &mut self,
        filter: &TopicFilter,
        qos: QualityOfService,
    ) -> Result<(), SubscribeError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| SubscribeError::Transport("not connected".to_string()))?;
        if connection.subscribed.send(filter.to_string()).is_err() {
            return Err(SubscribeError::Transport("event loop stopped".to_string()));
        }
        self.queued(connection.client.subscribe(filter.to_string(), qos.into()))
            .await
    }

    async fn unsubscribe(&mut self, filter: &TopicFilter) -> Result<(), SubscribeError> {
        let client = self
            .client()
            .ok_or_else(|| SubscribeError::Transport("not connected".to_string()))?;
        self.queued(client.unsubscribe(filter.to_string())).await
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError> {
        let client = self.client().ok_or(PublishError::NotConnected)?;
        client
            .try_publish(topic, qos.into(), false, payload)
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    async fn next_event(&mut self) -> SessionEvent {
        let Some(connection) = self.connection.as_mut() else {
            return SessionEvent::Closed {
                reason: "not connected".to_string(),
            };
        };

        let event = connection.events.recv().await;
        match event {
            Some(SessionEvent::Closed { reason }) => {
                warn!("Connection to {} closed: {}", self.settings.endpoint, reason);
                self.connection = None;
                SessionEvent::Closed { reason }
            }
            Some(event) => event,
            None => {
                self.connection = None;
                SessionEvent::Closed {
                    reason: "event loop stopped".to_string(),
                }
            }
        }
    }

    async fn close(&mut self) {
        info!("Closing session to {}", self.settings.endpoint);
        self.drop_connection().await;
    }
}
