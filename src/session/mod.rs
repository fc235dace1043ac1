//! # Broker session
//!
//! [`BrokerSession`] is the seam between the link and the MQTT transport. The
//! reconnect supervisor owns exactly one session and drives it: connect,
//! (re)subscribe, publish and then pull events with [`BrokerSession::next_event`]
//! until the session reports [`SessionEvent::Closed`].
//!
//! A session never reconnects on its own. Reconnection, backoff and
//! subscription restore belong to the supervisor.

pub mod mqtt;

#[cfg(test)]
pub(crate) mod scripted;

pub use mqtt::MqttSession;

use async_trait::async_trait;

use crate::model::{InboundMessage, QualityOfService};
use crate::topic::{FilterError, TopicFilter};

/// PEM material for mutual TLS. Loaded once at startup and reused for every
/// reconnect.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsCredentials {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material stays out of logs
        f.debug_struct("TlsCredentials")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// What a connected session hands back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(InboundMessage),
    /// The connection is gone. The session stays closed until `connect`
    /// is called again.
    Closed { reason: String },
    /// The broker answered a SUBSCRIBE with a failure code. Arrives after
    /// `subscribe` already returned.
    SubscriptionRejected { filter: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("No CONNACK within {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("Invalid topic filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnect supervisor is not running")]
    SupervisorStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnect supervisor is not running")]
    SupervisorStopped,
}

/// One connection to the broker.
#[async_trait]
pub trait BrokerSession: Send {
    /// Establishes the connection, replacing any previous one.
    async fn connect(&mut self, credentials: &TlsCredentials) -> Result<(), ConnectError>;

    async fn subscribe(
        &mut self,
        filter: &TopicFilter,
        qos: QualityOfService,
    ) -> Result<(), SubscribeError>;

    async fn unsubscribe(&mut self, filter: &TopicFilter) -> Result<(), SubscribeError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError>;

    /// Waits for the next inbound message or the end of the connection.
    /// Must be cancel safe: the supervisor races it against requests.
    async fn next_event(&mut self) -> SessionEvent;

    async fn close(&mut self);
}
