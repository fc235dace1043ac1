//! Reconnect supervisor with statum state machine
//!
//! Owns the broker session for the whole life of the link. Connection failures
//! are retried forever with exponential backoff. Every successful connect
//! re-issues the complete subscription set, in registration order, before the
//! first inbound message is pulled from the session.
//!
//! # State Machine
//!
//! ```text
//!                 start
//! Disconnected ─────────► Connecting ──────► Connected
//!      ▲                    │    ▲               │
//!      │        failure     ▼    │ timer         │ session closed
//!      │                   Backoff               │
//!      └─────────────────────────────────────────┘
//!
//!   any state ──(shutdown)──► ShuttingDown
//! ```
//!
//! The subscription set lives in the machine and is only mutated through
//! [`SessionRequest`]s, so the supervisor task is its single owner.

mod backoff;
mod handle;


pub use backoff::BackoffPolicy;
pub use handle::{SessionPublisher, SupervisorBuilder, SupervisorHandle};

use async_trait::async_trait;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{InboundMessage, QualityOfService, Subscription};
use crate::session::{
    BrokerSession, PublishError, SessionEvent, SubscribeError, TlsCredentials,
};
use crate::topic::TopicFilter;

/// Consumer of every inbound message, invoked one message at a time.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn deliver(&self, message: InboundMessage);
}

/// Runtime view of the supervisor state, published on a watch channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    ShuttingDown,
    Stopped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub phase: LinkPhase,
    /// Consecutive connect attempts without a message exchange.
    pub attempt: u32,
    pub retry_in: Option<Duration>,
    pub subscriptions: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Broker rejected subscription '{filter}' during restore: {reason}")]
    RestoreRejected { filter: String, reason: String },

    #[error("Broker refused subscription '{filter}': {reason}")]
    SubscriptionRejected { filter: String, reason: String },

    #[error("Supervisor task failed: {0}")]
    TaskFailed(String),
}

/// Requests served by the supervisor task.
#[derive(Debug)]
pub enum SessionRequest {
    Subscribe {
        subscription: Subscription,
        response_tx: oneshot::Sender<Result<(), SubscribeError>>,
    },
    Unsubscribe {
        filter: TopicFilter,
        response_tx: oneshot::Sender<Result<(), SubscribeError>>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QualityOfService,
        response_tx: oneshot::Sender<Result<(), PublishError>>,
    },
}

impl SessionRequest {
    fn reject(self) {
        match self {
            SessionRequest::Subscribe { response_tx, .. }
            | SessionRequest::Unsubscribe { response_tx, .. } => {
                reply(response_tx, Err(SubscribeError::SupervisorStopped))
            }
            SessionRequest::Publish { response_tx, .. } => {
                reply(response_tx, Err(PublishError::SupervisorStopped))
            }
        }
    }
}

fn reply<T>(response_tx: oneshot::Sender<T>, value: T) {
    if response_tx.send(value).is_err() {
        debug!("Requester went away before the reply");
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Backoff(Duration),
    ShuttingDown,
}

#[machine]
pub struct ReconnectSupervisor<S: LinkState> {
    session: Box<dyn BrokerSession>,
    credentials: TlsCredentials,
    subscriptions: Vec<Subscription>,
    policy: BackoffPolicy,
    attempt: u32,
    exchanged: bool,
    last_error: Option<String>,
    fatal: Option<SupervisorError>,
    requests: mpsc::Receiver<SessionRequest>,
    sink: Arc<dyn InboundSink>,
    status: watch::Sender<LinkStatus>,
    shutdown: CancellationToken,
}

/// A supervisor in any of its states, as driven by the run loop.
pub enum Step {
    Disconnected(ReconnectSupervisor<Disconnected>),
    Connecting(ReconnectSupervisor<Connecting>),
    Connected(ReconnectSupervisor<Connected>),
    Backoff(ReconnectSupervisor<Backoff>),
    ShuttingDown(ReconnectSupervisor<ShuttingDown>),
}

impl<S: LinkState> ReconnectSupervisor<S> {
    fn publish_status(&self, phase: LinkPhase, retry_in: Option<Duration>) {
        let subscriptions = self.subscriptions.len();
        let attempt = self.attempt;
        let last_error = self.last_error.clone();
        self.status.send_modify(|status| {
            *status = LinkStatus {
                phase,
                attempt,
                retry_in,
                subscriptions,
                last_error,
            }
        });
    }

    /// Adds or updates a subscription. A filter that is already present keeps
    /// its position.
    fn remember(&mut self, subscription: Subscription) {
        match self
            .subscriptions
            .iter_mut()
            .find(|existing| existing.filter == subscription.filter)
        {
            Some(existing) => existing.qos = subscription.qos,
            None => self.subscriptions.push(subscription),
        }
        self.publish_subscription_count();
    }

    fn forget(&mut self, filter: &TopicFilter) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|existing| &existing.filter != filter);
        self.publish_subscription_count();
        before != self.subscriptions.len()
    }

    fn publish_subscription_count(&self) {
        let subscriptions = self.subscriptions.len();
        self.status.send_if_modified(|status| {
            std::mem::replace(&mut status.subscriptions, subscriptions) != subscriptions
        });
    }

    /// Serves a request while no connection is up. Subscription changes are
    /// recorded and applied on the next connect.
    fn queue_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Subscribe {
                subscription,
                response_tx,
            } => {
                debug!("Recording subscription {} for next connect", subscription.filter);
                self.remember(subscription);
                reply(response_tx, Ok(()));
            }
            SessionRequest::Unsubscribe {
                filter,
                response_tx,
            } => {
                if !self.forget(&filter) {
                    debug!("Unsubscribe for unknown filter {}", filter);
                }
                reply(response_tx, Ok(()));
            }
            SessionRequest::Publish { topic, response_tx, .. } => {
                debug!("Publish to {} refused while offline", topic);
                reply(response_tx, Err(PublishError::NotConnected));
            }
        }
    }

    fn schedule_backoff(mut self, reason: String) -> ReconnectSupervisor<Backoff> {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(reason);
        self.transition_with(delay)
    }
}

impl ReconnectSupervisor<Disconnected> {
    pub fn create(
        session: Box<dyn BrokerSession>,
        credentials: TlsCredentials,
        initial: Vec<Subscription>,
        policy: BackoffPolicy,
        requests: mpsc::Receiver<SessionRequest>,
        sink: Arc<dyn InboundSink>,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<LinkStatus>) {
        let (status, status_rx) = watch::channel(LinkStatus::default());
        let mut supervisor = Self::new(
            session,
            credentials,
            Vec::with_capacity(initial.len()),
            policy,
            0,     // attempt
            false, // exchanged
            None,  // last_error
            None,  // fatal
            requests,
            sink,
            status,
            shutdown,
        );
        for subscription in initial {
            supervisor.remember(subscription);
        }
        supervisor.publish_status(LinkPhase::Disconnected, None);
        (supervisor, status_rx)
    }

    pub fn start(self) -> Step {
        if self.shutdown.is_cancelled() {
            return Step::ShuttingDown(self.transition());
        }
        Step::Connecting(self.transition())
    }

    /// Entered after a live session closed.
    pub fn retry(self) -> Step {
        if self.shutdown.is_cancelled() {
            return Step::ShuttingDown(self.transition());
        }
        let reason = self
            .last_error
            .clone()
            .unwrap_or_else(|| "session closed".to_string());
        Step::Backoff(self.schedule_backoff(reason))
    }
}

impl ReconnectSupervisor<Connecting> {
    pub async fn connect(mut self) -> Step {
        self.publish_status(LinkPhase::Connecting, None);
        info!("Connecting to broker (attempt {})", self.attempt + 1);

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested, abandoning connect attempt");
                return Step::ShuttingDown(self.transition());
            }
            result = self.session.connect(&self.credentials) => result,
        };

        if let Err(e) = result {
            warn!("Connect attempt failed: {}", e);
            return Step::Backoff(self.schedule_backoff(e.to_string()));
        }

        self.exchanged = false;
        match resubscribe(self.session.as_mut(), &self.subscriptions).await {
            Ok(()) => {
                info!(
                    "Connected, {} subscriptions restored",
                    self.subscriptions.len()
                );
                self.last_error = None;
                Step::Connected(self.transition())
            }
            Err((filter, SubscribeError::InvalidFilter(e))) => {
                error!("Broker rejected filter {} during restore: {}", filter, e);
                self.fatal = Some(SupervisorError::RestoreRejected {
                    filter,
                    reason: e.to_string(),
                });
                Step::ShuttingDown(self.transition())
            }
            Err((filter, e)) => {
                warn!("Restoring subscription {} failed: {}", filter, e);
                self.session.close().await;
                Step::Backoff(self.schedule_backoff(e.to_string()))
            }
        }
    }
}

async fn resubscribe(
    session: &mut dyn BrokerSession,
    subscriptions: &[Subscription],
) -> Result<(), (String, SubscribeError)> {
    for subscription in subscriptions {
        debug!("Restoring subscription {}", subscription.filter);
        session
            .subscribe(&subscription.filter, subscription.qos)
            .await
            .map_err(|e| (subscription.filter.to_string(), e))?;
    }
    Ok(())
}

impl ReconnectSupervisor<Connected> {
    /// Pulls messages from the session until it closes or shutdown is requested.
    pub async fn serve(mut self) -> Step {
        self.publish_status(LinkPhase::Connected, None);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return Step::ShuttingDown(self.transition());
                }
                event = self.session.next_event() => match event {
                    SessionEvent::Message(message) => {
                        self.exchanged = true;
                        debug!("Inbound message on {}", message.topic);
                        self.sink.deliver(message).await;
                    }
                    SessionEvent::Closed { reason } => {
                        return self.lost(reason);
                    }
                    SessionEvent::SubscriptionRejected { filter, reason } => {
                        return self.refused(filter, reason);
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if let Err(reason) = self.serve_request(request).await {
                            self.session.close().await;
                            return self.lost(reason);
                        }
                    }
                    None => {
                        info!("All supervisor handles dropped");
                        return Step::ShuttingDown(self.transition());
                    }
                },
            }
        }
    }

    /// Returns the reason when the request broke the connection.
    async fn serve_request(&mut self, request: SessionRequest) -> Result<(), String> {
        match request {
            SessionRequest::Subscribe {
                subscription,
                response_tx,
            } => match self
                .session
                .subscribe(&subscription.filter, subscription.qos)
                .await
            {
                Ok(()) => {
                    info!("Subscribed to {}", subscription.filter);
                    self.remember(subscription);
                    reply(response_tx, Ok(()));
                    Ok(())
                }
                Err(SubscribeError::InvalidFilter(e)) => {
                    reply(response_tx, Err(SubscribeError::InvalidFilter(e)));
                    Ok(())
                }
                Err(e) => {
                    // accepted, the next connect restores it
                    self.remember(subscription);
                    reply(response_tx, Ok(()));
                    Err(e.to_string())
                }
            },
            SessionRequest::Unsubscribe {
                filter,
                response_tx,
            } => {
                self.forget(&filter);
                let result = self.session.unsubscribe(&filter).await;
                reply(response_tx, Ok(()));
                match result {
                    Ok(()) => {
                        info!("Unsubscribed from {}", filter);
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            SessionRequest::Publish {
                topic,
                payload,
                qos,
                response_tx,
            } => {
                let result = self.session.publish(&topic, payload, qos).await;
                if let Err(e) = &result {
                    warn!("Publish to {} failed: {}", topic, e);
                }
                reply(response_tx, result);
                Ok(())
            }
        }
    }

    /// A subscription the broker refuses cannot be fixed by reconnecting.
    fn refused(mut self, filter: String, reason: String) -> Step {
        error!("Broker refused subscription {}: {}", filter, reason);
        self.subscriptions
            .retain(|existing| existing.filter.to_string() != filter);
        self.publish_subscription_count();
        self.last_error = Some(format!("subscription {} refused: {}", filter, reason));
        self.fatal = Some(SupervisorError::SubscriptionRejected { filter, reason });
        Step::ShuttingDown(self.transition())
    }

    fn lost(mut self, reason: String) -> Step {
        if self.exchanged {
            self.attempt = 0;
        }
        warn!("Session closed: {}", reason);
        self.last_error = Some(reason);
        self.publish_status(LinkPhase::Disconnected, None);
        Step::Disconnected(self.transition())
    }
}

impl ReconnectSupervisor<Backoff> {
    pub async fn wait(mut self) -> Step {
        let delay = self.get_state_data().copied().unwrap_or(self.policy.base);
        self.publish_status(LinkPhase::Backoff, Some(delay));
        info!("Retrying in {:?} (attempt {})", delay, self.attempt);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return Step::ShuttingDown(self.transition());
                }
                _ = &mut sleep => {
                    return Step::Connecting(self.transition());
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.queue_request(request),
                    None => return Step::ShuttingDown(self.transition()),
                },
            }
        }
    }
}

impl ReconnectSupervisor<ShuttingDown> {
    pub async fn close(mut self) -> Result<(), SupervisorError> {
        self.publish_status(LinkPhase::ShuttingDown, None);
        info!("Shutting down, closing broker session");
        self.session.close().await;

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.reject();
        }

        self.publish_status(LinkPhase::Stopped, None);
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Drives the supervisor until shutdown.
pub(crate) async fn run_supervisor_loop(
    supervisor: ReconnectSupervisor<Disconnected>,
) -> Result<(), SupervisorError> {
    let mut step = supervisor.start();
    loop {
        step = match step {
            Step::Disconnected(supervisor) => supervisor.retry(),
            Step::Connecting(supervisor) => supervisor.connect().await,
            Step::Connected(supervisor) => supervisor.serve().await,
            Step::Backoff(supervisor) => supervisor.wait().await,
            Step::ShuttingDown(supervisor) => return supervisor.close().await,
        };
    }
}
