use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{
    run_supervisor_loop, BackoffPolicy, InboundSink, LinkStatus, ReconnectSupervisor,
    SessionRequest, SupervisorError,
};
use crate::dispatcher::CommandPublisher;
use crate::model::{QualityOfService, Subscription};
use crate::session::{BrokerSession, PublishError, SubscribeError, TlsCredentials};
use crate::topic::TopicFilter;

const REQUEST_CAPACITY: usize = 32;

/// Request channel of a supervisor that is not running yet. Hands out
/// publishers before the supervisor and its sink exist, so components that
/// both publish and consume can be wired in one pass.
pub struct SupervisorBuilder {
    requests: mpsc::Sender<SessionRequest>,
    request_rx: mpsc::Receiver<SessionRequest>,
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        let (requests, request_rx) = mpsc::channel(REQUEST_CAPACITY);
        Self {
            requests,
            request_rx,
        }
    }
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> SessionPublisher {
        SessionPublisher {
            requests: self.requests.clone(),
        }
    }

    pub fn spawn(
        self,
        session: Box<dyn BrokerSession>,
        credentials: TlsCredentials,
        subscriptions: Vec<Subscription>,
        policy: BackoffPolicy,
        sink: Arc<dyn InboundSink>,
    ) -> SupervisorHandle {
        let shutdown = CancellationToken::new();
        let (supervisor, status) = ReconnectSupervisor::create(
            session,
            credentials,
            subscriptions,
            policy,
            self.request_rx,
            sink,
            shutdown.clone(),
        );

        info!("Spawning reconnect supervisor");
        let task_handle = tokio::spawn(async move {
            let result = run_supervisor_loop(supervisor).await;
            match &result {
                Ok(()) => info!("Reconnect supervisor stopped"),
                Err(e) => error!("Reconnect supervisor terminated with error: {}", e),
            }
            result
        });

        SupervisorHandle {
            requests: self.requests,
            status,
            shutdown,
            task_handle: Some(task_handle),
        }
    }
}

/// Public interface to a supervisor running in its own tokio task.
pub struct SupervisorHandle {
    requests: mpsc::Sender<SessionRequest>,
    status: watch::Receiver<LinkStatus>,
    shutdown: CancellationToken,
    task_handle: Option<JoinHandle<Result<(), SupervisorError>>>,
}

impl SupervisorHandle {
    pub fn spawn(
        session: Box<dyn BrokerSession>,
        credentials: TlsCredentials,
        subscriptions: Vec<Subscription>,
        policy: BackoffPolicy,
        sink: Arc<dyn InboundSink>,
    ) -> Self {
        SupervisorBuilder::new().spawn(session, credentials, subscriptions, policy, sink)
    }

    /// Adds `filter` to the subscription set. Malformed filters are rejected
    /// here and never reach the supervisor.
    pub async fn subscribe(&self, filter: &str, qos: QualityOfService) -> Result<(), SubscribeError> {
        let filter = TopicFilter::parse(filter)?;
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SessionRequest::Subscribe {
            subscription: Subscription::new(filter, qos),
            response_tx,
        })
        .await?;
        response_rx
            .await
            .map_err(|_| SubscribeError::SupervisorStopped)?
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        let filter = TopicFilter::parse(filter)?;
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SessionRequest::Unsubscribe {
            filter,
            response_tx,
        })
        .await?;
        response_rx
            .await
            .map_err(|_| SubscribeError::SupervisorStopped)?
    }

    async fn send(&self, request: SessionRequest) -> Result<(), SubscribeError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| SubscribeError::SupervisorStopped)
    }

    pub fn publisher(&self) -> SessionPublisher {
        SessionPublisher {
            requests: self.requests.clone(),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Stops the supervisor and waits for the session to be closed.
    /// Calling it again is a no-op.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        self.shutdown.cancel();
        match self.task_handle.take() {
            Some(task) => task
                .await
                .map_err(|e| SupervisorError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

/// Publishes through the supervisor's session. Cloned into the dispatcher.
#[derive(Clone)]
pub struct SessionPublisher {
    requests: mpsc::Sender<SessionRequest>,
}

#[async_trait]
impl CommandPublisher for SessionPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                response_tx,
            })
            .await
            .map_err(|_| PublishError::SupervisorStopped)?;
        response_rx
            .await
            .map_err(|_| PublishError::SupervisorStopped)?
    }
}
