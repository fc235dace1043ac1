//! # Factory link
//!
//! Wires every component into one running link:
//!
//! ```text
//!            ┌──────────── ReconnectSupervisor ◄──── BrokerSession
//!            │                    │   ▲
//!            ▼                    │   │ publish
//!      IngestPipeline             │   │
//!       (TopicRouter)             │ CommandDispatcher ◄── FactoryLinkHandle::send_command
//!        │        │               │   ▲
//!        ▼        ▼               │   │ command-ack
//!   aggregator  dispatcher ───────┘───┘
//! ```
//!
//! [`FactoryLink`] is the builder and [`FactoryLinkHandle`] the running link.


use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::aggregator::{MachineSnapshot, SharedAggregator, TelemetryAggregator};
use crate::config::{ConfigError, FactoryConfig};
use crate::dispatcher::{CommandDispatcher, DispatchError, DispatcherSettings, PendingCommand};
use crate::ingest::{IngestPipeline, MessageHandler, MessageLogger, ValidatingHandler};
use crate::model::{MachineCommand, MachineId, QualityOfService, Subscription};
use crate::session::{BrokerSession, SubscribeError, TlsCredentials};
use crate::supervisor::{
    BackoffPolicy, LinkStatus, SupervisorBuilder, SupervisorError, SupervisorHandle,
};
use crate::topic::{Category, FilterError, TopicFilter, ROOT_SEGMENT};
use crate::validation::MessageValidator;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid route: {0}")]
    Route(#[from] FilterError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Builder for a link. Nothing runs until [`FactoryLink::spawn`].
pub struct FactoryLink {
    assigned_line: String,
    subscriptions: Vec<Subscription>,
    policy: BackoffPolicy,
    dispatcher_settings: DispatcherSettings,
    validator: MessageValidator,
    narrate: bool,
    narration_filter: TopicFilter,
    validated_filters: Vec<TopicFilter>,
    routes: Vec<(TopicFilter, Arc<dyn MessageHandler>)>,
}

impl FactoryLink {
    pub fn new(config: &FactoryConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let validated_filters = [Category::Telemetry, Category::State, Category::CommandAck]
            .iter()
            .map(|category| TopicFilter::parse(&category.any_machine_filter()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            assigned_line: config.factory.assigned_line.clone(),
            subscriptions: config.subscriptions()?,
            policy: config.backoff_policy(),
            dispatcher_settings: config.dispatcher_settings(),
            validator: MessageValidator::default(),
            narrate: false,
            narration_filter: TopicFilter::parse(&format!("{ROOT_SEGMENT}/#"))?,
            validated_filters,
            routes: Vec::new(),
        })
    }

    /// Logs every inbound message with a payload preview at `info`.
    pub fn with_narration(mut self, enabled: bool) -> Self {
        self.narrate = enabled;
        self
    }

    pub fn with_validator(mut self, validator: MessageValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Registers an extra handler. Extra handlers run after the built-in
    /// ones, in the order they were added.
    pub fn route(
        mut self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, LinkError> {
        self.routes.push((TopicFilter::parse(filter)?, handler));
        Ok(self)
    }

    pub fn spawn(
        self,
        session: Box<dyn BrokerSession>,
        credentials: TlsCredentials,
    ) -> FactoryLinkHandle {
        let builder = SupervisorBuilder::new();
        let dispatcher =
            CommandDispatcher::new(Arc::new(builder.publisher()), self.dispatcher_settings);
        let aggregator = TelemetryAggregator::shared();

        let mut pipeline = IngestPipeline::new();
        if self.narrate {
            pipeline.register(self.narration_filter, Arc::new(MessageLogger));
        }
        let validating: Arc<dyn MessageHandler> = Arc::new(ValidatingHandler::new(
            self.validator,
            aggregator.clone(),
            dispatcher.clone(),
        ));
        for filter in self.validated_filters {
            pipeline.register(filter, validating.clone());
        }
        for (filter, handler) in self.routes {
            pipeline.register(filter, handler);
        }

        info!(
            "Starting link for line {} with {} subscriptions and {} routes",
            self.assigned_line,
            self.subscriptions.len(),
            pipeline.routes()
        );
        let supervisor = builder.spawn(
            session,
            credentials,
            self.subscriptions,
            self.policy,
            Arc::new(pipeline),
        );

        FactoryLinkHandle {
            supervisor,
            dispatcher,
            aggregator,
            assigned_line: self.assigned_line,
        }
    }
}

/// A running link.
pub struct FactoryLinkHandle {
    supervisor: SupervisorHandle,
    dispatcher: CommandDispatcher,
    aggregator: SharedAggregator,
    assigned_line: String,
}

impl FactoryLinkHandle {
    /// Sends with the configured default timeout.
    pub async fn send_command(
        &self,
        command: MachineCommand,
        target: MachineId,
    ) -> Result<PendingCommand, DispatchError> {
        let timeout = self.dispatcher.default_timeout();
        self.dispatcher.send(command, target, timeout).await
    }

    pub async fn send_command_with_timeout(
        &self,
        command: MachineCommand,
        target: MachineId,
        timeout: Duration,
    ) -> Result<PendingCommand, DispatchError> {
        self.dispatcher.send(command, target, timeout).await
    }

    pub async fn pending_commands(&self) -> usize {
        self.dispatcher.pending_count().await
    }

    pub async fn snapshot(&self, machine: &MachineId) -> Option<MachineSnapshot> {
        self.aggregator.read().await.snapshot(machine)
    }

    pub async fn line_snapshots(&self, line_id: &str) -> Vec<MachineSnapshot> {
        self.aggregator.read().await.line_snapshots(line_id)
    }

    pub async fn assigned_line_snapshots(&self) -> Vec<MachineSnapshot> {
        self.line_snapshots(&self.assigned_line).await
    }

    pub fn assigned_line(&self) -> &str {
        &self.assigned_line
    }

    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QualityOfService,
    ) -> Result<(), SubscribeError> {
        self.supervisor.subscribe(filter, qos).await
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        self.supervisor.unsubscribe(filter).await
    }

    pub fn status(&self) -> LinkStatus {
        self.supervisor.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.supervisor.watch_status()
    }

    /// Stops the supervisor (in-flight handlers finish, the session is
    /// closed), then resolves every pending command as timed out.
    pub async fn shutdown(&mut self) -> Result<(), LinkError> {
        info!("Shutting down link for line {}", self.assigned_line);
        let stopped = self.supervisor.shutdown().await;
        self.dispatcher.shutdown().await;
        stopped.map_err(LinkError::from)
    }
}
