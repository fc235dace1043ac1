//! Inbound message path: router, handlers and the sink the supervisor feeds.
//!
//! ```text
//! session ──► IngestPipeline ──► TopicRouter ──► handlers (registration order)
//!                                                  ├─ MessageLogger
//!                                                  └─ ValidatingHandler ──► aggregator / dispatcher
//! ```
//!
//! Handlers for one message are awaited in order before the next message is
//! taken from the session. A handler must not call back into the supervisor
//! (subscribe, publish): the supervisor waits for the handler to finish.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::SharedAggregator;
use crate::dispatcher::CommandDispatcher;
use crate::model::{InboundMessage, MachineEvent};
use crate::supervisor::InboundSink;
use crate::topic::{FilterError, TopicFilter, TopicRouter};
use crate::validation::{MessageValidator, ValidatedMessage};

const PREVIEW_CHARS: usize = 120;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage);
}

/// Validates inbound records and hands them to the aggregator or dispatcher.
/// Invalid messages are logged with topic and reason, then dropped.
pub struct ValidatingHandler {
    validator: MessageValidator,
    aggregator: SharedAggregator,
    dispatcher: CommandDispatcher,
}

impl ValidatingHandler {
    pub fn new(
        validator: MessageValidator,
        aggregator: SharedAggregator,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            validator,
            aggregator,
            dispatcher,
        }
    }
}

#[async_trait]
impl MessageHandler for ValidatingHandler {
    async fn handle(&self, message: &InboundMessage) {
        let validated = match self.validator.validate(&message.topic, &message.payload) {
            Ok(validated) => validated,
            Err(e) => {
                warn!("Dropping message on {}: {}", message.topic, e);
                return;
            }
        };

        match validated {
            ValidatedMessage::Telemetry(event) => {
                self.aggregator
                    .write()
                    .await
                    .observe(MachineEvent::Telemetry(event));
            }
            ValidatedMessage::State(event) => {
                self.aggregator
                    .write()
                    .await
                    .observe(MachineEvent::State(event));
            }
            ValidatedMessage::CommandAck(ack) => {
                self.dispatcher.acknowledge(ack).await;
            }
        }
    }
}

/// Console narration of every message it is routed.
#[derive(Debug, Default)]
pub struct MessageLogger;

#[async_trait]
impl MessageHandler for MessageLogger {
    async fn handle(&self, message: &InboundMessage) {
        info!(
            "Message received on {}: {}",
            message.topic,
            message.preview(PREVIEW_CHARS)
        );
    }
}

#[derive(Default)]
pub struct IngestPipeline {
    router: TopicRouter<Arc<dyn MessageHandler>>,
}

impl IngestPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, filter: &str, handler: Arc<dyn MessageHandler>) -> Result<(), FilterError> {
        self.router.register(filter, handler)
    }

    pub fn register(&mut self, filter: TopicFilter, handler: Arc<dyn MessageHandler>) {
        self.router.register_filter(filter, handler);
    }

    pub fn routes(&self) -> usize {
        self.router.len()
    }
}

#[async_trait]
impl InboundSink for IngestPipeline {
    async fn deliver(&self, message: InboundMessage) {
        let handlers = self.router.matches(&message.topic);
        if handlers.is_empty() {
            debug!("No route for {}", message.topic);
            return;
        }
        for handler in handlers {
            handler.handle(&message).await;
        }
    }
}
