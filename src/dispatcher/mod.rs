//! # Command dispatcher
//!
//! Publishes machine commands and tracks each one until it resolves to a
//! [`CommandOutcome`]. Every command gets a correlation id, an entry in the
//! pending table and a timer. Whichever of acknowledgement or timer reaches
//! the table first removes the entry. The loser finds nothing and does
//! nothing, so a command resolves exactly once.
//!
//! At most one command per `(machine, kind)` is in flight. A second `start`
//! to the same machine fails with [`DispatchError::DuplicateInFlight`] until
//! the first one resolves, while a `stop` may be issued next to it.

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{
    CommandAck, CommandKind, CommandOutcome, CommandParameters, CorrelationId, MachineCommand,
    MachineId, QualityOfService,
};
use crate::session::PublishError;
use crate::topic::Category;

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Outbound side of the broker session as seen by the dispatcher.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QualityOfService,
    ) -> Result<(), PublishError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("A {kind} command for {target} is already in flight as {correlation_id}")]
    DuplicateInFlight {
        target: MachineId,
        kind: CommandKind,
        correlation_id: CorrelationId,
    },

    #[error("Failed to publish command: {0}")]
    Publish(#[from] PublishError),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Prefix of every correlation id.
    pub client_id: String,
    pub default_timeout: Duration,
    pub qos: QualityOfService,
}

/// Wire shape of an outbound command.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandPayload<'a> {
    command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a CommandParameters>,
    correlation_id: &'a str,
}

fn encode(command: &MachineCommand, correlation_id: &CorrelationId) -> Result<Vec<u8>, DispatchError> {
    let parameters = match command {
        MachineCommand::Start { parameters } => Some(parameters),
        MachineCommand::Stop => None,
    };
    let payload = CommandPayload {
        command: command.kind().as_str(),
        parameters,
        correlation_id: correlation_id.as_str(),
    };
    Ok(serde_json::to_vec(&payload)?)
}

struct PendingEntry {
    target: MachineId,
    kind: CommandKind,
    issued_at: Instant,
    resolver: oneshot::Sender<CommandOutcome>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<CorrelationId, PendingEntry>,
    in_flight: HashMap<(MachineId, CommandKind), CorrelationId>,
}

impl PendingTable {
    fn insert(&mut self, correlation_id: CorrelationId, entry: PendingEntry) {
        self.in_flight
            .insert((entry.target.clone(), entry.kind), correlation_id.clone());
        self.entries.insert(correlation_id, entry);
    }

    fn take(&mut self, correlation_id: &CorrelationId) -> Option<PendingEntry> {
        let entry = self.entries.remove(correlation_id)?;
        self.in_flight.remove(&(entry.target.clone(), entry.kind));
        Some(entry)
    }
}

struct Inner {
    publisher: Arc<dyn CommandPublisher>,
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    settings: DispatcherSettings,
    shutdown: CancellationToken,
}

impl Inner {
    /// Removes the entry and hands `outcome` to the waiting caller. Returns
    /// false when the command was already resolved.
    async fn resolve(&self, correlation_id: &CorrelationId, outcome: CommandOutcome) -> bool {
        let entry = self.pending.lock().await.take(correlation_id);
        match entry {
            Some(entry) => {
                debug!(
                    "{} {} for {} resolved after {:?}: {:?}",
                    entry.kind,
                    correlation_id,
                    entry.target,
                    entry.issued_at.elapsed(),
                    outcome
                );
                if entry.resolver.send(outcome).is_err() {
                    debug!("Caller of {} no longer waits for the outcome", correlation_id);
                }
                true
            }
            None => false,
        }
    }
}

/// Handle to a command that was published and awaits its outcome.
#[derive(Debug)]
pub struct PendingCommand {
    correlation_id: CorrelationId,
    target: MachineId,
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl PendingCommand {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn target(&self) -> &MachineId {
        &self.target
    }

    /// Resolves exactly once. A dispatcher dropped without resolving counts
    /// as a timeout.
    pub async fn outcome(self) -> CommandOutcome {
        self.receiver.await.unwrap_or(CommandOutcome::TimedOut)
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
}

impl CommandDispatcher {
    pub fn new(publisher: Arc<dyn CommandPublisher>, settings: DispatcherSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                publisher,
                pending: Mutex::new(PendingTable::default()),
                next_id: AtomicU64::new(1),
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.settings.default_timeout
    }

    fn next_correlation_id(&self) -> CorrelationId {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        CorrelationId::new(format!("{}-{}", self.inner.settings.client_id, n))
    }

    pub async fn send(
        &self,
        command: MachineCommand,
        target: MachineId,
        timeout: Duration,
    ) -> Result<PendingCommand, DispatchError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let kind = command.kind();
        let correlation_id = self.next_correlation_id();
        let payload = encode(&command, &correlation_id)?;
        let (resolver, receiver) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at
            .checked_add(timeout)
            .unwrap_or(issued_at + FAR_FUTURE);

        {
            let mut pending = self.inner.pending.lock().await;
            // shutdown cancels before it drains, so this check under the lock
            // keeps an entry from landing after the drain
            if self.inner.shutdown.is_cancelled() {
                return Err(DispatchError::ShuttingDown);
            }
            if let Some(existing) = pending.in_flight.get(&(target.clone(), kind)) {
                return Err(DispatchError::DuplicateInFlight {
                    target,
                    kind,
                    correlation_id: existing.clone(),
                });
            }
            pending.insert(
                correlation_id.clone(),
                PendingEntry {
                    target: target.clone(),
                    kind,
                    issued_at,
                    resolver,
                },
            );
        }

        let topic = target.topic(Category::Command);
        if let Err(e) = self
            .inner
            .publisher
            .publish(&topic, payload, self.inner.settings.qos)
            .await
        {
            warn!("Publishing {} to {} failed: {}", kind, target, e);
            self.inner.pending.lock().await.take(&correlation_id);
            return Err(DispatchError::Publish(e));
        }

        info!("Sent {} to {} as {}", kind, target, correlation_id);
        self.spawn_timer(correlation_id.clone(), deadline);

        Ok(PendingCommand {
            correlation_id,
            target,
            receiver,
        })
    }

    fn spawn_timer(&self, correlation_id: CorrelationId, deadline: Instant) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if inner.resolve(&correlation_id, CommandOutcome::TimedOut).await {
                        warn!("Command {} timed out", correlation_id);
                    }
                }
                _ = inner.shutdown.cancelled() => {
                    inner.resolve(&correlation_id, CommandOutcome::TimedOut).await;
                }
            }
        });
    }

    /// Feeds an acknowledgement from the `command-ack` channel. Returns true if
    /// it resolved a pending command.
    pub async fn acknowledge(&self, ack: CommandAck) -> bool {
        let target_matches = self
            .inner
            .pending
            .lock()
            .await
            .entries
            .get(&ack.correlation_id)
            .map(|entry| entry.target == ack.machine);

        match target_matches {
            None => {
                info!(
                    "Ignoring late or unknown acknowledgement {} from {}",
                    ack.correlation_id, ack.machine
                );
                false
            }
            Some(false) => {
                warn!(
                    "Acknowledgement {} from {} does not match the command's target",
                    ack.correlation_id, ack.machine
                );
                false
            }
            Some(true) => {
                let resolved = self.inner.resolve(&ack.correlation_id, ack.outcome).await;
                if !resolved {
                    info!("Acknowledgement {} lost the race to its timer", ack.correlation_id);
                }
                resolved
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.entries.len()
    }

    /// Resolves every pending command with `TimedOut` and refuses new ones.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        let drained: Vec<PendingEntry> = {
            let mut pending = self.inner.pending.lock().await;
            pending.in_flight.clear();
            pending.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            if entry.resolver.send(CommandOutcome::TimedOut).is_err() {
                debug!(
                    "Caller of a {} for {} no longer waits for the outcome",
                    entry.kind, entry.target
                );
            }
        }
        if count > 0 {
            info!("Resolved {} pending commands as timed out on shutdown", count);
        }
        count
    }
}
