use super::*;
use serde_json::{json, Value};
use std::sync::Mutex as StdMutex;

#[derive(Default)]
struct RecordingPublisher {
    published: StdMutex<Vec<(String, Value)>>,
    failures: StdMutex<Vec<PublishError>>,
}

impl RecordingPublisher {
    fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    fn fail_next(&self, error: PublishError) {
        self.failures.lock().unwrap().push(error);
    }
}

#[async_trait]
impl CommandPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QualityOfService,
    ) -> Result<(), PublishError> {
        if let Some(error) = self.failures.lock().unwrap().pop() {
            return Err(error);
        }
        let value: Value = serde_json::from_slice(&payload).unwrap();
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), value));
        Ok(())
    }
}

fn dispatcher() -> (CommandDispatcher, Arc<RecordingPublisher>) {
    let publisher = Arc::new(RecordingPublisher::default());
    let dispatcher = CommandDispatcher::new(
        publisher.clone(),
        DispatcherSettings {
            client_id: "factory-link".to_string(),
            default_timeout: Duration::from_secs(5),
            qos: QualityOfService::AtLeastOnce,
        },
    );
    (dispatcher, publisher)
}

fn ack(machine: &MachineId, pending: &PendingCommand, outcome: CommandOutcome) -> CommandAck {
    CommandAck {
        machine: machine.clone(),
        correlation_id: pending.correlation_id().clone(),
        outcome,
        timestamp: None,
    }
}

fn start() -> MachineCommand {
    let mut parameters = CommandParameters::new();
    parameters.insert("recipe".to_string(), json!("R-12"));
    MachineCommand::Start { parameters }
}

#[tokio::test(start_paused = true)]
async fn acknowledged_before_timeout_resolves_once() {
    let (dispatcher, publisher) = dispatcher();
    let m3 = MachineId::new("L1", "M3");

    let pending = dispatcher
        .send(start(), m3.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(pending.correlation_id().as_str(), "factory-link-1");

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "factory/L1/M3/command");
    assert_eq!(
        published[0].1,
        json!({"command": "start", "parameters": {"recipe": "R-12"}, "correlationId": "factory-link-1"})
    );

    let acknowledgement = ack(&m3, &pending, CommandOutcome::Acknowledged);
    assert!(dispatcher.acknowledge(acknowledgement.clone()).await);
    assert!(!dispatcher.acknowledge(acknowledgement).await);
    assert_eq!(pending.outcome().await, CommandOutcome::Acknowledged);
    assert_eq!(dispatcher.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn start_without_ack_times_out_and_late_ack_is_ignored() {
    let (dispatcher, _publisher) = dispatcher();
    let m3 = MachineId::new("L1", "M3");

    let pending = dispatcher
        .send(start(), m3.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    let late = ack(&m3, &pending, CommandOutcome::Acknowledged);

    let started = Instant::now();
    assert_eq!(pending.outcome().await, CommandOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(dispatcher.pending_count().await, 0);

    assert!(!dispatcher.acknowledge(late).await);
    assert_eq!(dispatcher.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn second_command_of_same_kind_is_rejected_until_first_resolves() {
    let (dispatcher, _publisher) = dispatcher();
    let m3 = MachineId::new("L1", "M3");

    let first = dispatcher
        .send(start(), m3.clone(), Duration::from_secs(5))
        .await
        .unwrap();

    let err = dispatcher
        .send(start(), m3.clone(), Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        DispatchError::DuplicateInFlight {
            kind,
            correlation_id,
            ..
        } => {
            assert_eq!(kind, CommandKind::Start);
            assert_eq!(&correlation_id, first.correlation_id());
        }
        other => panic!("expected DuplicateInFlight, got {other:?}"),
    }

    // other kinds and other machines are independent
    let stop = dispatcher
        .send(MachineCommand::Stop, m3.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    dispatcher
        .send(start(), MachineId::new("L1", "M4"), Duration::from_secs(5))
        .await
        .unwrap();

    dispatcher
        .acknowledge(ack(&m3, &first, CommandOutcome::Acknowledged))
        .await;
    assert_eq!(first.outcome().await, CommandOutcome::Acknowledged);
    dispatcher
        .send(start(), m3.clone(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_ne!(stop.correlation_id().as_str(), "factory-link-1");
}

#[tokio::test(start_paused = true)]
async fn rejection_is_delivered_with_reason() {
    let (dispatcher, publisher) = dispatcher();
    let m1 = MachineId::new("B7", "M1");

    let pending = dispatcher
        .send(MachineCommand::Stop, m1.clone(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        publisher.published()[0].1,
        json!({"command": "stop", "correlationId": pending.correlation_id().as_str()})
    );

    let rejected = CommandOutcome::Rejected {
        reason: "door open".to_string(),
    };
    assert!(dispatcher.acknowledge(ack(&m1, &pending, rejected.clone())).await);
    assert_eq!(pending.outcome().await, rejected);
}

#[tokio::test(start_paused = true)]
async fn publish_failure_releases_the_slot() {
    let (dispatcher, publisher) = dispatcher();
    let m3 = MachineId::new("L1", "M3");

    publisher.fail_next(PublishError::NotConnected);
    let err = dispatcher
        .send(start(), m3.clone(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Publish(PublishError::NotConnected)));
    assert_eq!(dispatcher.pending_count().await, 0);

    dispatcher
        .send(start(), m3, Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn ack_from_another_machine_is_ignored() {
    let (dispatcher, _publisher) = dispatcher();
    let m3 = MachineId::new("L1", "M3");

    let pending = dispatcher
        .send(start(), m3, Duration::from_secs(5))
        .await
        .unwrap();
    let stray = ack(&MachineId::new("L1", "M9"), &pending, CommandOutcome::Acknowledged);
    assert!(!dispatcher.acknowledge(stray).await);
    assert_eq!(dispatcher.pending_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_times_out_everything_and_refuses_new_commands() {
    let (dispatcher, _publisher) = dispatcher();

    let a = dispatcher
        .send(start(), MachineId::new("L1", "M1"), Duration::from_secs(60))
        .await
        .unwrap();
    let b = dispatcher
        .send(MachineCommand::Stop, MachineId::new("L1", "M2"), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(dispatcher.shutdown().await, 2);
    assert_eq!(a.outcome().await, CommandOutcome::TimedOut);
    assert_eq!(b.outcome().await, CommandOutcome::TimedOut);

    let err = dispatcher
        .send(start(), MachineId::new("L1", "M1"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn correlation_ids_are_unique() {
    let (dispatcher, _publisher) = dispatcher();
    let mut seen = std::collections::HashSet::new();
    for n in 0..20 {
        let pending = dispatcher
            .send(
                MachineCommand::Stop,
                MachineId::new("L1", format!("M{n}")),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(seen.insert(pending.correlation_id().clone()));
    }
}

#[tokio::test(start_paused = true)]
async fn unbounded_timeout_does_not_overflow_the_deadline() {
    let (dispatcher, publisher) = dispatcher();
    let m3 = MachineId::new("L1", "M3");

    let pending = dispatcher
        .send(start(), m3.clone(), Duration::MAX)
        .await
        .unwrap();
    assert_eq!(publisher.published().len(), 1);
    assert_eq!(dispatcher.pending_count().await, 1);

    tokio::time::sleep(Duration::from_secs(86_400)).await;
    let acked = ack(&m3, &pending, CommandOutcome::Acknowledged);
    assert!(dispatcher.acknowledge(acked).await);
    assert_eq!(pending.outcome().await, CommandOutcome::Acknowledged);
    assert_eq!(dispatcher.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn send_racing_shutdown_never_leaves_an_entry_behind() {
    let (dispatcher, publisher) = dispatcher();

    // the send passes its first shutdown check, then waits on the table
    let table = dispatcher.inner.pending.lock().await;
    let sender = dispatcher.clone();
    let send = tokio::spawn(async move {
        sender
            .send(start(), MachineId::new("L1", "M3"), Duration::from_secs(60))
            .await
    });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    dispatcher.inner.shutdown.cancel();
    drop(table);

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, DispatchError::ShuttingDown));
    assert_eq!(dispatcher.pending_count().await, 0);
    assert!(publisher.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timer_resolves_its_command_when_shutdown_cancels_it() {
    let (dispatcher, _publisher) = dispatcher();

    let pending = dispatcher
        .send(start(), MachineId::new("L1", "M3"), Duration::from_secs(600))
        .await
        .unwrap();
    dispatcher.inner.shutdown.cancel();

    assert_eq!(pending.outcome().await, CommandOutcome::TimedOut);
    assert_eq!(dispatcher.pending_count().await, 0);
}
