//! Shared data model for the factory link.
//!
//! Everything that travels between the router, the validator, the aggregator
//! and the command dispatcher is defined here. Values are plain data: events
//! are immutable once the validator has built them and commands are owned by
//! whoever hands them to the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::topic::{Category, TopicFilter, ROOT_SEGMENT};

/// Identifies one machine on one production line.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId {
    pub line_id: String,
    pub machine_id: String,
}

impl MachineId {
    pub fn new(line_id: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            line_id: line_id.into(),
            machine_id: machine_id.into(),
        }
    }

    /// Topic of this machine for the given category,
    /// e.g. `factory/B7/M3/telemetry`.
    pub fn topic(&self, category: Category) -> String {
        format!(
            "{}/{}/{}/{}",
            ROOT_SEGMENT,
            self.line_id,
            self.machine_id,
            category.as_str()
        )
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.line_id, self.machine_id)
    }
}

/// Closed set of machine states reported on the `state` channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Idle,
    Running,
    Fault,
    Maintenance,
    Offline,
}

impl MachineState {
    pub const ALL: [MachineState; 5] = [
        MachineState::Idle,
        MachineState::Running,
        MachineState::Fault,
        MachineState::Maintenance,
        MachineState::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Idle => "idle",
            MachineState::Running => "running",
            MachineState::Fault => "fault",
            MachineState::Maintenance => "maintenance",
            MachineState::Offline => "offline",
        }
    }

    /// Case-insensitive lookup, `None` for anything outside the closed set.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sensor reading of one machine.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryEvent {
    pub machine: MachineId,
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub unit: String,
}

/// A reported state change of one machine.
#[derive(Clone, Debug, PartialEq)]
pub struct StateEvent {
    pub machine: MachineId,
    pub timestamp: DateTime<Utc>,
    pub previous_state: MachineState,
    pub new_state: MachineState,
}

/// Events consumed by the telemetry aggregator.
#[derive(Clone, Debug, PartialEq)]
pub enum MachineEvent {
    Telemetry(TelemetryEvent),
    State(StateEvent),
}

impl MachineEvent {
    pub fn machine(&self) -> &MachineId {
        match self {
            MachineEvent::Telemetry(event) => &event.machine,
            MachineEvent::State(event) => &event.machine,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MachineEvent::Telemetry(event) => event.timestamp,
            MachineEvent::State(event) => event.timestamp,
        }
    }
}

/// Parameters of a start command.
pub type CommandParameters = BTreeMap<String, serde_json::Value>;

/// Command a caller wants a machine to execute.
#[derive(Clone, Debug, PartialEq)]
pub enum MachineCommand {
    Start { parameters: CommandParameters },
    Stop,
}

impl MachineCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            MachineCommand::Start { .. } => CommandKind::Start,
            MachineCommand::Stop => CommandKind::Stop,
        }
    }
}

/// Discriminant of [`MachineCommand`], used for the one-in-flight rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Start,
    Stop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token linking a command to its outcome.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal state of a dispatched command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Acknowledged,
    Rejected { reason: String },
    TimedOut,
}

/// An acknowledgement received on a `command-ack` topic.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandAck {
    pub machine: MachineId,
    pub correlation_id: CorrelationId,
    pub outcome: CommandOutcome,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Delivery guarantee of a subscription or publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityOfService {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QualityOfService> for rumqttc::QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A topic filter together with the QoS it is subscribed at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub filter: TopicFilter,
    pub qos: QualityOfService,
}

impl Subscription {
    pub fn new(filter: TopicFilter, qos: QualityOfService) -> Self {
        Self { filter, qos }
    }
}

/// A raw message as delivered by the broker session.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Short, lossy preview of the payload for log lines.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        if text.chars().count() <= max_chars {
            text.into_owned()
        } else {
            let mut short: String = text.chars().take(max_chars).collect();
            short.push('…');
            short
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_topic_follows_namespace() {
        let machine = MachineId::new("B7", "M3");
        assert_eq!(machine.topic(Category::Telemetry), "factory/B7/M3/telemetry");
        assert_eq!(machine.topic(Category::CommandAck), "factory/B7/M3/command-ack");
    }

    #[test]
    fn machine_state_parse_is_case_insensitive() {
        assert_eq!(MachineState::parse("Running"), Some(MachineState::Running));
        assert_eq!(MachineState::parse("FAULT"), Some(MachineState::Fault));
        assert_eq!(MachineState::parse("exploded"), None);
    }

    #[test]
    fn preview_truncates_long_payloads() {
        let message = InboundMessage::new("factory/B7/M3/telemetry", "0123456789abcdef");
        assert_eq!(message.preview(10), "0123456789…");
        assert_eq!(message.preview(64), "0123456789abcdef");
    }
}
