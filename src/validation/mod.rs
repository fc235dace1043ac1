//! # Message validation
//!
//! Turns a raw `(topic, payload)` pair into a typed [`ValidatedMessage`].
//!
//! The category is taken from the last topic level, the machine from the
//! `<line>/<machine>` levels, and the payload must be a JSON object that
//! matches the category's record exactly:
//!
//! | category      | required fields                              | optional            |
//! |---------------|----------------------------------------------|---------------------|
//! | `telemetry`   | `timestamp`, `metric`, `value`, `unit`       | `lineId`, `machineId` |
//! | `state`       | `timestamp`, `previousState`, `newState`     | `lineId`, `machineId` |
//! | `command-ack` | `correlationId`, `status`                    | `reason`, `timestamp`, `lineId`, `machineId` |
//!
//! Timestamps are RFC 3339 strings or integer epoch milliseconds. Unknown
//! fields are rejected rather than passed through.
//!
//! Validation is pure: the validator never touches the aggregator or the
//! dispatcher, the ingest pipeline routes the result.

mod record;


use serde_json::Value;

use crate::model::{
    CommandAck, CommandOutcome, CorrelationId, MachineId, StateEvent, TelemetryEvent,
};
use crate::topic::{Category, FactoryTopic};
use record::Record;

/// Largest payload accepted by default, in bytes.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Topic '{topic}' is outside the factory namespace")]
    MalformedTopic { topic: String },

    #[error("Unknown topic category '{category}'")]
    UnknownCategory { category: String },

    #[error("Payload is not a JSON object: {0}")]
    Undecodable(String),

    #[error("Payload of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Schema violation in field '{field}': {reason}")]
    SchemaViolation { field: String, reason: String },
}

impl ValidationError {
    pub(crate) fn violation(field: &str, reason: impl Into<String>) -> Self {
        ValidationError::SchemaViolation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Successful result of [`MessageValidator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedMessage {
    Telemetry(TelemetryEvent),
    State(StateEvent),
    CommandAck(CommandAck),
}

/// Inbound categories that carry a payload schema.
#[derive(Debug, Clone, Copy)]
enum Schema {
    Telemetry,
    State,
    CommandAck,
}

#[derive(Debug, Clone)]
pub struct MessageValidator {
    max_payload_bytes: usize,
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl MessageValidator {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub fn validate(&self, topic: &str, payload: &[u8]) -> Result<ValidatedMessage, ValidationError> {
        let parsed = FactoryTopic::parse(topic).ok_or_else(|| ValidationError::MalformedTopic {
            topic: topic.to_string(),
        })?;

        let schema = match Category::parse(parsed.category) {
            Some(Category::Telemetry) => Schema::Telemetry,
            Some(Category::State) => Schema::State,
            Some(Category::CommandAck) => Schema::CommandAck,
            // outbound commands are published, never consumed
            Some(Category::Command) | None => {
                return Err(ValidationError::UnknownCategory {
                    category: parsed.category.to_string(),
                })
            }
        };

        if payload.len() > self.max_payload_bytes {
            return Err(ValidationError::TooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
        let record = Record::new(&value)?;
        record.check_machine(&parsed.machine)?;

        let machine = parsed.machine;
        match schema {
            Schema::Telemetry => telemetry(&record, machine).map(ValidatedMessage::Telemetry),
            Schema::State => state(&record, machine).map(ValidatedMessage::State),
            Schema::CommandAck => command_ack(&record, machine).map(ValidatedMessage::CommandAck),
        }
    }
}

fn telemetry(record: &Record<'_>, machine: MachineId) -> Result<TelemetryEvent, ValidationError> {
    record.reject_unknown(&["timestamp", "metric", "value", "unit"])?;
    Ok(TelemetryEvent {
        timestamp: record.timestamp("timestamp")?,
        metric: record.non_empty_str("metric")?,
        value: record.finite_number("value")?,
        unit: record.string("unit")?,
        machine,
    })
}

fn state(record: &Record<'_>, machine: MachineId) -> Result<StateEvent, ValidationError> {
    record.reject_unknown(&["timestamp", "previousState", "newState"])?;
    Ok(StateEvent {
        timestamp: record.timestamp("timestamp")?,
        previous_state: record.machine_state("previousState")?,
        new_state: record.machine_state("newState")?,
        machine,
    })
}

fn command_ack(record: &Record<'_>, machine: MachineId) -> Result<CommandAck, ValidationError> {
    record.reject_unknown(&["correlationId", "status", "reason", "timestamp"])?;
    let correlation_id = CorrelationId::new(record.non_empty_str("correlationId")?);

    let outcome = match record.string("status")?.as_str() {
        "acknowledged" if record.has("reason") => {
            return Err(ValidationError::violation(
                "reason",
                "only allowed when status is 'rejected'",
            ))
        }
        "acknowledged" => CommandOutcome::Acknowledged,
        "rejected" => CommandOutcome::Rejected {
            reason: record.string("reason")?,
        },
        other => {
            return Err(ValidationError::violation(
                "status",
                format!("expected 'acknowledged' or 'rejected', got '{}'", other),
            ))
        }
    };

    let timestamp = if record.has("timestamp") {
        Some(record.timestamp("timestamp")?)
    } else {
        None
    };

    Ok(CommandAck {
        machine,
        correlation_id,
        outcome,
        timestamp,
    })
}
