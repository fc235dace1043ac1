//! Field accessors over a decoded JSON object that report failures as
//! [`ValidationError::SchemaViolation`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::ValidationError;
use crate::model::{MachineId, MachineState};

/// Fields any record may carry to echo the machine from its topic.
const ECHO_FIELDS: [&str; 2] = ["lineId", "machineId"];

pub(crate) struct Record<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Record<'a> {
    pub(crate) fn new(value: &'a Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ValidationError::Undecodable(format!(
                "expected an object, got {}",
                kind(other)
            ))),
        }
    }

    pub(crate) fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub(crate) fn reject_unknown(&self, allowed: &[&str]) -> Result<(), ValidationError> {
        // sorted so the reported field does not depend on map ordering
        let mut unknown: Vec<&String> = self
            .fields
            .keys()
            .filter(|key| !allowed.contains(&key.as_str()) && !ECHO_FIELDS.contains(&key.as_str()))
            .collect();
        unknown.sort();

        match unknown.first() {
            Some(field) => Err(ValidationError::violation(field, "unknown field")),
            None => Ok(()),
        }
    }

    /// Echoed `lineId`/`machineId` must agree with the topic.
    pub(crate) fn check_machine(&self, machine: &MachineId) -> Result<(), ValidationError> {
        if self.has("lineId") {
            let line = self.string("lineId")?;
            if line != machine.line_id {
                return Err(ValidationError::violation(
                    "lineId",
                    format!("'{}' does not match topic line '{}'", line, machine.line_id),
                ));
            }
        }
        if self.has("machineId") {
            let id = self.string("machineId")?;
            if id != machine.machine_id {
                return Err(ValidationError::violation(
                    "machineId",
                    format!("'{}' does not match topic machine '{}'", id, machine.machine_id),
                ));
            }
        }
        Ok(())
    }

    fn required(&self, field: &str) -> Result<&'a Value, ValidationError> {
        match self.fields.get(field) {
            Some(Value::Null) | None => Err(ValidationError::violation(field, "missing")),
            Some(value) => Ok(value),
        }
    }

    pub(crate) fn string(&self, field: &str) -> Result<String, ValidationError> {
        match self.required(field)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(ValidationError::violation(
                field,
                format!("expected a string, got {}", kind(other)),
            )),
        }
    }

    pub(crate) fn non_empty_str(&self, field: &str) -> Result<String, ValidationError> {
        let value = self.string(field)?;
        if value.trim().is_empty() {
            return Err(ValidationError::violation(field, "must not be empty"));
        }
        Ok(value)
    }

    pub(crate) fn finite_number(&self, field: &str) -> Result<f64, ValidationError> {
        match self.required(field)? {
            Value::Number(n) => n
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ValidationError::violation(field, "not a finite number")),
            other => Err(ValidationError::violation(
                field,
                format!("expected a number, got {}", kind(other)),
            )),
        }
    }

    pub(crate) fn timestamp(&self, field: &str) -> Result<DateTime<Utc>, ValidationError> {
        match self.required(field)? {
            Value::String(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| {
                    ValidationError::violation(field, format!("not an RFC 3339 timestamp: {}", e))
                }),
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| {
                    ValidationError::violation(field, "epoch milliseconds out of range")
                }),
            other => Err(ValidationError::violation(
                field,
                format!("expected a timestamp, got {}", kind(other)),
            )),
        }
    }

    pub(crate) fn machine_state(&self, field: &str) -> Result<MachineState, ValidationError> {
        let raw = self.string(field)?;
        MachineState::parse(&raw).ok_or_else(|| {
            ValidationError::violation(field, format!("unknown machine state '{}'", raw))
        })
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
