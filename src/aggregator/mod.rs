//! # Telemetry aggregation
//!
//! Keeps the latest known picture of every machine: one reading per
//! `(machine, metric)` and one state per machine. Memory grows with the number
//! of distinct pairs, never with the number of events.
//!
//! ## Ordering
//!
//! Telemetry channels are best effort and may reorder. An event older than the
//! stored reading is never rejected: it is counted and the reading is flagged
//! `stale`, but the newer value stays in place, so a snapshot always shows the
//! highest-timestamp value regardless of arrival order. An event with the same
//! timestamp as the stored one replaces it.


use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::model::{MachineEvent, MachineId, MachineState, StateEvent, TelemetryEvent};

/// Aggregator shared between the ingest pipeline and callers taking snapshots.
pub type SharedAggregator = Arc<RwLock<TelemetryAggregator>>;

/// What `observe` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The event is now the latest reading.
    Applied,
    /// The event was older than the stored reading and only flagged.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricReading {
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// The most recent observation for this metric arrived out of order.
    pub stale: bool,
    pub stale_observations: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateReading {
    pub state: MachineState,
    pub previous_state: MachineState,
    pub timestamp: DateTime<Utc>,
    pub stale: bool,
    pub stale_observations: u64,
}

/// Latest known picture of one machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub machine: MachineId,
    pub metrics: BTreeMap<String, MetricReading>,
    pub state: Option<StateReading>,
}

impl MachineSnapshot {
    fn empty(machine: MachineId) -> Self {
        Self {
            machine,
            metrics: BTreeMap::new(),
            state: None,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricReading> {
        self.metrics.get(name)
    }
}

#[derive(Debug, Default)]
pub struct TelemetryAggregator {
    machines: HashMap<MachineId, MachineSnapshot>,
    observed: u64,
    stale: u64,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedAggregator {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn observe(&mut self, event: MachineEvent) -> Observation {
        self.observed += 1;
        let observation = match event {
            MachineEvent::Telemetry(event) => self.observe_telemetry(event),
            MachineEvent::State(event) => self.observe_state(event),
        };
        if observation == Observation::Stale {
            self.stale += 1;
        }
        observation
    }

    fn observe_telemetry(&mut self, event: TelemetryEvent) -> Observation {
        let snapshot = self
            .machines
            .entry(event.machine.clone())
            .or_insert_with(|| MachineSnapshot::empty(event.machine.clone()));

        match snapshot.metrics.get_mut(&event.metric) {
            Some(reading) if event.timestamp < reading.timestamp => {
                reading.stale = true;
                reading.stale_observations += 1;
                warn!(
                    "Stale {} reading for {}: {} < stored {}",
                    event.metric, event.machine, event.timestamp, reading.timestamp
                );
                Observation::Stale
            }
            Some(reading) => {
                reading.value = event.value;
                reading.unit = event.unit;
                reading.timestamp = event.timestamp;
                reading.stale = false;
                Observation::Applied
            }
            None => {
                debug!("First {} reading for {}", event.metric, event.machine);
                snapshot.metrics.insert(
                    event.metric,
                    MetricReading {
                        value: event.value,
                        unit: event.unit,
                        timestamp: event.timestamp,
                        stale: false,
                        stale_observations: 0,
                    },
                );
                Observation::Applied
            }
        }
    }

    fn observe_state(&mut self, event: StateEvent) -> Observation {
        let snapshot = self
            .machines
            .entry(event.machine.clone())
            .or_insert_with(|| MachineSnapshot::empty(event.machine.clone()));

        match &mut snapshot.state {
            Some(reading) if event.timestamp < reading.timestamp => {
                reading.stale = true;
                reading.stale_observations += 1;
                warn!(
                    "Stale state change for {}: {} -> {} at {}",
                    event.machine, event.previous_state, event.new_state, event.timestamp
                );
                Observation::Stale
            }
            Some(reading) => {
                debug!(
                    "{} changed state {} -> {}",
                    event.machine, event.previous_state, event.new_state
                );
                reading.state = event.new_state;
                reading.previous_state = event.previous_state;
                reading.timestamp = event.timestamp;
                reading.stale = false;
                Observation::Applied
            }
            None => {
                snapshot.state = Some(StateReading {
                    state: event.new_state,
                    previous_state: event.previous_state,
                    timestamp: event.timestamp,
                    stale: false,
                    stale_observations: 0,
                });
                Observation::Applied
            }
        }
    }

    /// Latest known picture of `machine`, `None` if nothing was observed yet.
    pub fn snapshot(&self, machine: &MachineId) -> Option<MachineSnapshot> {
        self.machines.get(machine).cloned()
    }

    /// Snapshots of every machine on `line_id`, ordered by machine id.
    pub fn line_snapshots(&self, line_id: &str) -> Vec<MachineSnapshot> {
        let mut snapshots: Vec<MachineSnapshot> = self
            .machines
            .values()
            .filter(|snapshot| snapshot.machine.line_id == line_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.machine.cmp(&b.machine));
        snapshots
    }

    pub fn machines(&self) -> Vec<MachineId> {
        let mut machines: Vec<MachineId> = self.machines.keys().cloned().collect();
        machines.sort();
        machines
    }

    pub fn observed_events(&self) -> u64 {
        self.observed
    }

    pub fn stale_events(&self) -> u64 {
        self.stale
    }
}
