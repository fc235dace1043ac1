//! Edge gateway between a production line and the factory MQTT broker.
//!
//! Inbound telemetry, state changes and command acknowledgements arrive on
//! `factory/<line>/<machine>/<category>` topics. They are validated, folded
//! into per-machine snapshots, and matched against outstanding commands.
//! The broker connection is kept alive by a reconnect supervisor that
//! restores every subscription after a drop.
//!
//! [`link::FactoryLink`] wires the pieces together.

pub mod aggregator;
pub mod config;
pub mod dispatcher;
pub mod ingest;
pub mod link;
pub mod model;
pub mod session;
pub mod supervisor;
pub mod topic;
pub mod validation;
