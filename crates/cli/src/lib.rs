//! `shardctl`: operator tooling for virtual-shard coordination.
//!
//! Provides commands for:
//! - Computing a worker's partition plan
//! - Inspecting the local identity and its queue names
//! - Routing object ids to shards
//! - Simulating a cluster (and a crash) on the in-memory broker

pub mod commands;
pub mod config;
pub mod simulate;

pub use commands::{Command, CommandResult};
pub use config::{CliConfig, LogFormat};
pub use simulate::{SimulationOptions, SimulationReport};
