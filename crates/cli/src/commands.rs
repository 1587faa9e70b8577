//! Subcommands.

use crate::simulate::{self, SimulationOptions};
use anyhow::Context;
use clap::Subcommand;
use coordinator::CoordinatorConfig;
use corelib::{NodeIdentity, PartitionPlan};
use std::fmt::Write as _;

/// Rendered command output.
pub type CommandResult = anyhow::Result<String>;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the shard range a worker position starts with
    Plan {
        /// Number of worker positions in the cluster
        #[arg(long, env = "SHARD_NODE_COUNT")]
        node_count: u32,
        /// 1-based position of the worker
        #[arg(long, env = "SHARD_INDEX")]
        index: Option<u32>,
    },
    /// Print this process's identity and its control queue names
    Identity,
    /// Print the shard and queue an object id routes to
    Route {
        /// Object id (hex, dashes allowed)
        object_id: String,
    },
    /// Run a cluster of supervisors on an in-memory broker
    Simulate(SimulationOptions),
    /// Load worker settings from the environment and print what a worker
    /// would start with; fails the way a misconfigured worker would
    Check,
}

impl Command {
    pub fn execute(self) -> CommandResult {
        match self {
            Command::Plan { node_count, index } => plan(node_count, index),
            Command::Identity => identity(),
            Command::Route { object_id } => route(&object_id),
            Command::Check => {
                let config = CoordinatorConfig::from_env()
                    .context("failed to read worker settings from the environment")?;
                check(&config)
            }
            Command::Simulate(options) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .context("failed to start tokio runtime")?;
                let report = runtime.block_on(simulate::run(options))?;
                Ok(report.to_string())
            }
        }
    }
}

fn plan(node_count: u32, index: Option<u32>) -> CommandResult {
    let plan = corelib::plan(Some(node_count), index)
        .with_context(|| format!("invalid cluster sizing {}/{:?}", node_count, index))?;
    Ok(match plan {
        PartitionPlan::Empty => "no shards\n".to_string(),
        range => format!("{} ({} shards)\n", range, range.len()),
    })
}

fn identity() -> CommandResult {
    let identity =
        NodeIdentity::for_current_process().context("failed to derive process identity")?;
    let mut out = String::new();
    writeln!(out, "guid:                {}", identity.guid())?;
    writeln!(out, "hostname:            {}", identity.hostname())?;
    writeln!(out, "pid:                 {}", identity.pid())?;
    writeln!(out, "exclusive queue:     {}", identity.exclusive_control_queue())?;
    writeln!(out, "broadcast queue:     {}", identity.broadcast_control_queue())?;
    writeln!(out, "broadcast exchange:  {}", identity.broadcast_control_exchange())?;
    writeln!(out, "shared queue:        {}", identity.shared_control_queue())?;
    Ok(out)
}

fn route(object_id: &str) -> CommandResult {
    let shard = corelib::shard_for_object(object_id)
        .with_context(|| format!("cannot route object {:?}", object_id))?;
    Ok(format!(
        "shard {} (queue {})\n",
        shard,
        shard.owner_queue()
    ))
}

fn check(config: &CoordinatorConfig) -> CommandResult {
    let plan = config
        .validate()
        .context("invalid worker settings, refusing to start")?;
    let supervisor = &config.supervisor;
    let mut out = String::new();
    match plan {
        PartitionPlan::Empty => writeln!(out, "initial shards:      none")?,
        range => writeln!(out, "initial shards:      {} ({} shards)", range, range.len())?,
    }
    writeln!(out, "supervise interval:  {:?}", supervisor.supervise_interval)?;
    writeln!(out, "recovery cooldown:   {:?}", supervisor.recovery_cooldown)?;
    match supervisor.orphan_sweep_period() {
        Some(period) => writeln!(out, "orphan sweep:        every {:?}", period)?,
        None => writeln!(out, "orphan sweep:        off")?,
    }
    writeln!(out, "broker:              {:?}", config.broker)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_output() {
        assert_eq!(plan(5, Some(1)).unwrap(), "[0, 203] (204 shards)\n");
        assert_eq!(plan(5, Some(5)).unwrap(), "[816, 1023] (208 shards)\n");
        assert_eq!(plan(5, None).unwrap(), "no shards\n");
    }

    #[test]
    fn test_plan_rejects_bad_index() {
        let err = plan(5, Some(6)).unwrap_err();
        assert!(err.to_string().contains("invalid cluster sizing"));
    }

    #[test]
    fn test_route_output() {
        assert_eq!(
            route("00000000-1111-2222-3333-444444444444").unwrap(),
            "shard 68 (queue vnode-68)\n"
        );
        assert!(route("not-hex").is_err());
    }

    #[test]
    fn test_check_output() {
        let mut config = CoordinatorConfig {
            node_count: Some(4),
            index: Some(2),
            ..Default::default()
        };
        config.broker.password = "hunter2".to_string();
        let out = check(&config).unwrap();
        assert!(out.contains("initial shards:      [256, 511] (256 shards)"));
        assert!(out.contains("orphan sweep:        every 5s"));
        assert!(out.contains("host: \"localhost\""));
        assert!(!out.contains("hunter2"));

        config.index = None;
        config.supervisor.orphan_sweep = coordinator::OrphanSweep::Disabled;
        let out = check(&config).unwrap();
        assert!(out.contains("initial shards:      none"));
        assert!(out.contains("orphan sweep:        off"));
    }

    #[test]
    fn test_check_refuses_bad_sizing() {
        let config = CoordinatorConfig {
            node_count: Some(4),
            index: Some(9),
            ..Default::default()
        };
        let err = check(&config).unwrap_err();
        assert!(err.to_string().contains("refusing to start"));

        assert!(check(&CoordinatorConfig::default()).is_err());
    }

    #[test]
    fn test_identity_lists_queue_names() {
        let out = identity().unwrap();
        assert!(out.contains("--exclusive-control"));
        assert!(out.contains("chef-search-control--shared"));
    }
}
