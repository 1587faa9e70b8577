//! In-process cluster simulation.
//!
//! Every simulated worker gets its own connection to one [`MemoryBroker`],
//! so killing a worker is just closing its connection: its consumers vanish
//! without any goodbye, exactly what the survivors' orphan sweep has to
//! detect.

use anyhow::{ensure, Context};
use clap::Args;
use coordinator::{
    CoordinatorConfig, LoggingTransformer, OrphanSweep, ShardSupervisor, SupervisorSettings,
};
use corelib::{NodeIdentity, TOTAL_SHARDS};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streaming::{Broker, MemoryBroker, MemoryConnection};
use tracing::{info, warn};

#[derive(Debug, Clone, Args)]
pub struct SimulationOptions {
    /// Number of workers
    #[arg(long, default_value_t = 3)]
    pub nodes: u32,
    /// 1-based position of a worker to kill once the cluster has converged
    #[arg(long)]
    pub kill: Option<u32>,
    /// Duplicate-consumer detection interval
    #[arg(long, env = "SHARD_SUPERVISE_INTERVAL_MS", default_value_t = 100)]
    pub supervise_interval_ms: u64,
    /// Orphan sweep period, 0 disables it
    #[arg(long, env = "SHARD_ORPHAN_SWEEP_MS", default_value_t = 250)]
    pub sweep_interval_ms: u64,
    /// Per-shard recovery debounce window
    #[arg(long, env = "SHARD_RECOVERY_COOLDOWN_MS", default_value_t = 2_000)]
    pub recovery_cooldown_ms: u64,
    /// Give up if the cluster has not converged after this long
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

impl SimulationOptions {
    fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            node_count: Some(self.nodes),
            index: None,
            supervisor: SupervisorSettings {
                supervise_interval: Duration::from_millis(self.supervise_interval_ms),
                recovery_cooldown: Duration::from_millis(self.recovery_cooldown_ms),
                orphan_sweep: OrphanSweep::Every(Duration::from_millis(self.sweep_interval_ms)),
            },
            ..Default::default()
        }
    }
}

/// Final state of one surviving worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub index: u32,
    pub identity: NodeIdentity,
    pub shards: usize,
    pub leader: bool,
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub nodes: Vec<NodeReport>,
    /// Killed worker and the number of shards it held.
    pub killed: Option<(u32, NodeIdentity, usize)>,
    pub elapsed: Duration,
}

impl SimulationReport {
    /// Shards held across the surviving workers.
    pub fn total_shards(&self) -> usize {
        self.nodes.iter().map(|n| n.shards).sum()
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(
                f,
                "node {} {}: {} shards{}",
                node.index,
                node.identity,
                node.shards,
                if node.leader { " [leader]" } else { "" }
            )?;
        }
        if let Some((index, identity, held)) = &self.killed {
            writeln!(
                f,
                "killed node {} {}: {} shards recovered",
                index, identity, held
            )?;
        }
        writeln!(
            f,
            "{} of {} shards owned after {:.2?}",
            self.total_shards(),
            TOTAL_SHARDS,
            self.elapsed
        )
    }
}

struct Member {
    index: u32,
    connection: Arc<MemoryConnection>,
    supervisor: ShardSupervisor,
}

/// Start the cluster, wait for convergence, optionally kill one worker and
/// wait for its shards to be recovered, then shut the survivors down.
pub async fn run(options: SimulationOptions) -> anyhow::Result<SimulationReport> {
    let config = options.config();
    config.validate().context("invalid simulation settings")?;
    if let Some(kill) = options.kill {
        ensure!(
            (1..=options.nodes).contains(&kill),
            "--kill must be between 1 and {}",
            options.nodes
        );
    }
    let timeout = Duration::from_secs(options.timeout_secs);
    let started = Instant::now();

    let broker = MemoryBroker::new();
    let mut members = Vec::with_capacity(options.nodes as usize);
    for index in 1..=options.nodes {
        let connection = Arc::new(broker.connect());
        let identity = NodeIdentity::for_current_process()?;
        let supervisor = ShardSupervisor::new(
            identity,
            Arc::clone(&connection) as Arc<dyn Broker>,
            Arc::new(LoggingTransformer::new()),
            config.supervisor,
        );
        let plan = corelib::plan(config.node_count, Some(index))?;
        supervisor
            .start(plan.shards())
            .await
            .with_context(|| format!("failed to start node {}", index))?;
        members.push(Member {
            index,
            connection,
            supervisor,
        });
    }

    let converged = wait_until(timeout, || {
        members
            .iter()
            .all(|m| m.supervisor.table().claimed_count() == TOTAL_SHARDS as usize)
    })
    .await;
    ensure!(converged, "cluster did not converge within {:?}", timeout);
    info!(nodes = options.nodes, "Cluster converged");

    let mut killed = None;
    if let Some(kill) = options.kill {
        let victim = members.remove((kill - 1) as usize);
        let identity = victim.supervisor.identity().clone();
        let held = victim.supervisor.local_shards().len();
        warn!(node = %identity, shards = held, "Killing node");
        victim.connection.close();
        victim.supervisor.abandon();

        let recovered = wait_until(timeout, || {
            members.iter().all(|m| {
                let table = m.supervisor.table();
                table.claimed_count() == TOTAL_SHARDS as usize
                    && table.claims_of(&identity).is_none()
            }) && members
                .iter()
                .map(|m| m.supervisor.local_shards().len())
                .sum::<usize>()
                == TOTAL_SHARDS as usize
        })
        .await;
        ensure!(
            recovered,
            "shards of node {} were not recovered within {:?}",
            kill,
            timeout
        );
        killed = Some((kill, identity, held));
    }

    let nodes = members
        .iter()
        .map(|m| NodeReport {
            index: m.index,
            identity: m.supervisor.identity().clone(),
            shards: m.supervisor.local_shards().len(),
            leader: m.supervisor.is_leader(),
        })
        .collect();
    let report = SimulationReport {
        nodes,
        killed,
        elapsed: started.elapsed(),
    };

    for member in &members {
        member.supervisor.shutdown().await;
    }
    Ok(report)
}

async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
