//! Subcommands and their printable results.

use std::fmt;

use clap::{Args, Subcommand};

use corelib::{NodeId, NodeSettings};
use messaging::LinkerStats;
use transaction::{Simulation, SimulationConfig};

use crate::demo::{root_config, Fanout, Roster, SpawnKids};
use crate::runtime;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the demo transaction on the deterministic simulator.
    Simulate(SimulateArgs),
    /// Run the demo transaction with one tokio task per node.
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Nodes the root spawns.
    #[arg(long, default_value_t = 4)]
    pub kids: usize,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    #[arg(long, default_value_t = 0.0)]
    pub drop_rate: f64,
    #[arg(long, default_value_t = 0.0)]
    pub duplicate_rate: f64,
    #[arg(long, default_value_t = 5)]
    pub latency_ms: u64,
    #[arg(long, default_value_t = 0)]
    pub jitter_ms: u64,
    /// Give up after this much simulated time.
    #[arg(long, default_value_t = 60_000)]
    pub max_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(long, default_value_t = 4)]
    pub kids: usize,
    /// Housekeeping period of every node.
    #[arg(long, default_value_t = 5)]
    pub tick_ms: u64,
    /// Probability that the in-process transport loses a frame.
    #[arg(long, default_value_t = 0.0)]
    pub drop_rate: f64,
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

/// Outcome of one demo run.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub mode: &'static str,
    pub root: NodeId,
    pub kids: Vec<NodeId>,
    /// Nodes that learned the root is their parent.
    pub adopted: usize,
    /// Every node went quiet before the deadline.
    pub settled: bool,
    pub elapsed_ms: u64,
    pub stats: LinkerStats,
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mode:       {}", self.mode)?;
        writeln!(f, "root:       {}", self.root)?;
        writeln!(f, "kids:       {} ({} adopted)", self.kids.len(), self.adopted)?;
        writeln!(
            f,
            "settled:    {} after {} ms",
            if self.settled { "yes" } else { "no" },
            self.elapsed_ms
        )?;
        write!(
            f,
            "messaging:  delivered={} retransmissions={} duplicates={} reorders={} violations={} acks={}",
            self.stats.delivered,
            self.stats.retransmissions,
            self.stats.duplicates,
            self.stats.reorders,
            self.stats.protocol_violations,
            self.stats.acknowledgements_sent
        )
    }
}

impl Command {
    pub fn execute(self, settings: NodeSettings) -> anyhow::Result<CommandResult> {
        match self {
            Command::Simulate(args) => simulate(&args, settings),
            Command::Run(args) => runtime::run(&args, settings),
        }
    }
}

pub fn simulate(args: &SimulateArgs, settings: NodeSettings) -> anyhow::Result<CommandResult> {
    let config = SimulationConfig {
        seed: args.seed,
        drop_rate: args.drop_rate,
        duplicate_rate: args.duplicate_rate,
        latency_ms: args.latency_ms,
        jitter_ms: args.jitter_ms,
        ..SimulationConfig::default()
    };
    let mut sim: Simulation<Fanout> = Simulation::new(config, |_| Roster::default());
    let root = sim.add_node(root_config(settings))?;
    sim.start_transaction(root, SpawnKids::new(args.kids))?;

    let settled = sim.run_until(args.max_ms, Simulation::is_quiescent);
    Ok(CommandResult {
        mode: "simulate",
        root,
        kids: sim.node(root).map(|n| n.state().kids.clone()).unwrap_or_default(),
        adopted: sim.nodes().filter(|n| n.state().parent == Some(root)).count(),
        settled,
        elapsed_ms: sim.now_ms(),
        stats: sum_stats(sim.nodes().map(|n| n.linker().stats())),
    })
}

pub(crate) fn sum_stats(stats: impl Iterator<Item = LinkerStats>) -> LinkerStats {
    stats.fold(LinkerStats::default(), |mut total, s| {
        total.delivered += s.delivered;
        total.retransmissions += s.retransmissions;
        total.duplicates += s.duplicates;
        total.reorders += s.reorders;
        total.protocol_violations += s.protocol_violations;
        total.acknowledgements_sent += s.acknowledgements_sent;
        total
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            kids: 3,
            seed: 4,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            latency_ms: 5,
            jitter_ms: 0,
            max_ms: 10_000,
        }
    }

    #[test]
    fn test_simulate_adopts_every_kid() {
        let result = simulate(&args(), NodeSettings::default()).unwrap();
        assert!(result.settled);
        assert_eq!(result.kids.len(), 3);
        assert_eq!(result.adopted, 3);
        assert_eq!(result.stats.protocol_violations, 0);
    }

    #[test]
    fn test_simulate_is_reproducible_under_loss() {
        let lossy = SimulateArgs {
            drop_rate: 0.25,
            duplicate_rate: 0.1,
            jitter_ms: 8,
            max_ms: 120_000,
            ..args()
        };
        let first = simulate(&lossy, NodeSettings::default()).unwrap();
        let second = simulate(&lossy, NodeSettings::default()).unwrap();
        assert!(first.settled);
        assert_eq!(first.adopted, 3);
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.elapsed_ms, second.elapsed_ms);
    }

    #[test]
    fn test_result_display_lists_stats() {
        let result = simulate(&args(), NodeSettings::default()).unwrap();
        let text = result.to_string();
        assert!(text.contains("3 adopted"));
        assert!(text.contains("violations=0"));
    }
}
