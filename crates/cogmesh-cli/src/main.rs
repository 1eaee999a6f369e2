//! Cogmesh command-line interface
//!
//! Drives the bundled discrete-event simulator: build a topology, let the
//! cluster protocol settle, inject traffic, and report the run.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cogmesh_core::frame::NodeId;
use cogmesh_core::sim::{Link, ScenarioConfig, Simulator, Topology};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cogmesh")]
#[command(author, version, about = "Cognitive mesh scenario runner", long_about = None)]
struct Cli {
    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TopologyKind {
    /// A chain: 1-2-3-...
    Line,
    /// Every node hears every other.
    Full,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and print the summary
    Run {
        /// Number of nodes
        #[arg(short, long, default_value = "8")]
        nodes: usize,

        /// Topology shape
        #[arg(long, value_enum, default_value = "full")]
        topology: TopologyKind,

        /// Simulated run time in milliseconds
        #[arg(long, default_value = "5000")]
        duration_ms: u64,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Inject one payload per node toward the last node
        #[arg(long)]
        traffic: bool,

        /// Print the summary as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the generated topology as JSON
    Topology {
        /// Number of nodes
        #[arg(short, long, default_value = "8")]
        nodes: usize,

        /// Topology shape
        #[arg(long, value_enum, default_value = "full")]
        topology: TopologyKind,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    match cli.command {
        Commands::Run {
            nodes,
            topology,
            duration_ms,
            seed,
            traffic,
            json,
        } => run_scenario(nodes, topology, duration_ms, seed, traffic, json),
        Commands::Topology { nodes, topology } => print_topology(nodes, topology),
    }
}

fn addresses(count: usize) -> Vec<NodeId> {
    (1..=count as u32).map(NodeId::from_u32).collect()
}

fn build_topology(kind: TopologyKind, ids: &[NodeId]) -> Topology {
    match kind {
        TopologyKind::Line => Topology::line(ids, Link::default()),
        TopologyKind::Full => Topology::fully_connected(ids, Link::default()),
    }
}

fn run_scenario(
    nodes: usize,
    topology: TopologyKind,
    duration_ms: u64,
    seed: u64,
    traffic: bool,
    json: bool,
) -> Result<()> {
    if nodes < 2 {
        bail!("a scenario needs at least 2 nodes");
    }
    let ids = addresses(nodes);
    let config = ScenarioConfig::default()
        .with_node_count(nodes)
        .with_seed(seed);
    let mut sim = Simulator::new(config, build_topology(topology, &ids));

    if traffic {
        // One payload per node toward the last node, spread over the run.
        let sink = *ids.last().expect("at least two nodes");
        let spacing = duration_ms / (nodes as u64 + 1);
        for (index, &from) in ids.iter().enumerate() {
            if from == sink {
                continue;
            }
            let at = Duration::from_millis(spacing * (index as u64 + 1));
            let payload = format!("payload from {from}").into_bytes();
            sim.send_at(at, from, sink, 0x0800, payload);
        }
    }

    info!(nodes, duration_ms, seed, "running scenario");
    sim.run_for(Duration::from_millis(duration_ms));
    let summary = sim.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("=== Cogmesh run summary ===");
    println!("Simulated time: {:.3}s", summary.end_time_secs);
    println!();
    println!("Traffic:");
    println!("  Injected:  {}", summary.counters.packets_injected);
    println!("  Delivered: {}", summary.counters.packets_delivered);
    println!(
        "  Delivery:  {:.1}%",
        summary.counters.delivery_ratio() * 100.0
    );
    println!(
        "  Mean latency: {:.3} ms",
        summary.counters.mean_latency_secs() * 1000.0
    );
    println!();
    println!("Overhead:");
    println!("  Control bytes: {}", summary.counters.control_bytes);
    println!("  Routing bytes: {}", summary.counters.routing_bytes);
    println!("  Queue drops:   {}", summary.counters.queue_drops);
    println!("  PHY refusals:  {}", summary.counters.phy_refusals);
    println!();
    println!("Nodes:");
    for node in &summary.nodes {
        println!(
            "  {}  {:<12} neighbors={} routes={} delivered={} energy={:.2}J",
            node.address,
            node.role,
            node.neighbors,
            node.routes,
            node.delivered,
            node.remaining_energy
        );
    }
    Ok(())
}

fn print_topology(nodes: usize, kind: TopologyKind) -> Result<()> {
    let ids = addresses(nodes);
    let topology = build_topology(kind, &ids);
    let adjacency: Vec<(String, Vec<String>)> = ids
        .iter()
        .map(|id| {
            let peers = topology
                .neighbors(*id)
                .map(|(peer, _)| peer.to_string())
                .collect();
            (id.to_string(), peers)
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&adjacency)?);
    Ok(())
}
