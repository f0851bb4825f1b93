//! Winenet Simulator - several nodes sharing one in-memory broadcast medium
//!
//! Every node is told about every other node, submits its buffers, and the
//! run ends once each buffer has completed or aborted.

use bytes::Bytes;
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use winenet::io::Medium;
use winenet::{Delivery, DeliveryError, Node, PeerId};
use winenet_cli::{display_counters, display_summary, NodeReport, SimConfig};

#[derive(Parser, Debug)]
#[command(name = "winenet-sim")]
#[command(about = "Winenet multi-node simulator", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of nodes
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Buffers submitted by each node
    #[arg(short, long)]
    buffers: Option<usize>,

    /// Size of each buffer in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Frame loss probability (0.0 to 1.0)
    #[arg(long)]
    loss: Option<f64>,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Print an example configuration file and exit
    #[arg(long)]
    example_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SimConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            SimConfig::from_file(path)?
        }
        None => SimConfig::default(),
    };

    let sim = &mut config.simulation;
    if let Some(nodes) = args.nodes {
        sim.nodes = nodes;
    }
    if let Some(buffers) = args.buffers {
        sim.buffers_per_node = buffers;
    }
    if let Some(size) = args.buffer_size {
        sim.buffer_size = size;
    }
    if let Some(loss) = args.loss {
        sim.loss = loss;
    }
    if args.seed.is_some() {
        sim.seed = args.seed;
    }
    config.validate()?;
    Ok(config)
}

/// Recognizable content: node index in the first byte, buffer index after
fn make_buffer(node: usize, index: usize, size: usize) -> Bytes {
    (0..size)
        .map(|i| match i {
            0 => node as u8,
            _ => (index + i) as u8,
        })
        .collect::<Vec<u8>>()
        .into()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if args.example_config {
        print!("{}", SimConfig::example().to_toml()?);
        return Ok(());
    }

    let config = load_config(&args)?;
    let sim = &config.simulation;
    tracing::info!(
        "Winenet simulator starting: {} node(s), {} buffer(s) of {} bytes each, loss {}",
        sim.nodes,
        sim.buffers_per_node,
        sim.buffer_size,
        sim.loss
    );

    let medium = match sim.seed {
        Some(seed) => Medium::with_seed(seed),
        None => Medium::new(),
    };
    medium.set_loss(sim.loss);

    let ids: Vec<PeerId> = (1..=sim.nodes as u64).map(PeerId::new).collect();
    let mut nodes = Vec::with_capacity(ids.len());
    for id in &ids {
        let rng_seed = sim.seed.map(|seed| seed.wrapping_add(id.as_raw()));
        let node = Node::spawn(config.winenet.to_winenet(rng_seed), medium.attach(*id))?;
        nodes.push(node);
    }
    for node in &nodes {
        for peer in ids.iter().filter(|peer| **peer != node.id()) {
            node.peer_joined(*peer)?;
        }
    }

    let started = Instant::now();
    let mut deliveries: Vec<Vec<Delivery>> = Vec::with_capacity(nodes.len());
    for (n, node) in nodes.iter().enumerate() {
        let mut submitted = Vec::with_capacity(sim.buffers_per_node);
        for b in 0..sim.buffers_per_node {
            submitted.push(node.submit(make_buffer(n, b, sim.buffer_size))?);
        }
        deliveries.push(submitted);
    }

    let deadline = started + sim.deadline();
    let mut unresolved = 0;
    let mut reports = Vec::with_capacity(nodes.len());
    for (node, submitted) in nodes.iter().zip(deliveries) {
        let (mut completed, mut aborted) = (0, 0);
        for delivery in submitted {
            let id = delivery.id();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match delivery.wait_timeout(remaining) {
                Ok(outcome) if outcome.is_completed() => completed += 1,
                Ok(outcome) => {
                    tracing::warn!("Node {} buffer {} {}", node.id(), id, outcome);
                    aborted += 1;
                }
                Err(DeliveryError::Timeout) | Err(DeliveryError::NodeStopped) => {
                    tracing::error!("Node {} buffer {} unresolved", node.id(), id);
                    unresolved += 1;
                }
            }
        }
        reports.push((completed, aborted));
    }

    // Listeners hand the last buffer up right after acknowledging it
    std::thread::sleep(Duration::from_millis(50));
    let elapsed = started.elapsed();

    let reports: Vec<NodeReport> = nodes
        .iter()
        .zip(reports)
        .map(|(node, (completed, aborted))| {
            let buffers: Vec<(PeerId, Bytes)> = node.received().try_iter().collect();
            NodeReport {
                id: node.id(),
                snapshot: node.snapshot(),
                completed,
                aborted,
                received: buffers.len(),
                bytes_received: buffers.iter().map(|(_, b)| b.len() as u64).sum(),
            }
        })
        .collect();

    display_summary(&reports, &medium.stats(), elapsed);
    if args.verbose {
        for report in &reports {
            display_counters(report);
        }
    }

    for node in nodes {
        node.shutdown();
    }

    if unresolved > 0 {
        anyhow::bail!("{} buffer(s) unresolved after {:?}", unresolved, sim.deadline());
    }
    Ok(())
}
