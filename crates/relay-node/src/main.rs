//! relay-node binary: one process per rank.
//!
//! ```bash
//! # Print the layer assignment for 12 layers over 3 ranks
//! relay-node plan 12 3
//!
//! # On every machine: rendezvous, barrier, leave
//! NODE_NAME=mini-red relay-node check --config cluster.json
//!
//! # On every machine: one pipelined forward pass
//! NODE_NAME=mini-red RUST_LOG=info relay-node run --config cluster.json --tokens 5,9,2
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_net::{GroupConfig, ProcessGroup};
use relay_pipeline::source::ModelSource;
use relay_pipeline::tensor::parse_device;
use relay_pipeline::{greedy_next_token, plan_stages, run_rank, SyntheticModel};
use relay_types::config::{ClusterConfig, ModelConfig, NodeConfig, PipelineConfig, NODE_NAME_ENV};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "relay-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "layer-relay: pipeline-parallel inference across a fixed set of ranks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print which rank runs which layers, as JSON.
    Plan {
        total_layers: u32,
        world_size: u32,
        #[arg(long, default_value_t = 0)]
        hidden_size: usize,
        #[arg(long, default_value = "model")]
        model_name: String,
    },

    /// Join the process group, pass one barrier and leave.
    Check(NodeArgs),

    /// Run one forward pass through the pipeline.
    Run {
        #[command(flatten)]
        node: NodeArgs,
        /// Comma-separated token ids of the single input sequence.
        #[arg(long, value_delimiter = ',', required = true)]
        tokens: Vec<u32>,
    },
}

/// Which node this process is, and how to reach rank 0.
#[derive(Args)]
struct NodeArgs {
    /// Cluster configuration file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Node entry to use; defaults to the `NODE_NAME` environment variable.
    #[arg(long)]
    node: Option<String>,
    #[arg(long)]
    rank: Option<u32>,
    #[arg(long)]
    world_size: Option<u32>,
    #[arg(long)]
    master_addr: Option<String>,
    #[arg(long)]
    master_port: Option<u16>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=relay_net=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Plan { total_layers, world_size, hidden_size, model_name } => {
            let plan = plan_stages(&model_name, total_layers, hidden_size, world_size)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Command::Check(args)           => run_check(args).await,
        Command::Run { node, tokens }  => run_forward(node, tokens).await,
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

struct Resolved {
    node: NodeConfig,
    model: ModelConfig,
    pipeline: PipelineConfig,
}

/// Config file entry (if any) with command-line overrides applied.
fn resolve(args: NodeArgs) -> Result<Resolved> {
    let cluster = match &args.config {
        Some(path) => ClusterConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClusterConfig::default(),
    };

    let mut node = match (&args.node, cluster.nodes.is_empty()) {
        (Some(name), _) => cluster.node_named(name)?.clone(),
        (None, false) => cluster.node_from_env()?.clone(),
        (None, true) => {
            let name = std::env::var(NODE_NAME_ENV).unwrap_or_else(|_| "local".into());
            NodeConfig::new(name, 0, 1)
        }
    };

    if let Some(rank) = args.rank {
        node.rank = rank;
    }
    if let Some(world_size) = args.world_size {
        node.world_size = world_size;
    }
    if let Some(addr) = args.master_addr {
        node.master_addr = addr;
    }
    if let Some(port) = args.master_port {
        node.master_port = port;
    }
    node.topology()?;

    Ok(Resolved {
        node,
        model: cluster.model,
        pipeline: cluster.pipeline,
    })
}

// ── Check mode ────────────────────────────────────────────────────────────────

async fn run_check(args: NodeArgs) -> Result<()> {
    let Resolved { node, pipeline, .. } = resolve(args)?;
    let mut group = ProcessGroup::new(GroupConfig::from_node(&node, &pipeline)?);
    info!(
        node = %node.name,
        rank = node.rank,
        world_size = node.world_size,
        master = %format!("{}:{}", node.master_addr, node.master_port),
        "joining process group"
    );

    let outcome = rendezvous_and_barrier(&mut group).await;
    group.teardown().await;
    outcome?;

    println!(
        "rank {}/{} connected{}",
        node.rank,
        node.world_size,
        if node.rank == 0 { " (master)" } else { "" }
    );
    Ok(())
}

async fn rendezvous_and_barrier(group: &mut ProcessGroup) -> relay_net::Result<()> {
    group.initialize().await?;
    info!(
        is_master = group.is_master(),
        run_id = group.run_id().unwrap_or_default(),
        "rendezvous complete"
    );
    group.barrier().await?;
    info!("barrier passed");
    Ok(())
}

// ── Run mode ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RunReport {
    node: String,
    rank: u32,
    world_size: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    /// Present on the last rank only.
    logits_shape: Option<Vec<usize>>,
    next_token: Option<u32>,
}

async fn run_forward(args: NodeArgs, tokens: Vec<u32>) -> Result<()> {
    let Resolved { node, model, pipeline } = resolve(args)?;
    let manifest = model.resolve_manifest()?;
    let source = SyntheticModel::from_config(&model)?;
    let device = parse_device(&model.device)?;

    let config = source.config();
    let plan = plan_stages(
        &model.model_name,
        manifest.layer_count(&config)?,
        manifest.hidden_size(&config)?,
        node.world_size,
    )?;
    if let Some(stage) = plan.stage(node.rank) {
        info!(
            model = %plan.model_name,
            total_layers = plan.total_layers,
            rank = stage.rank,
            layers = %stage.layer_range,
            embedding = stage.includes_embedding,
            head = stage.includes_output_head,
            "stage assignment"
        );
    }

    let started_at = Utc::now();
    let group_config = GroupConfig::from_node(&node, &pipeline)?;
    let logits = run_rank(group_config, &source, &manifest, &[tokens], model.dtype, &device)
        .await
        .with_context(|| format!("rank {} failed", node.rank))?;
    let finished_at = Utc::now();

    let next_token = match &logits {
        Some(logits) => Some(greedy_next_token(logits)?),
        None => None,
    };
    if next_token.is_none() && node.rank + 1 == node.world_size {
        warn!("last rank produced no logits");
    }

    let report = RunReport {
        node: node.name,
        rank: node.rank,
        world_size: node.world_size,
        started_at,
        finished_at,
        logits_shape: logits.as_ref().map(|t| t.dims().to_vec()),
        next_token,
    };
    info!(
        elapsed_ms = (finished_at - started_at).num_milliseconds(),
        "forward pass complete"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
