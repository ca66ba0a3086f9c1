// src/main.rs
//! Agora node binary.
//!
//! Runs a single environment (`env`), a multi-environment node with local
//! slave environments (`node`), or a self-contained demo simulation
//! (`sim`). The `env` and `node` modes block until their manager receives a
//! `stop` call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use agora::env::{Env, EnvManager};
use agora::observability::{init_metrics, init_tracing};
use agora::{
    EnvAddr, EnvOptions, Environment, MultiEnvironment, NodeConfig, Simulation, StepOrder,
};

#[derive(Parser)]
#[command(name = "agora", version, about = "Distributed multi-agent environments and simulations")]
struct Cli {
    /// Path to a configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a single environment with a manager until stopped
    Env(EnvArgs),

    /// Serve a multi-environment node with local slave environments
    Node(NodeArgs),

    /// Run a local demo simulation and exit
    Sim(SimArgs),
}

#[derive(Args)]
struct EnvArgs {
    /// Address to serve on, e.g. tcp://127.0.0.1:5556
    #[arg(long)]
    addr: String,

    /// Environment name shown in logs
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct NodeArgs {
    /// Address of the node's master environment
    #[arg(long)]
    addr: String,

    /// Number of slave environments to spawn
    #[arg(long, default_value_t = 2)]
    slaves: usize,

    /// First port for the slave environments; consecutive ports follow.
    /// Defaults to the master port plus one.
    #[arg(long)]
    slave_base_port: Option<u16>,

    /// Seconds to wait for the slaves to become ready
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,

    /// Node name shown in logs
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct SimArgs {
    /// Number of agents to spawn
    #[arg(long, default_value_t = 10)]
    agents: usize,

    /// Number of steps to run
    #[arg(long, default_value_t = 10)]
    steps: usize,

    /// Random connections per agent
    #[arg(long, default_value_t = 3)]
    connections: usize,

    /// Trigger agents concurrently instead of sequentially
    #[arg(long)]
    concurrent: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let config = NodeConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_metrics(config.metrics.listen.as_deref())?;

    match cli.command {
        Commands::Env(args) => run_env(args, config).await,
        Commands::Node(args) => run_node(args, config).await,
        Commands::Sim(args) => run_sim(args, config).await,
    }
}

fn env_options(name: Option<String>, config: &NodeConfig) -> EnvOptions {
    EnvOptions {
        name,
        rpc: config.rpc_client(),
        ..EnvOptions::default()
    }
}

/// Serve one slave environment until its manager receives `stop`
async fn run_env(args: EnvArgs, config: NodeConfig) -> Result<()> {
    let addr: EnvAddr = args.addr.parse()?;
    let env = Environment::create(addr, env_options(args.name, &config)).await?;
    EnvManager::attach(&env);

    info!(addr = %env.addr(), "environment up, waiting for stop");
    env.wait_stopped().await;
    env.destroy().await?;
    info!("environment shut down");
    Ok(())
}

/// Serve a multi-environment node until its manager receives `stop`
async fn run_node(args: NodeArgs, config: NodeConfig) -> Result<()> {
    let addr: EnvAddr = args.addr.parse()?;
    let base_port = args.slave_base_port.unwrap_or(addr.port + 1);
    let slave_addrs: Vec<EnvAddr> = (0..args.slaves)
        .map(|i| EnvAddr::new(addr.host.clone(), base_port + i as u16))
        .collect();

    let menv = MultiEnvironment::create(addr, env_options(args.name, &config)).await?;
    menv.spawn_slaves(&slave_addrs).await?;

    let ready = menv
        .wait_slaves(Duration::from_secs(args.wait_secs), true)
        .await?;
    if !ready {
        menv.destroy().await?;
        bail!("slaves did not become ready in {}s", args.wait_secs);
    }
    menv.set_host_managers().await?;

    info!(addr = %menv.env().addr(), slaves = args.slaves, "node up, waiting for stop");
    menv.wait_stopped().await;
    menv.destroy().await?;
    info!("node shut down");
    Ok(())
}

/// Run a local simulation with built-in number agents
async fn run_sim(args: SimArgs, config: NodeConfig) -> Result<()> {
    let addr = EnvAddr::new("127.0.0.1", 0);
    let env = Environment::create(addr, env_options(Some("sim".to_string()), &config)).await?;

    for i in 0..args.agents {
        env.spawn("number", &json!({ "name": format!("number-{}", i) }))?;
    }
    env.create_random_connections(args.connections).await?;

    let env_dyn: Arc<dyn Env> = env.clone();
    let mut sim = Simulation::new(env_dyn).with_order(StepOrder::Alphabetical);
    if args.concurrent {
        sim.async_steps(args.steps).await?;
    } else {
        sim.steps(args.steps).await?;
    }

    let published = env.get_artifacts(None).len();
    info!(
        agents = args.agents,
        steps = args.steps,
        published, "simulation finished"
    );
    println!(
        "{} agents, {} steps, {} artifacts published",
        args.agents, args.steps, published
    );
    sim.close().await?;
    Ok(())
}
