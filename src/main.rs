use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swarm_infer::inference::executor::MockExecutor;
use swarm_infer::network::transport::InMemoryHub;
use swarm_infer::observability::init_logging;
use swarm_infer::{NetworkManager, NodeConfig, NodeId, NodeType};

#[derive(Parser)]
#[command(name = "swarm-infer", version, about = "P2P distributed AI inference node")]
struct Cli {
    /// Configuration file (defaults to ~/.swarm-infer/node.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for JSON log files (console only when unset)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a node configuration
    Init {
        /// Node role: full, compute, coordinator, or gateway
        #[arg(long, default_value = "full")]
        node_type: String,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Print the configured node identity and defaults
    Status,

    /// Run a local multi-node mesh and one inference through it
    Simulate {
        /// Number of nodes in the mesh
        #[arg(long, default_value_t = 4)]
        nodes: usize,

        /// Model id the mesh hosts
        #[arg(long, default_value = "sentiment-v2")]
        model: String,

        /// JSON input for the inference request
        #[arg(long, default_value = r#"{"text": "hello"}"#)]
        input: String,
    },
}

fn parse_node_type(raw: &str) -> anyhow::Result<NodeType> {
    match raw {
        "full" => Ok(NodeType::Full),
        "compute" => Ok(NodeType::Compute),
        "coordinator" => Ok(NodeType::Coordinator),
        "gateway" => Ok(NodeType::Gateway),
        other => bail!("unknown node type '{other}'"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref())?;

    let config_path = match cli.config {
        Some(path) => path,
        None => NodeConfig::default_path()?,
    };

    match cli.command {
        Command::Init { node_type, force } => {
            if config_path.exists() && !force {
                bail!(
                    "configuration already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            let config = NodeConfig::generate(parse_node_type(&node_type)?);
            config.save(&config_path)?;
            println!("node {} initialized at {}", config.node_id, config_path.display());
        }

        Command::Status => {
            let config = NodeConfig::load(&config_path)
                .with_context(|| format!("no configuration at {}", config_path.display()))?;
            println!("{}", toml::to_string_pretty(&config)?);
        }

        Command::Simulate {
            nodes,
            model,
            input,
        } => {
            if nodes < 2 {
                bail!("simulation needs at least 2 nodes");
            }
            let input: Value =
                serde_json::from_str(&input).context("input must be valid JSON")?;
            simulate(nodes, &model, input).await?;
        }
    }

    Ok(())
}

/// Spin up an in-process mesh: node 0 coordinates, the rest host the model.
async fn simulate(node_count: usize, model: &str, input: Value) -> anyhow::Result<()> {
    let hub = InMemoryHub::new();
    let mut managers = Vec::with_capacity(node_count);

    for index in 0..node_count {
        let node_id = NodeId::new(format!("sim-{index}"));
        let mut config = NodeConfig::named(node_id.clone(), NodeType::Full);
        if index > 0 {
            config.models.insert(model.to_string());
        }

        let (transport, inbound) = hub.register(node_id).await;
        managers.push(NetworkManager::new(
            config,
            Arc::new(transport),
            inbound,
            Arc::new(MockExecutor::new()),
        ));
    }

    let seed = NodeId::new("sim-0");
    managers[0].start_network(&[]).await?;
    for manager in &managers[1..] {
        manager.start_network(&[seed.clone()]).await?;
    }

    // Let announcements settle before asking for work.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let report = managers[0]
        .request_inference(model, input, 0, Duration::from_secs(10))
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let status = managers[0].get_network_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    for manager in &managers {
        manager.stop_network().await;
    }

    Ok(())
}
