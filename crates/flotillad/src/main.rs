//! flotillad — the Flotilla daemon.
//!
//! Two modes:
//!
//! - **manager** — runs the store, Raft, and the control plane; the
//!   first manager bootstraps a cluster, later ones join it
//! - **worker** — runs the agent against one or more managers
//!
//! ```text
//! flotillad manager --listen 0.0.0.0:2377 --state-dir /var/lib/flotilla
//! flotillad manager --listen 0.0.0.0:2377 --join 10.0.0.1:2377 --state-dir /var/lib/flotilla
//! flotillad worker --manager 10.0.0.1:2377 --node-id worker-1
//! ```

mod dev;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use flotilla_agent::{Agent, AgentConfig};
use flotilla_manager::{Manager, ManagerConfig};

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla cluster orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a manager node.
    Manager {
        /// gRPC listen address.
        #[arg(long, default_value = "0.0.0.0:2377")]
        listen: String,

        /// Address other nodes use to reach this manager; defaults to
        /// the listen address.
        #[arg(long)]
        advertise: Option<String>,

        /// State directory (raft log, certificates).
        #[arg(long, default_value = "/var/lib/flotilla")]
        state_dir: PathBuf,

        /// Existing manager to join instead of bootstrapping.
        #[arg(long)]
        join: Option<String>,

        /// Cluster name used when bootstrapping.
        #[arg(long, default_value = "default")]
        cluster_name: String,

        /// Stable node id; generated when omitted.
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Run a worker node.
    Worker {
        /// Manager addresses to connect to.
        #[arg(long, required = true)]
        manager: Vec<String>,

        /// This node's id (must match its certificate CN).
        #[arg(long)]
        node_id: String,

        /// State directory for local credentials.
        #[arg(long, default_value = "/var/lib/flotilla")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Command::Manager {
            listen,
            advertise,
            state_dir,
            join,
            cluster_name,
            node_id,
        } => {
            let mut config = ManagerConfig::new(listen, state_dir);
            if let Some(advertise) = advertise {
                config.advertise_addr = advertise;
            }
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            config.join_addr = join;
            config.cluster_name = cluster_name;

            let manager = Manager::new(config).await?;
            manager.run(shutdown_rx).await?;
        }
        Command::Worker {
            manager,
            node_id,
            state_dir,
        } => {
            info!(%node_id, state_dir = %state_dir.display(), "starting worker");
            let config = AgentConfig::new(node_id, manager);
            let agent = Agent::new(config, Arc::new(dev::DevExecutor::default()));
            agent.run(shutdown_rx).await?;
        }
    }

    Ok(())
}
