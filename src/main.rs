//! arbor - Tree-shaped compute overlay
//!
//! Nodes join a tree, keep routes to every other node, and share out ranges
//! of values to check among themselves.

mod config;
mod console;
mod network;
mod overlay;
mod protocol;
mod worker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{Driver, NetworkConfig, Server};
use overlay::work::{CapacityPolicy, Dispatcher};
use overlay::Node;
use protocol::Id;
use worker::{ExecutorConfig, FileSink, Registry, WorkExecutor};

/// arbor - distributed range checking over a tree overlay
#[derive(Parser)]
#[command(name = "arbor")]
#[command(version = "0.1.0")]
#[command(about = "Run a node of a tree-shaped compute overlay", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new overlay as its root
    Root {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Join an existing overlay below a mother node
    Join {
        /// Address of the mother, as host:port
        #[arg(short, long)]
        mother: String,

        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Root { listen } => {
            if let Some(listen) = listen {
                config.node.listen = listen;
            }
            config.node.mother = None;
            run_node(config).await?;
        }
        Commands::Join { mother, listen } => {
            if let Some(listen) = listen {
                config.node.listen = listen;
            }
            config.node.mother = Some(mother);
            run_node(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Bind, wire up the executor and run the node loop until it stops
async fn run_node(config: Config) -> anyhow::Result<()> {
    let net_config = NetworkConfig {
        listen: config.node.listen,
        connect_timeout_ms: config.network.connect_timeout_ms,
        read_buffer_size: config.network.read_buffer_size,
    };
    let server = Server::bind(net_config.clone()).await?;
    let me = Id::new(match config.node.advertise {
        Some(addr) => addr,
        None => server.local_addr()?,
    });

    let mother = match &config.node.mother {
        Some(host) => {
            let addr = network::resolve_host(host)
                .await
                .with_context(|| format!("Cannot resolve mother {}", host))?;
            Some(Id::new(addr))
        }
        None => None,
    };

    std::fs::create_dir_all(&config.results.directory).with_context(|| {
        format!(
            "Cannot create results directory {}",
            config.results.directory.display()
        )
    })?;

    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let executor = WorkExecutor::new(
        ExecutorConfig {
            pool_size: config.worker.pool_size,
            deadline: config.worker.deadline(),
        },
        Arc::new(Registry::new()),
        outcome_tx,
    );
    let dispatcher = Dispatcher::new(
        CapacityPolicy::new(config.worker.max_in_flight),
        executor,
        Box::new(FileSink::new(config.results.directory.clone())),
    );
    let node = Node::new(me, dispatcher);

    tracing::info!(
        "Starting node '{}' as {} ({})",
        config.general.name,
        me,
        match mother {
            Some(mother) => format!("daughter of {}", mother),
            None => "root".to_string(),
        }
    );
    println!("Commands:");
    println!("  start locator=<L> name=<N> from=<inf> to=<sup> [output=<path>]");
    println!("  disconnect");
    println!("  routes");
    println!(
        "Built-in checkers (locator=builtin): {}",
        Registry::builtin_names().join(", ")
    );

    let driver = Driver::new(node, net_config, outcome_rx);
    console::spawn(driver.events()).context("Failed to start the console")?;
    driver.run(server, mother).await
}
