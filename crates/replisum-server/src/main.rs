//! Replisum Server - replicated accumulator node
//!
//! ```text
//! replisum-server --id 2000 --client-bind 127.0.0.1:2000
//! replisum-server --id 2004 --client-bind 127.0.0.1:2004 --primary 2000@127.0.0.1:2002
//! ```

use clap::Parser;
use replisum_core::{NodeId, PeerConfig};
use replisum_server::ReplisumServer;
use replisum_server::config::{Overrides, ServerConfig, parse_peer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Replisum Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "replisum-server")]
#[command(about = "Replicated accumulator node", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Node identifier (higher wins elections)
    #[arg(long)]
    id: Option<u32>,

    /// Replication endpoint (default: client port + 2)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Client endpoint
    #[arg(long)]
    client_bind: Option<SocketAddr>,

    /// Primary to join, as id@host:port (omit to start as primary)
    #[arg(long, value_parser = parse_peer)]
    primary: Option<PeerConfig>,

    /// Seed peer, as id@host:port
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerConfig>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "replisum_server=debug,replisum_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "replisum_server=info,replisum_core=info".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.apply_overrides(Overrides {
        id: args.id.map(NodeId),
        bind_addr: args.bind,
        client_addr: args.client_bind,
        primary: args.primary,
        peers: args.peers,
    });

    let server = ReplisumServer::start(&config).await?;
    tracing::info!(
        "Node {} up as {:?}, Ctrl-C to stop",
        server.node().node_id(),
        server.node().role()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    let stats = server.node().stats();
    server.shutdown().await?;
    tracing::info!(
        "Final stats: {} updates replicated, {} elections won, {} step-downs",
        stats.updates_replicated,
        stats.elections_won,
        stats.step_downs
    );
    Ok(())
}
