//! Overlay Node CLI Application
//!
//! Runs a standalone overlay node over TCP.

use clap::{Parser, Subcommand};
use peer_overlay::network::{NetworkConfig, NetworkError, Node, NodeEvent, TcpTransport};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "overlay-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A peer-to-peer overlay network node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the overlay node
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Seed peers (comma-separated ip:port)
        #[arg(long)]
        seeds: Option<String>,

        /// Network identifier
        #[arg(short, long)]
        network: Option<String>,
    },

    /// Print the default configuration as JSON
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            println!("{}", NetworkConfig::default().to_json()?);
        }

        Commands::Start {
            config,
            host,
            port,
            seeds,
            network,
        } => {
            let mut node_config = match config {
                Some(path) => NetworkConfig::from_file(path)?,
                None => NetworkConfig::default(),
            };

            // Flags override the file
            if let Some(host) = host {
                node_config.host_ip = host;
            }
            if let Some(port) = port {
                node_config.port = port;
            }
            if let Some(seeds) = seeds {
                node_config.seed_peers = seeds
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(network) = network {
                node_config.network_identifier = network;
            }
            node_config.validate()?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(node_config))?;
        }
    }

    Ok(())
}

async fn run_node(config: NetworkConfig) -> Result<(), NetworkError> {
    println!(
        "🌐 Starting overlay node on {}:{} (network {})...",
        config.host_ip, config.port, config.network_identifier
    );

    let transport = Arc::new(TcpTransport::new(config.host_ip, config.port));
    let (node, mut events) = Node::start(config, transport).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down node...");
                node.shutdown().await?;
                break;
            }
        }
    }

    Ok(())
}

fn handle_event(event: NodeEvent) {
    match event {
        NodeEvent::PeerDiscovered(peer) => log::info!("Discovered peer {}", peer.peer_id()),
        NodeEvent::PeerConnected(peer) => {
            log::info!("Peer {} connected ({:?}, height {})", peer.peer_id(), peer.connection_kind, peer.height)
        }
        NodeEvent::PeerClosed { peer_info, code, reason } => {
            log::info!("Peer {} closed ({}): {}", peer_info.peer_id(), code, reason)
        }
        NodeEvent::PeerBanned(peer) => log::warn!("Peer {} banned", peer.peer_id()),
        NodeEvent::PeerUnbanned(peer) => log::info!("Peer {} unbanned", peer.peer_id()),
        NodeEvent::ConnectFailed { peer_info, error } => {
            log::debug!("Could not connect to {}: {}", peer_info.peer_id(), error)
        }
        NodeEvent::InboundSocketError { remote_ip, error } => {
            log::debug!("Inbound session from {} failed: {}", remote_ip, error)
        }
        NodeEvent::Message { peer_id, event, .. } => log::info!("Event {} from {}", event, peer_id),
        NodeEvent::Legacy { peer_id, event } => log::info!("Legacy {} from {}", event.event_name(), peer_id),
        NodeEvent::Request(request) => {
            // No application procedures are served by the standalone node
            let reason = format!("unknown procedure {}", request.procedure);
            if let Err(e) = request.respond(Err(reason)) {
                log::debug!("Could not answer request: {}", e);
            }
        }
    }
}
