//! Peer Overlay: a peer-to-peer overlay network manager in Rust
//!
//! This crate maintains a node's view of a P2P network featuring:
//! - New and tried peer lists with salted bucket placement
//! - Outbound connection top-up and peer-list discovery
//! - Balanced broadcast and random request fan-out
//! - Ping/pong latency tracking with unresponsive-peer detection
//! - Nonce-based collapsing of duplicate sessions
//! - Temporary bans and a permanent blacklist
//! - Compatibility with peers on the older protocol
//!
//! Application payloads are opaque JSON; the overlay only routes them.
//!
//! # Example
//!
//! ```rust,no_run
//! use peer_overlay::network::{NetworkConfig, Node, NodeEvent, TcpTransport};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), peer_overlay::network::NetworkError> {
//! let config = NetworkConfig {
//!     seed_peers: vec!["10.0.0.1:5000".to_string()],
//!     ..Default::default()
//! };
//! let transport = Arc::new(TcpTransport::new(config.host_ip, config.port));
//! let (node, mut events) = Node::start(config, transport).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::PeerConnected(peer) = event {
//!         println!("Connected to {}", peer.peer_id());
//!         node.emit("postBlock", serde_json::json!({ "height": 1 })).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod network;

// Re-export commonly used types
pub use network::{NetworkConfig, NetworkError, Node, NodeEvent, NodeHandle, PeerId, PeerInfo};
