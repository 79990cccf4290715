//! P2P overlay networking
//!
//! Maintains the node's view of the network and its live connections.
//!
//! # Features
//! - Bucketed new/tried peer lists keyed by a per-process secret
//! - Weighted peer selection for dialing, requests and broadcast
//! - Connections with heartbeat, RPC and legacy protocol support
//! - Nonce-based deduplication of sessions
//! - Temporary bans with a permanent blacklist
//! - Periodic connection top-up and peer discovery

pub mod ban;
pub mod config;
pub mod connection;
pub mod connections_table;
pub mod error;
pub mod handshake;
pub mod message;
pub mod node;
pub mod peer_info;
pub mod peer_list;
pub mod populator;
pub mod scheduler;
pub mod selection;
pub mod server;
pub mod transport;

pub use ban::{BanManager, BannedPeer, DEFAULT_BAN_DURATION};
pub use config::NetworkConfig;
pub use connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionSettings, ConnectionState, Direction,
    IncomingRequest, LegacyHandler, RpcCall,
};
pub use connections_table::ConnectionsTable;
pub use error::{ConnectionError, NetworkError};
pub use message::{LegacyEvent, Message, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use node::{Node, NodeEvent, NodeHandle, NodeStatus, PeerFilter};
pub use peer_info::{ConnectionKind, LegacyPeerInfo, PeerId, PeerInfo};
pub use peer_list::{
    EvictionPolicy, NewPeer, NewPeers, PeerBook, PeerList, PeerListConfig, PeerRecord, TriedPeer, TriedPeers,
};
pub use populator::Populator;
pub use selection::{select_for_connection, select_for_request, select_for_send};
pub use server::{MessageCodec, TcpTransport};
pub use transport::{MemoryNetwork, MemoryTransport, Socket, Transport};
