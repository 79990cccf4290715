//! Error types for the overlay network
//!
//! Structural errors (bad arguments, full buckets) are returned directly to
//! the caller. Transport faults are carried as [`ConnectionError`] values
//! inside connection events and never cross the orchestrator boundary as a
//! panic or an early return from the event loop.

use crate::network::peer_info::PeerId;
use thiserror::Error;

/// Errors produced by the overlay core
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Bucket {bucket_id} is full")]
    Capacity { bucket_id: usize },
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Peer {0} is banned")]
    Banned(PeerId),
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("No connected peers available")]
    NoPeersAvailable,
    #[error("Remote procedure failed: {0}")]
    Rpc(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Node is not running")]
    NotRunning,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetworkError {
    pub fn validation(msg: impl Into<String>) -> Self {
        NetworkError::Validation(msg.into())
    }
}

/// Transport-level failures of a single connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Handshake acknowledgement timed out")]
    AckTimeout,
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Connection reset by peer")]
    Reset,
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Peer is on a different network: {0}")]
    IncompatibleNetwork(String),
    #[error("Peer did not answer ping")]
    PongTimeout,
    #[error("Connection closed")]
    Closed,
}
