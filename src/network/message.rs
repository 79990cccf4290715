//! Network message types for overlay communication
//!
//! Payloads of events, RPC calls and legacy announcements are opaque JSON;
//! the overlay routes them without interpreting their content.

use crate::network::peer_info::PeerInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised by this implementation
pub const PROTOCOL_VERSION: &str = "1.1";

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x4F, 0x56, 0x52, 0x4C]; // "OVRL"

/// Largest accepted frame body
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Built-in procedure answering with a sample of known peers
pub const PROCEDURE_LIST_PEERS: &str = "list";

/// Built-in procedure answering with the local peer info
pub const PROCEDURE_STATUS: &str = "status";

/// Event a node sends to its peers when its advertised state changes
pub const EVENT_NODE_INFO: &str = "postNodeInfo";

/// Network message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sent by the dialing side when a session opens
    Handshake(PeerInfo),

    /// Reply of the accepting side to a handshake
    HandshakeAck(PeerInfo),

    /// Fire-and-forget application event
    Event { event: String, data: Value },

    /// Remote procedure call
    RpcRequest {
        id: u64,
        procedure: String,
        data: Value,
    },

    /// Answer to an `RpcRequest` with the same id
    RpcResponse {
        id: u64,
        result: Result<Value, String>,
    },

    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),

    /// Orderly close with a reason
    Close { code: u16, reason: String },

    /// Single-purpose announcements from the older protocol
    Legacy(LegacyEvent),
}

/// Announcements older peers send instead of generic events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LegacyEvent {
    PostBlock(Value),
    PostSignatures(Value),
    PostTransactions(Value),
}

impl LegacyEvent {
    /// Generic event name this announcement corresponds to
    pub fn event_name(&self) -> &'static str {
        match self {
            LegacyEvent::PostBlock(_) => "postBlock",
            LegacyEvent::PostSignatures(_) => "postSignatures",
            LegacyEvent::PostTransactions(_) => "postTransactions",
        }
    }

    /// Legacy form of a generic event, if one exists
    pub fn from_event(event: &str, data: Value) -> Result<Self, Value> {
        match event {
            "postBlock" => Ok(LegacyEvent::PostBlock(data)),
            "postSignatures" => Ok(LegacyEvent::PostSignatures(data)),
            "postTransactions" => Ok(LegacyEvent::PostTransactions(data)),
            _ => Err(data),
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            LegacyEvent::PostBlock(v) | LegacyEvent::PostSignatures(v) | LegacyEvent::PostTransactions(v) => v,
        }
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "Handshake",
            Message::HandshakeAck(_) => "HandshakeAck",
            Message::Event { .. } => "Event",
            Message::RpcRequest { .. } => "RpcRequest",
            Message::RpcResponse { .. } => "RpcResponse",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::Close { .. } => "Close",
            Message::Legacy(_) => "Legacy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization() {
        let msg = Message::RpcResponse {
            id: 9,
            result: Err("unknown procedure".to_string()),
        };
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.type_name(), "RpcResponse");
    }

    #[test]
    fn test_legacy_event_mapping() {
        let legacy = LegacyEvent::from_event("postBlock", json!({"id": 1})).unwrap();
        assert_eq!(legacy.event_name(), "postBlock");
        assert_eq!(legacy.into_payload(), json!({"id": 1}));
        assert_eq!(LegacyEvent::from_event("chat", json!(1)), Err(json!(1)));
    }
}
