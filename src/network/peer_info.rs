//! Peer identity and advertised state
//!
//! [`PeerInfo`] is the record exchanged during handshakes and peer-list
//! exchange. [`LegacyPeerInfo`] is the older wire shape, where absent
//! optional fields are encoded as an empty nonce and an `httpPort` of 0.

use crate::network::error::NetworkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Longest accepted value for the free-form string fields of a peer record
const MAX_FIELD_LEN: usize = 128;

/// First protocol version that is not treated as legacy
const CURRENT_PROTOCOL: (u32, u32) = (1, 1);

/// Unique peer identifier, derived from address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerId {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

impl FromStr for PeerId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s
            .trim()
            .parse()
            .map_err(|_| NetworkError::validation(format!("invalid peer address '{}'", s)))?;
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

/// Direction of the connection a peer record was learned through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Inbound,
    #[default]
    Outbound,
}

/// Identity and advertised state of a remote node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub ip_address: IpAddr,
    pub port: u16,
    pub height: u64,
    pub os: String,
    pub version: String,
    pub protocol_version: String,
    #[serde(alias = "nethash")]
    pub network_identifier: String,
    pub broadhash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(skip)]
    pub connection_kind: ConnectionKind,
}

impl PeerInfo {
    /// Create a record with empty advertised state
    pub fn new(ip_address: IpAddr, port: u16) -> Self {
        Self {
            ip_address,
            port,
            height: 0,
            os: String::new(),
            version: String::new(),
            protocol_version: String::new(),
            network_identifier: String::new(),
            broadhash: String::new(),
            nonce: None,
            http_port: None,
            connection_kind: ConnectionKind::Outbound,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.ip_address, self.port)
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_network(mut self, network_identifier: impl Into<String>) -> Self {
        self.network_identifier = network_identifier.into();
        self
    }

    pub fn with_kind(mut self, kind: ConnectionKind) -> Self {
        self.connection_kind = kind;
        self
    }

    /// Normalize optional fields: an empty nonce or a zero `httpPort` means absent
    pub fn sanitize(mut self) -> Self {
        if self.nonce.as_deref().is_some_and(str::is_empty) {
            self.nonce = None;
        }
        if self.http_port == Some(0) {
            self.http_port = None;
        }
        self
    }

    /// Check a record received from the network before it is stored
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.port == 0 {
            return Err(NetworkError::validation("peer port must not be 0"));
        }
        if self.ip_address.is_unspecified() {
            return Err(NetworkError::validation(format!(
                "unspecified peer address {}",
                self.ip_address
            )));
        }
        let fields = [
            ("os", &self.os),
            ("version", &self.version),
            ("protocolVersion", &self.protocol_version),
            ("networkIdentifier", &self.network_identifier),
            ("broadhash", &self.broadhash),
        ];
        for (name, value) in fields {
            if value.len() > MAX_FIELD_LEN {
                return Err(NetworkError::validation(format!("{} is too long", name)));
            }
        }
        if self.nonce.as_ref().is_some_and(|n| n.len() > MAX_FIELD_LEN) {
            return Err(NetworkError::validation("nonce is too long"));
        }
        Ok(())
    }

    /// Whether this peer speaks a protocol older than the current one
    pub fn is_legacy(&self) -> bool {
        match parse_protocol_version(&self.protocol_version) {
            Some(version) => version < CURRENT_PROTOCOL,
            None => true,
        }
    }

    /// Convert to the older wire shape
    pub fn to_legacy(&self) -> LegacyPeerInfo {
        LegacyPeerInfo {
            ip: self.ip_address,
            port: self.port,
            height: self.height,
            os: self.os.clone(),
            version: self.version.clone(),
            protocol_version: self.protocol_version.clone(),
            nethash: self.network_identifier.clone(),
            broadhash: self.broadhash.clone(),
            nonce: self.nonce.clone().unwrap_or_default(),
            http_port: self.http_port.unwrap_or(0),
        }
    }

    pub fn from_legacy(legacy: LegacyPeerInfo) -> Self {
        Self {
            ip_address: legacy.ip,
            port: legacy.port,
            height: legacy.height,
            os: legacy.os,
            version: legacy.version,
            protocol_version: legacy.protocol_version,
            network_identifier: legacy.nethash,
            broadhash: legacy.broadhash,
            nonce: Some(legacy.nonce),
            http_port: Some(legacy.http_port),
            connection_kind: ConnectionKind::Outbound,
        }
        .sanitize()
    }
}

/// Peer record as understood by nodes running an older protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPeerInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub height: u64,
    pub os: String,
    pub version: String,
    pub protocol_version: String,
    pub nethash: String,
    pub broadhash: String,
    pub nonce: String,
    pub http_port: u16,
}

/// Parse a peer record in either the current or the legacy format
pub fn parse_peer_record(value: &serde_json::Value) -> Result<PeerInfo, NetworkError> {
    let info = match serde_json::from_value::<PeerInfo>(value.clone()) {
        Ok(info) => info.sanitize(),
        Err(_) => PeerInfo::from_legacy(serde_json::from_value::<LegacyPeerInfo>(value.clone())?),
    };
    info.validate()?;
    Ok(info)
}

fn parse_protocol_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PeerInfo {
        PeerInfo {
            height: 42,
            os: "linux".to_string(),
            version: "1.0.0".to_string(),
            protocol_version: "1.1".to_string(),
            broadhash: "bb".to_string(),
            ..PeerInfo::new("10.0.0.1".parse().unwrap(), 5000).with_network("net")
        }
    }

    #[test]
    fn test_peer_id_display_and_parse() {
        let id = sample().peer_id();
        assert_eq!(id.to_string(), "10.0.0.1:5000");
        assert_eq!("10.0.0.1:5000".parse::<PeerId>().unwrap(), id);
        assert!("not-an-address".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_legacy_conversion_fills_absent_fields() {
        let legacy = sample().to_legacy();
        assert_eq!(legacy.nonce, "");
        assert_eq!(legacy.http_port, 0);

        let back = PeerInfo::from_legacy(legacy);
        assert_eq!(back.nonce, None);
        assert_eq!(back.http_port, None);
        assert_eq!(back, sample());
    }

    #[test]
    fn test_sanitize_keeps_real_values() {
        let info = PeerInfo {
            http_port: Some(8000),
            ..sample().with_nonce("abc")
        }
        .sanitize();
        assert_eq!(info.nonce.as_deref(), Some("abc"));
        assert_eq!(info.http_port, Some(8000));
    }

    #[test]
    fn test_parse_peer_record_accepts_both_formats() {
        let current = json!({
            "ipAddress": "10.0.0.2", "port": 4000, "height": 1, "os": "linux",
            "version": "1.0", "protocolVersion": "1.1", "networkIdentifier": "net",
            "broadhash": "x", "nonce": "", "httpPort": 0
        });
        let parsed = parse_peer_record(&current).unwrap();
        assert_eq!(parsed.nonce, None);
        assert_eq!(parsed.http_port, None);

        let legacy = json!({
            "ip": "10.0.0.3", "port": 4001, "height": 7, "os": "darwin",
            "version": "0.9", "protocolVersion": "1.0", "nethash": "net",
            "broadhash": "y", "nonce": "n1", "httpPort": 4002
        });
        let parsed = parse_peer_record(&legacy).unwrap();
        assert_eq!(parsed.network_identifier, "net");
        assert_eq!(parsed.nonce.as_deref(), Some("n1"));
        assert_eq!(parsed.http_port, Some(4002));
    }

    #[test]
    fn test_parse_peer_record_rejects_missing_fields() {
        assert!(parse_peer_record(&json!({ "ipAddress": "10.0.0.2", "port": 4000 })).is_err());
        let zero_port = json!({
            "ipAddress": "10.0.0.2", "port": 0, "height": 1, "os": "", "version": "",
            "protocolVersion": "1.1", "networkIdentifier": "net", "broadhash": ""
        });
        assert!(parse_peer_record(&zero_port).is_err());
    }

    #[test]
    fn test_legacy_protocol_detection() {
        assert!(!sample().is_legacy());
        let mut old = sample();
        old.protocol_version = "1.0".to_string();
        assert!(old.is_legacy());
        old.protocol_version = String::new();
        assert!(old.is_legacy());
        old.protocol_version = "2".to_string();
        assert!(!old.is_legacy());
    }
}
