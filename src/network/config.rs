//! Node configuration
//!
//! Every parameter the overlay algorithms depend on is an explicit field.
//! Durations are stored in milliseconds so the JSON file stays flat.

use crate::network::ban::DEFAULT_BAN_DURATION;
use crate::network::connection::{ConnectionSettings, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PONG_TIMEOUT};
use crate::network::error::NetworkError;
use crate::network::handshake::HandshakeTimeouts;
use crate::network::message::PROTOCOL_VERSION;
use crate::network::peer_info::{PeerId, PeerInfo};
use crate::network::peer_list::{PeerListConfig, DEFAULT_MAX_RECONNECT_TRIES};
use crate::network::populator::{DEFAULT_DISCOVERY_SAMPLE_SIZE, DEFAULT_MAX_OUTBOUND, DEFAULT_POPULATOR_INTERVAL};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Default port to listen on
pub const DEFAULT_PORT: u16 = 5000;

/// Default number of accepted inbound connections
pub const DEFAULT_MAX_INBOUND: usize = 100;

/// Default network identifier
pub const DEFAULT_NETWORK: &str = "overlay-main";

/// Overlay node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on
    pub host_ip: IpAddr,
    pub port: u16,
    /// Advertised HTTP port, if the application serves one
    pub http_port: Option<u16>,
    pub network_identifier: String,
    pub os: String,
    pub version: String,
    pub protocol_version: String,
    /// Peers added to the new list at startup, as `ip:port`
    pub seed_peers: Vec<String>,
    /// Addresses that are never connected to or accepted
    pub blacklisted_ips: Vec<IpAddr>,

    pub new_peers: PeerListConfig,
    pub tried_peers: PeerListConfig,
    pub max_reconnect_tries: u32,
    pub max_outbound_connections: usize,
    pub max_inbound_connections: usize,

    pub populator_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub ban_duration_ms: u64,

    /// Broadcast fan-out of `emit`
    pub send_peer_limit: usize,
    /// Connected peers asked for their peer lists each populator round
    pub discovery_sample_size: usize,
    /// Most peers returned to a peer list request
    pub peer_list_response_limit: usize,

    /// Bucket placement key; random per process when absent
    pub secret: Option<u64>,
    /// Seed of the selection random source; entropy when absent
    pub random_seed: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            http_port: None,
            network_identifier: DEFAULT_NETWORK.to_string(),
            os: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            seed_peers: Vec::new(),
            blacklisted_ips: Vec::new(),
            new_peers: PeerListConfig::new_peers(),
            tried_peers: PeerListConfig::tried_peers(),
            max_reconnect_tries: DEFAULT_MAX_RECONNECT_TRIES,
            max_outbound_connections: DEFAULT_MAX_OUTBOUND,
            max_inbound_connections: DEFAULT_MAX_INBOUND,
            populator_interval_ms: DEFAULT_POPULATOR_INTERVAL.as_millis() as u64,
            connect_timeout_ms: 2_000,
            ack_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            pong_timeout_ms: DEFAULT_PONG_TIMEOUT.as_millis() as u64,
            ban_duration_ms: DEFAULT_BAN_DURATION.as_millis() as u64,
            send_peer_limit: 16,
            discovery_sample_size: DEFAULT_DISCOVERY_SAMPLE_SIZE,
            peer_list_response_limit: 1000,
            secret: None,
            random_seed: None,
        }
    }
}

impl NetworkConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NetworkError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, NetworkError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        for (name, list) in [("new_peers", &self.new_peers), ("tried_peers", &self.tried_peers)] {
            if list.bucket_count == 0 || list.bucket_size == 0 {
                return Err(NetworkError::Config(format!("{} buckets must not be empty", name)));
            }
        }
        if self.max_reconnect_tries == 0 {
            return Err(NetworkError::Config("max_reconnect_tries must be at least 1".to_string()));
        }

        let intervals = [
            ("populator_interval_ms", self.populator_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("pong_timeout_ms", self.pong_timeout_ms),
            ("ban_duration_ms", self.ban_duration_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(NetworkError::Config(format!("{} must be positive", name)));
            }
        }
        if self.pong_timeout_ms >= self.heartbeat_interval_ms {
            return Err(NetworkError::Config(
                "pong_timeout_ms must be shorter than heartbeat_interval_ms".to_string(),
            ));
        }
        if self.network_identifier.is_empty() {
            return Err(NetworkError::Config("network_identifier must not be empty".to_string()));
        }

        self.seed_peer_ids()?;
        Ok(())
    }

    /// Parsed seed peer addresses
    pub fn seed_peer_ids(&self) -> Result<Vec<PeerId>, NetworkError> {
        self.seed_peers
            .iter()
            .map(|s| s.parse::<PeerId>().map_err(|e| NetworkError::Config(e.to_string())))
            .collect()
    }

    /// The record this node advertises in handshakes
    pub fn local_peer_info(&self, nonce: &str) -> PeerInfo {
        PeerInfo {
            height: 0,
            os: self.os.clone(),
            version: self.version.clone(),
            protocol_version: self.protocol_version.clone(),
            http_port: self.http_port,
            ..PeerInfo::new(self.host_ip, self.port)
                .with_network(self.network_identifier.clone())
                .with_nonce(nonce)
        }
    }

    pub fn populator_interval(&self) -> Duration {
        Duration::from_millis(self.populator_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_millis(self.ban_duration_ms)
    }

    pub fn handshake_timeouts(&self) -> HandshakeTimeouts {
        HandshakeTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            ack: Duration::from_millis(self.ack_timeout_ms),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer_list::EvictionPolicy;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = NetworkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_reconnect_tries, 3);
        assert_eq!(config.ban_duration(), Duration::from_secs(120));
        assert_eq!(config.connection_settings().heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.new_peers.eviction, EvictionPolicy::ReplaceRandom);
        assert_eq!(config.tried_peers.eviction, EvictionPolicy::Reject);
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "port": 7001, "seed_peers": ["10.0.0.1:7000"], "tried_peers": {{ "bucket_count": 4, "bucket_size": 2, "eviction": "replace_random" }} }}"#
        )
        .unwrap();

        let config = NetworkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.tried_peers.capacity(), 8);
        assert_eq!(config.tried_peers.eviction, EvictionPolicy::ReplaceRandom);
        assert_eq!(config.new_peers, PeerListConfig::new_peers());
        assert_eq!(config.seed_peer_ids().unwrap(), vec!["10.0.0.1:7000".parse().unwrap()]);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = NetworkConfig {
            pong_timeout_ms: 60_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NetworkError::Config(_))));

        let mut config = NetworkConfig::default();
        config.new_peers.bucket_size = 0;
        assert!(config.validate().is_err());

        let config = NetworkConfig {
            seed_peers: vec!["nowhere".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = NetworkConfig {
            secret: Some(9),
            blacklisted_ips: vec!["10.9.9.9".parse().unwrap()],
            ..Default::default()
        };
        let parsed: NetworkConfig = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_local_peer_info() {
        let config = NetworkConfig {
            http_port: Some(8000),
            ..Default::default()
        };
        let info = config.local_peer_info("abc");
        assert_eq!(info.nonce.as_deref(), Some("abc"));
        assert_eq!(info.network_identifier, DEFAULT_NETWORK);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert!(!info.is_legacy());
    }
}
