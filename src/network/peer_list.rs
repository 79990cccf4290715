//! Bucketed peer lists
//!
//! Two independent lists make up the address book:
//! - New peers: heard of through discovery, never verified
//! - Tried peers: successfully connected at least once
//!
//! Bucket placement is a keyed hash of the peer's network group and address,
//! so an attacker with many addresses cannot predict which buckets they fill.

use crate::network::error::NetworkError;
use crate::network::peer_info::{PeerId, PeerInfo};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

// =============================================================================
// Constants
// =============================================================================

/// Default number of buckets for new peers
pub const DEFAULT_NEW_BUCKET_COUNT: usize = 128;

/// Default number of buckets for tried peers
pub const DEFAULT_TRIED_BUCKET_COUNT: usize = 64;

/// Default number of entries per bucket
pub const DEFAULT_BUCKET_SIZE: usize = 32;

/// Default number of failed reconnects before a tried peer is dropped
pub const DEFAULT_MAX_RECONNECT_TRIES: u32 = 3;

// =============================================================================
// Configuration
// =============================================================================

/// What `add` does when the target bucket is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Fail with a capacity error
    Reject,
    /// Evict a random occupant of the bucket
    ReplaceRandom,
}

/// Shape of a single peer list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListConfig {
    pub bucket_count: usize,
    pub bucket_size: usize,
    pub eviction: EvictionPolicy,
}

impl PeerListConfig {
    pub fn new_peers() -> Self {
        Self {
            bucket_count: DEFAULT_NEW_BUCKET_COUNT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            eviction: EvictionPolicy::ReplaceRandom,
        }
    }

    pub fn tried_peers() -> Self {
        Self {
            bucket_count: DEFAULT_TRIED_BUCKET_COUNT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            eviction: EvictionPolicy::Reject,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bucket_count * self.bucket_size
    }
}

// =============================================================================
// Peer Records
// =============================================================================

/// A record stored in a peer list
pub trait PeerRecord: Clone {
    /// Whether the port takes part in bucket placement
    const FOLD_PORT: bool;

    fn from_peer_info(peer_info: PeerInfo) -> Self;
    fn peer_info(&self) -> &PeerInfo;
    fn set_peer_info(&mut self, peer_info: PeerInfo);

    fn peer_id(&self) -> PeerId {
        self.peer_info().peer_id()
    }
}

/// Entry in the new list
#[derive(Debug, Clone, PartialEq)]
pub struct NewPeer {
    pub peer_info: PeerInfo,
    pub date_added: DateTime<Utc>,
}

impl PeerRecord for NewPeer {
    const FOLD_PORT: bool = true;

    fn from_peer_info(peer_info: PeerInfo) -> Self {
        Self {
            peer_info,
            date_added: Utc::now(),
        }
    }

    fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    fn set_peer_info(&mut self, peer_info: PeerInfo) {
        self.peer_info = peer_info;
    }
}

/// Entry in the tried list
#[derive(Debug, Clone, PartialEq)]
pub struct TriedPeer {
    pub peer_info: PeerInfo,
    /// Failed reconnection attempts since the last success
    pub connection_failure_count: u32,
    pub date_added: DateTime<Utc>,
}

impl PeerRecord for TriedPeer {
    const FOLD_PORT: bool = false;

    fn from_peer_info(peer_info: PeerInfo) -> Self {
        Self {
            peer_info,
            connection_failure_count: 0,
            date_added: Utc::now(),
        }
    }

    fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    fn set_peer_info(&mut self, peer_info: PeerInfo) {
        self.peer_info = peer_info;
    }
}

// =============================================================================
// Bucket
// =============================================================================

/// Fixed-capacity group of peer records
#[derive(Debug, Clone)]
pub struct Bucket<T> {
    peers: HashMap<PeerId, T>,
    capacity: usize,
}

impl<T> Bucket<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.peers.values()
    }
}

// =============================================================================
// Peer List
// =============================================================================

/// Deterministic, capacity-bounded, bucketed peer store
#[derive(Debug)]
pub struct PeerList<T: PeerRecord> {
    buckets: Vec<Bucket<T>>,
    config: PeerListConfig,
    /// Per-process key for bucket placement
    secret: u64,
    rng: StdRng,
}

pub type NewPeers = PeerList<NewPeer>;
pub type TriedPeers = PeerList<TriedPeer>;

impl<T: PeerRecord> PeerList<T> {
    pub fn new(config: PeerListConfig, secret: u64) -> Self {
        Self::with_rng(config, secret, StdRng::from_entropy())
    }

    /// Create with an explicit random source (used for random replacement)
    pub fn with_rng(config: PeerListConfig, secret: u64, rng: StdRng) -> Self {
        let buckets = (0..config.bucket_count.max(1))
            .map(|_| Bucket::with_capacity(config.bucket_size))
            .collect();
        Self {
            buckets,
            config,
            secret,
            rng,
        }
    }

    pub fn config(&self) -> &PeerListConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len() * self.config.bucket_size
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }

    /// Bucket id for an address; the port only counts for lists that fold it in
    pub fn bucket_id(&self, ip: IpAddr, port: Option<u16>) -> usize {
        let mut hasher = DefaultHasher::new();
        self.secret.hash(&mut hasher);
        network_group(&ip).hash(&mut hasher);
        ip.hash(&mut hasher);
        if T::FOLD_PORT {
            port.hash(&mut hasher);
        }
        (hasher.finish() % self.buckets.len() as u64) as usize
    }

    pub fn calculate_bucket(&self, ip: IpAddr, port: Option<u16>) -> (usize, &Bucket<T>) {
        let id = self.bucket_id(ip, port);
        (id, &self.buckets[id])
    }

    fn bucket_of(&self, peer_id: &PeerId) -> usize {
        self.bucket_id(peer_id.ip, Some(peer_id.port))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&T> {
        self.buckets[self.bucket_of(peer_id)].peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.get(peer_id).is_some()
    }

    /// Insert a peer into its bucket
    ///
    /// Returns the record that was evicted to make room, if any. An existing
    /// record for the same peer is updated in place instead.
    pub fn add(&mut self, peer_info: PeerInfo) -> Result<Option<T>, NetworkError> {
        let peer_id = peer_info.peer_id();
        let bucket_id = self.bucket_of(&peer_id);
        let eviction = self.config.eviction;
        let bucket = &mut self.buckets[bucket_id];

        if let Some(existing) = bucket.peers.get_mut(&peer_id) {
            existing.set_peer_info(peer_info);
            return Ok(None);
        }

        let mut evicted = None;
        if bucket.is_full() {
            match eviction {
                EvictionPolicy::Reject => return Err(NetworkError::Capacity { bucket_id }),
                EvictionPolicy::ReplaceRandom => {
                    let index = self.rng.gen_range(0..bucket.peers.len());
                    let victim = bucket.peers.keys().nth(index).copied();
                    evicted = victim.and_then(|id| bucket.peers.remove(&id));
                }
            }
        }

        bucket.peers.insert(peer_id, T::from_peer_info(peer_info));
        Ok(evicted)
    }

    /// Replace the stored info of a peer; returns false if it is not present
    pub fn update(&mut self, peer_info: PeerInfo) -> bool {
        let peer_id = peer_info.peer_id();
        let bucket_id = self.bucket_of(&peer_id);
        match self.buckets[bucket_id].peers.get_mut(&peer_id) {
            Some(record) => {
                record.set_peer_info(peer_info);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<T> {
        let bucket_id = self.bucket_of(peer_id);
        self.buckets[bucket_id].peers.remove(peer_id)
    }

    /// Snapshot of every stored record
    pub fn list(&self) -> std::vec::IntoIter<T> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.values().cloned())
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.values().map(|r| r.peer_info().clone()))
            .collect()
    }
}

impl PeerList<TriedPeer> {
    /// Record a failed reconnection attempt
    ///
    /// Returns true when the peer reached `max_reconnect_tries` and was
    /// removed from the list.
    pub fn failed_connection_action(&mut self, peer_info: &PeerInfo, max_reconnect_tries: u32) -> bool {
        let peer_id = peer_info.peer_id();
        let bucket_id = self.bucket_of(&peer_id);
        let bucket = &mut self.buckets[bucket_id];

        let Some(record) = bucket.peers.get_mut(&peer_id) else {
            return false;
        };
        record.connection_failure_count += 1;
        if record.connection_failure_count >= max_reconnect_tries {
            bucket.peers.remove(&peer_id);
            log::debug!("Evicted tried peer {} after repeated failures", peer_id);
            return true;
        }
        false
    }

    /// Clear the failure counter after a successful connection
    pub fn reset_failures(&mut self, peer_id: &PeerId) {
        let bucket_id = self.bucket_of(peer_id);
        if let Some(record) = self.buckets[bucket_id].peers.get_mut(peer_id) {
            record.connection_failure_count = 0;
        }
    }
}

/// Address prefix used to group peers: /16 for IPv4, /32 for IPv6
fn network_group(ip: &IpAddr) -> [u8; 4] {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            [o[0], o[1], 0, 0]
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            [o[0], o[1], o[2], o[3]]
        }
    }
}

// =============================================================================
// Peer Book
// =============================================================================

/// The node's address book: new and tried lists side by side
#[derive(Debug)]
pub struct PeerBook {
    pub new_peers: NewPeers,
    pub tried_peers: TriedPeers,
    pub max_reconnect_tries: u32,
}

impl PeerBook {
    pub fn new(new_peers: NewPeers, tried_peers: TriedPeers, max_reconnect_tries: u32) -> Self {
        Self {
            new_peers,
            tried_peers,
            max_reconnect_tries,
        }
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.tried_peers.contains(peer_id) || self.new_peers.contains(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.tried_peers
            .get(peer_id)
            .map(PeerRecord::peer_info)
            .or_else(|| self.new_peers.get(peer_id).map(PeerRecord::peer_info))
    }

    /// Every known peer, tried first
    pub fn all(&self) -> Vec<PeerInfo> {
        let mut peers = self.tried_peers.peer_infos();
        peers.extend(self.new_peers.peer_infos());
        peers
    }

    pub fn len(&self) -> usize {
        self.tried_peers.len() + self.new_peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str, port: u16) -> PeerInfo {
        PeerInfo::new(ip.parse().unwrap(), port)
    }

    fn tried_list(secret: u64) -> TriedPeers {
        PeerList::with_rng(PeerListConfig::tried_peers(), secret, StdRng::seed_from_u64(1))
    }

    fn new_list(config: PeerListConfig) -> NewPeers {
        PeerList::with_rng(config, 7, StdRng::seed_from_u64(1))
    }

    #[test]
    fn test_bucket_is_deterministic() {
        let list = tried_list(99);
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let first = list.bucket_id(ip, None);
        for _ in 0..10 {
            assert_eq!(list.bucket_id(ip, None), first);
        }
        assert_eq!(tried_list(99).bucket_id(ip, None), first);
    }

    #[test]
    fn test_secret_changes_bucket_assignment() {
        let ips: Vec<IpAddr> = (1..=20)
            .map(|i| format!("198.51.{}.{}", i, i).parse().unwrap())
            .collect();
        let a = tried_list(1);
        let b = tried_list(2);
        let differing = ips
            .iter()
            .filter(|ip| a.bucket_id(**ip, None) != b.bucket_id(**ip, None))
            .count();
        assert!(differing > 0);
    }

    #[test]
    fn test_tried_list_ignores_port() {
        let list = tried_list(5);
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        assert_eq!(list.bucket_id(ip, Some(1)), list.bucket_id(ip, Some(2)));
    }

    #[test]
    fn test_add_get_update_remove() {
        let mut list = tried_list(3);
        let info = peer("192.0.2.1", 5000);
        assert!(list.add(info.clone()).unwrap().is_none());
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&info.peer_id()).unwrap().peer_info, info);

        let mut updated = info.clone();
        updated.height = 10;
        assert!(list.update(updated));
        assert_eq!(list.get(&info.peer_id()).unwrap().peer_info.height, 10);

        assert!(!list.update(peer("192.0.2.2", 5000)));
        assert!(list.remove(&info.peer_id()).is_some());
        assert!(list.remove(&info.peer_id()).is_none());
        assert!(list.get(&info.peer_id()).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_adding_existing_peer_updates_in_place() {
        let mut list = tried_list(3);
        let info = peer("192.0.2.1", 5000);
        list.add(info.clone()).unwrap();
        let mut again = info.clone();
        again.height = 77;
        list.add(again).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&info.peer_id()).unwrap().peer_info.height, 77);
    }

    #[test]
    fn test_full_bucket_rejects() {
        let config = PeerListConfig {
            bucket_count: 1,
            bucket_size: 2,
            eviction: EvictionPolicy::Reject,
        };
        let mut list = new_list(config);
        list.add(peer("192.0.2.1", 1)).unwrap();
        list.add(peer("192.0.2.2", 1)).unwrap();
        let err = list.add(peer("192.0.2.3", 1)).unwrap_err();
        assert!(matches!(err, NetworkError::Capacity { bucket_id: 0 }));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_full_bucket_replaces_random() {
        let config = PeerListConfig {
            bucket_count: 1,
            bucket_size: 2,
            eviction: EvictionPolicy::ReplaceRandom,
        };
        let mut list = new_list(config);
        list.add(peer("192.0.2.1", 1)).unwrap();
        list.add(peer("192.0.2.2", 1)).unwrap();
        let evicted = list.add(peer("192.0.2.3", 1)).unwrap();
        assert!(evicted.is_some());
        assert_eq!(list.len(), 2);
        assert!(list.contains(&peer("192.0.2.3", 1).peer_id()));
    }

    #[test]
    fn test_capacity_is_buckets_times_size() {
        let list = new_list(PeerListConfig::new_peers());
        assert_eq!(list.capacity(), DEFAULT_NEW_BUCKET_COUNT * DEFAULT_BUCKET_SIZE);
    }

    #[test]
    fn test_failed_connection_action_evicts_at_limit() {
        let mut list = tried_list(11);
        let info = peer("192.0.2.50", 7000);
        list.add(info.clone()).unwrap();

        assert!(!list.failed_connection_action(&info, 3));
        assert!(!list.failed_connection_action(&info, 3));
        assert_eq!(list.get(&info.peer_id()).unwrap().connection_failure_count, 2);
        assert!(list.failed_connection_action(&info, 3));
        assert!(list.get(&info.peer_id()).is_none());
    }

    #[test]
    fn test_reset_failures() {
        let mut list = tried_list(11);
        let info = peer("192.0.2.50", 7000);
        list.add(info.clone()).unwrap();
        list.failed_connection_action(&info, 3);
        list.reset_failures(&info.peer_id());
        assert_eq!(list.get(&info.peer_id()).unwrap().connection_failure_count, 0);
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let mut list = tried_list(4);
        for i in 1..=5 {
            list.add(peer(&format!("192.0.2.{}", i), 5000)).unwrap();
        }
        let snapshot = list.list();
        list.remove(&peer("192.0.2.1", 5000).peer_id());
        assert_eq!(snapshot.count(), 5);
        assert_eq!(list.list().count(), 4);
    }

    #[test]
    fn test_peer_book_lookup() {
        let mut book = PeerBook::new(
            new_list(PeerListConfig::new_peers()),
            tried_list(1),
            DEFAULT_MAX_RECONNECT_TRIES,
        );
        let a = peer("192.0.2.1", 1);
        let b = peer("192.0.2.2", 1);
        book.new_peers.add(a.clone()).unwrap();
        book.tried_peers.add(b.clone()).unwrap();
        assert!(book.contains(&a.peer_id()));
        assert_eq!(book.get(&b.peer_id()), Some(&b));
        assert_eq!(book.all().first(), Some(&b));
        assert_eq!(book.len(), 2);
    }
}
