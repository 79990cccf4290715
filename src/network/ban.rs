//! Temporary peer bans
//!
//! A banned peer stays in the table until its timer fires. Banning the same
//! peer again restarts the window instead of adding a second entry. Addresses
//! on the permanent blacklist never enter the table; they are refused at
//! connect and accept time instead.

use crate::network::peer_info::{PeerId, PeerInfo};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default length of a temporary ban
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(2 * 60);

/// A peer currently under a temporary ban
#[derive(Debug)]
pub struct BannedPeer {
    pub peer_info: PeerInfo,
    pub expires_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct BanTable {
    peers: HashMap<PeerId, BannedPeer>,
    next_generation: u64,
}

/// Temporary-ban bookkeeping with a permanent blacklist override
#[derive(Debug)]
pub struct BanManager {
    duration: Duration,
    blacklist: HashSet<IpAddr>,
    table: Arc<Mutex<BanTable>>,
}

fn lock(table: &Mutex<BanTable>) -> MutexGuard<'_, BanTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BanManager {
    pub fn new(duration: Duration, blacklist: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            duration,
            blacklist: blacklist.into_iter().collect(),
            table: Arc::new(Mutex::new(BanTable::default())),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_blacklisted(&self, ip: &IpAddr) -> bool {
        self.blacklist.contains(ip)
    }

    /// Ban a peer for the configured duration
    ///
    /// `on_ban_finished` runs once, when the ban expires. It is dropped
    /// without running if the ban is replaced or the manager is cleared first.
    pub fn ban_temporarily<F>(&self, peer_info: PeerInfo, on_ban_finished: F)
    where
        F: FnOnce(PeerInfo) + Send + 'static,
    {
        if self.is_blacklisted(&peer_info.ip_address) {
            log::debug!("Not banning blacklisted address {}", peer_info.ip_address);
            return;
        }

        let peer_id = peer_info.peer_id();
        let mut table = lock(&self.table);
        if let Some(previous) = table.peers.remove(&peer_id) {
            previous.timer.abort();
            log::debug!("Restarting ban of {}", peer_id);
        }

        let generation = table.next_generation;
        table.next_generation += 1;
        let expires_at = Instant::now() + self.duration;

        let shared = Arc::clone(&self.table);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let finished = {
                let mut table = lock(&shared);
                match table.peers.get(&peer_id) {
                    Some(entry) if entry.generation == generation => table.peers.remove(&peer_id),
                    _ => None,
                }
            };
            if let Some(entry) = finished {
                log::info!("Ban of {} expired", peer_id);
                on_ban_finished(entry.peer_info);
            }
        });

        log::info!("Banned {} for {:?}", peer_id, self.duration);
        table.peers.insert(
            peer_id,
            BannedPeer {
                peer_info,
                expires_at,
                generation,
                timer,
            },
        );
    }

    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        lock(&self.table).peers.contains_key(peer_id)
    }

    /// Whether any banned peer uses `ip`, whatever port it advertised
    pub fn is_ip_banned(&self, ip: &IpAddr) -> bool {
        lock(&self.table).peers.keys().any(|id| id.ip == *ip)
    }

    pub fn expires_at(&self, peer_id: &PeerId) -> Option<Instant> {
        lock(&self.table).peers.get(peer_id).map(|b| b.expires_at)
    }

    /// Peer infos of every banned peer
    pub fn banned(&self) -> Vec<PeerInfo> {
        lock(&self.table).peers.values().map(|b| b.peer_info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lift every ban without running the expiry callbacks
    pub fn clear(&self) {
        let mut table = lock(&self.table);
        for (_, entry) in table.peers.drain() {
            entry.timer.abort();
        }
    }
}

impl Drop for BanManager {
    fn drop(&mut self) {
        self.clear();
    }
}
