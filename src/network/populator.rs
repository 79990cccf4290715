//! Peer population and discovery
//!
//! The populator runs two duties on a fixed period:
//! - topping up outbound connections from the tried and new lists
//! - asking a sample of connected peers for their peer lists
//!
//! It only decides and records. Opening connections and sending requests is
//! left to the node, which feeds the outcomes back through the
//! `on_connect_*` and `merge_discovered` methods. Once stopped, those
//! methods leave every list untouched, so outcomes that resolve after
//! shutdown cannot resurrect peers.

use crate::network::connections_table::ConnectionsTable;
use crate::network::peer_info::PeerInfo;
use crate::network::peer_list::PeerBook;
use crate::network::scheduler::ScheduledTask;
use crate::network::selection::{select_for_connection, select_for_request};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// How often the populator runs by default
pub const DEFAULT_POPULATOR_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of outbound connections to maintain
pub const DEFAULT_MAX_OUTBOUND: usize = 20;

/// Default number of peers asked for their peer lists each round
pub const DEFAULT_DISCOVERY_SAMPLE_SIZE: usize = 3;

// =============================================================================
// Populator
// =============================================================================

/// Outbound connection and discovery maintenance
#[derive(Debug)]
pub struct Populator {
    max_outbound: usize,
    discovery_sample_size: usize,
    active: bool,
    task: Option<ScheduledTask>,
}

impl Populator {
    pub fn new(max_outbound: usize, discovery_sample_size: usize) -> Self {
        Self {
            max_outbound,
            discovery_sample_size,
            active: false,
            task: None,
        }
    }

    /// Start ticking every `interval`; `tick` is expected to hand a round to the node
    pub fn start<F>(&mut self, interval: Duration, token: CancellationToken, tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.active {
            return;
        }
        self.active = true;
        self.task = Some(ScheduledTask::every(interval, token, tick));
        log::info!("Populator started (every {:?})", interval);
    }

    /// Stop ticking and ignore any outcome reported afterwards
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(task) = self.task.take() {
            task.cancel();
        }
        log::info!("Populator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.active
    }

    /// Peers to dial this round
    ///
    /// `eligible` filters out peers that are already connected, being
    /// dialed, or banned.
    pub fn connection_candidates<R, F>(
        &self,
        book: &PeerBook,
        outbound_count: usize,
        eligible: F,
        rng: &mut R,
    ) -> Vec<PeerInfo>
    where
        R: Rng + ?Sized,
        F: Fn(&PeerInfo) -> bool,
    {
        if !self.active {
            return Vec::new();
        }
        let needed = self.max_outbound as isize - outbound_count as isize;
        if needed <= 0 {
            return Vec::new();
        }

        let tried: Vec<PeerInfo> = book.tried_peers.peer_infos().into_iter().filter(|p| eligible(p)).collect();
        let new: Vec<PeerInfo> = book.new_peers.peer_infos().into_iter().filter(|p| eligible(p)).collect();
        let candidates = select_for_connection(&tried, &new, Some(needed), rng);
        if !candidates.is_empty() {
            log::debug!(
                "Populator needs {} outbound, dialing {} of {} tried / {} new",
                needed,
                candidates.len(),
                tried.len(),
                new.len()
            );
        }
        candidates
    }

    /// Connected peers to ask for their peer lists this round
    pub fn discovery_targets<R: Rng + ?Sized>(&self, connected: &[PeerInfo], rng: &mut R) -> Vec<PeerInfo> {
        if !self.active {
            return Vec::new();
        }
        select_for_request(connected, Some(self.discovery_sample_size), rng)
    }

    /// Record a successful outbound connection: promote the peer to tried and
    /// register its session
    pub fn on_connect_success(
        &self,
        book: &mut PeerBook,
        table: &mut ConnectionsTable,
        peer_info: &PeerInfo,
        connection_id: &str,
    ) {
        if !self.active {
            return;
        }
        let peer_id = peer_info.peer_id();

        if book.tried_peers.update(peer_info.clone()) {
            book.tried_peers.reset_failures(&peer_id);
            book.new_peers.remove(&peer_id);
        } else {
            match book.tried_peers.add(peer_info.clone()) {
                Ok(evicted) => {
                    book.new_peers.remove(&peer_id);
                    if let Some(evicted) = evicted {
                        demote(book, evicted.peer_info);
                    }
                    log::debug!("Promoted {} to tried", peer_id);
                }
                Err(e) => {
                    // Tried bucket is full: the peer stays where it was
                    log::debug!("Keeping {} in new: {}", peer_id, e);
                    if !book.new_peers.update(peer_info.clone()) {
                        if let Err(e) = book.new_peers.add(peer_info.clone()) {
                            log::debug!("Could not keep {} in new: {}", peer_id, e);
                        }
                    }
                }
            }
        }

        if let Some(nonce) = &peer_info.nonce {
            if let Err(e) = table.add(nonce, connection_id) {
                log::warn!("Could not register session of {}: {}", peer_id, e);
            }
        }
    }

    /// Record a failed outbound attempt; returns true if the peer was evicted
    /// from the tried list
    pub fn on_connect_failure(&self, book: &mut PeerBook, peer_info: &PeerInfo) -> bool {
        if !self.active {
            return false;
        }
        let peer_id = peer_info.peer_id();

        if book.tried_peers.contains(&peer_id) {
            let max_tries = book.max_reconnect_tries;
            let evicted = book.tried_peers.failed_connection_action(peer_info, max_tries);
            if evicted {
                log::info!("Dropped tried peer {} after {} failed attempts", peer_id, max_tries);
            }
            return evicted;
        }

        if !book.new_peers.contains(&peer_id) {
            if let Err(e) = book.new_peers.add(peer_info.clone()) {
                log::debug!("Could not keep {} in new: {}", peer_id, e);
            }
        }
        false
    }

    /// Merge peers learned from a peer list response; returns those not known before
    pub fn merge_discovered(&self, book: &mut PeerBook, peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
        if !self.active {
            return Vec::new();
        }

        let mut discovered = Vec::new();
        for peer_info in peers {
            if book.tried_peers.update(peer_info.clone()) || book.new_peers.update(peer_info.clone()) {
                continue;
            }
            match book.new_peers.add(peer_info.clone()) {
                Ok(_) => discovered.push(peer_info),
                Err(e) => log::debug!("Skipping discovered peer {}: {}", peer_info.peer_id(), e),
            }
        }
        if !discovered.is_empty() {
            log::info!("Discovered {} new peers", discovered.len());
        }
        discovered
    }
}

impl Drop for Populator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Move a record pushed out of the tried list back into new
fn demote(book: &mut PeerBook, peer_info: PeerInfo) {
    let peer_id = peer_info.peer_id();
    match book.new_peers.add(peer_info) {
        Ok(_) => log::debug!("Demoted {} to new", peer_id),
        Err(e) => log::debug!("Dropped demoted peer {}: {}", peer_id, e),
    }
}

// =============================================================================
// Tests
// =============================================================================
