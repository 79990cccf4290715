//! Peer selection policies
//!
//! Pure functions over peer snapshots. The random source is always passed
//! in so every policy is reproducible under a seeded generator.

use crate::network::peer_info::{ConnectionKind, PeerInfo};
use rand::seq::SliceRandom;
use rand::Rng;

/// Minimum share of connection draws that go to tried peers
const MIN_TRIED_RATIO: f64 = 0.5;

/// Uniform sample without replacement, or every peer shuffled when `limit` is `None`
pub fn select_for_request<R: Rng + ?Sized>(
    peers: &[PeerInfo],
    limit: Option<usize>,
    rng: &mut R,
) -> Vec<PeerInfo> {
    let take = limit.map_or(peers.len(), |l| l.min(peers.len()));
    peers.choose_multiple(rng, take).cloned().collect()
}

/// Pick broadcast targets balanced across connection directions
///
/// Up to half of `limit` (rounded up) comes from the scarcer direction and
/// the rest from the other one, so neither direction starves propagation.
pub fn select_for_send<R: Rng + ?Sized>(peers: &[PeerInfo], limit: usize, rng: &mut R) -> Vec<PeerInfo> {
    let (mut outbound, mut inbound): (Vec<PeerInfo>, Vec<PeerInfo>) = peers
        .iter()
        .cloned()
        .partition(|p| p.connection_kind == ConnectionKind::Outbound);
    outbound.shuffle(rng);
    inbound.shuffle(rng);

    let (smaller, larger) = if outbound.len() <= inbound.len() {
        (outbound, inbound)
    } else {
        (inbound, outbound)
    };

    let half = limit.div_ceil(2);
    let from_smaller = half.min(smaller.len());
    let from_larger = (limit - from_smaller).min(larger.len());

    let mut selected: Vec<PeerInfo> = smaller.into_iter().take(from_smaller).collect();
    selected.extend(larger.into_iter().take(from_larger));
    selected
}

/// Choose outbound connection targets from the tried and new lists
///
/// Each draw favours the tried list with probability
/// `max(|tried| / (|tried| + |new|), 0.5)` and falls back to the other list
/// when the preferred one is exhausted.
pub fn select_for_connection<R: Rng + ?Sized>(
    tried: &[PeerInfo],
    new: &[PeerInfo],
    limit: Option<isize>,
    rng: &mut R,
) -> Vec<PeerInfo> {
    if limit.is_some_and(|l| l < 0) {
        return Vec::new();
    }
    let total = tried.len() + new.len();
    if total == 0 {
        return Vec::new();
    }

    let limit = match limit {
        Some(l) if (l as usize) < total => l as usize,
        _ => {
            let mut all = new.to_vec();
            all.extend_from_slice(tried);
            return all;
        }
    };

    let mut tried_pool = tried.to_vec();
    let mut new_pool = new.to_vec();
    tried_pool.shuffle(rng);
    new_pool.shuffle(rng);

    let ratio = (tried.len() as f64 / total as f64).max(MIN_TRIED_RATIO);
    let mut selected = Vec::with_capacity(limit);

    for _ in 0..limit {
        let prefer_tried = rng.gen_bool(ratio);
        let (first, second) = if prefer_tried {
            (&mut tried_pool, &mut new_pool)
        } else {
            (&mut new_pool, &mut tried_pool)
        };
        match first.pop().or_else(|| second.pop()) {
            Some(peer) => selected.push(peer),
            None => break,
        }
    }

    selected
}
