//! The piece-request ledger: a concurrency-safe map from `(peer, piece)` to
//! the outstanding request for it.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{PeerId, PieceIndex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Expired,
    Invalid,
    Unsent,
}

#[derive(Clone, Debug)]
pub struct PieceRequest {
    pub peer: PeerId,
    pub index: PieceIndex,
    pub sent_at: Instant,
    pub status: RequestStatus,
}

/// The piece-request ledger. Keyed by `(peer, index)`, not index alone:
/// endgame deliberately allows more than one `Pending` entry for the same
/// piece, one per peer it was reserved from, and each is owned exclusively
/// by its peer — cleared only by a successful write, by that peer's feed
/// terminating, or by a later call from that same peer. A single-peer key
/// would let one peer's reservation silently evict another's still-in-flight
/// entry, along with its claim on that peer's pipeline budget.
pub struct PieceRequestManager {
    timeout: Duration,
    pipeline_limit: usize,
    entries: Mutex<HashMap<(PeerId, PieceIndex), PieceRequest>>,
}

impl PieceRequestManager {
    pub fn new(timeout: Duration, pipeline_limit: usize) -> Self {
        Self {
            timeout,
            pipeline_limit,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Selects indices to request from `peer` out of `candidates`, inserting
    /// a `Pending` ledger entry for each one returned.
    pub fn reserve_pieces(
        &self,
        peer: PeerId,
        candidates: impl Iterator<Item = PieceIndex>,
        endgame: bool,
    ) -> Vec<PieceIndex> {
        let mut entries = self.entries.lock().unwrap();

        let in_flight_for_peer = entries
            .values()
            .filter(|e| e.peer == peer && e.status == RequestStatus::Pending)
            .count();
        let mut budget = self.pipeline_limit.saturating_sub(in_flight_for_peer);

        let mut candidates: Vec<PieceIndex> = candidates.collect();
        candidates.sort_unstable();

        let mut reserved = Vec::new();
        for index in candidates {
            if budget == 0 {
                break;
            }

            // this peer already holds a Pending entry for this index
            if entries
                .get(&(peer, index))
                .map_or(false, |e| e.status == RequestStatus::Pending)
            {
                continue;
            }

            // outside endgame, at most one Pending entry per index across
            // all peers; in endgame, distinct peers may each hold one
            if !endgame
                && entries
                    .values()
                    .any(|e| e.index == index && e.status == RequestStatus::Pending)
            {
                continue;
            }

            entries.insert(
                (peer, index),
                PieceRequest {
                    peer,
                    index,
                    sent_at: Instant::now(),
                    status: RequestStatus::Pending,
                },
            );
            reserved.push(index);
            budget -= 1;
        }
        reserved
    }

    pub fn mark_unsent(&self, peer: PeerId, index: PieceIndex) {
        self.retag(peer, index, RequestStatus::Unsent);
    }

    pub fn mark_invalid(&self, peer: PeerId, index: PieceIndex) {
        self.retag(peer, index, RequestStatus::Invalid);
    }

    fn retag(&self, peer: PeerId, index: PieceIndex, status: RequestStatus) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&(peer, index)) {
            entry.status = status;
        }
    }

    /// Reclassifies any `Pending` entry older than `timeout` as `Expired`,
    /// then extracts and returns every entry in a terminal failure state.
    pub fn get_failed_requests(&self) -> Vec<PieceRequest> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        for entry in entries.values_mut() {
            if entry.status == RequestStatus::Pending
                && now.duration_since(entry.sent_at) >= self.timeout
            {
                entry.status = RequestStatus::Expired;
            }
        }
        let failed: Vec<(PeerId, PieceIndex)> = entries
            .iter()
            .filter(|(_, e)| e.status != RequestStatus::Pending)
            .map(|(key, _)| *key)
            .collect();
        failed
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }

    /// Removes every entry for `index`, regardless of which peer holds it —
    /// once a piece is written, no other peer's in-flight or failed
    /// reservation for it is worth keeping around.
    pub fn clear(&self, index: PieceIndex) {
        self.entries.lock().unwrap().retain(|_, e| e.index != index);
    }

    pub fn clear_peer(&self, peer: PeerId) {
        self.entries.lock().unwrap().retain(|_, e| e.peer != peer);
    }

    /// O(1) emptiness check, exposed so callers don't need to iterate the
    /// ledger just to test whether anything is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        [b; 20]
    }

    #[test]
    fn reserve_respects_pipeline_limit() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 2);
        let reserved =
            manager.reserve_pieces(peer(1), (0..10).into_iter(), false);
        assert_eq!(reserved, vec![0, 1]);
    }

    #[test]
    fn reserve_skips_pending_entries_outside_endgame() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 5);
        manager.reserve_pieces(peer(1), [0, 1].iter().copied(), false);
        let reserved =
            manager.reserve_pieces(peer(2), [0, 1, 2].iter().copied(), false);
        assert_eq!(reserved, vec![2]);
    }

    #[test]
    fn endgame_allows_duplicate_assignment_to_different_peer() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 5);
        manager.reserve_pieces(peer(1), [0].iter().copied(), true);
        let reserved = manager.reserve_pieces(peer(2), [0].iter().copied(), true);
        assert_eq!(reserved, vec![0]);
    }

    #[test]
    fn endgame_skips_reassigning_to_same_peer() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 5);
        manager.reserve_pieces(peer(1), [0].iter().copied(), true);
        let reserved = manager.reserve_pieces(peer(1), [0].iter().copied(), true);
        assert!(reserved.is_empty());
    }

    /// Regression test for the bug where an index-only key let a second
    /// peer's endgame duplicate silently evict the first peer's still
    /// outstanding entry, and with it the pipeline budget it was holding.
    #[test]
    fn endgame_duplicate_reservation_preserves_first_peers_pipeline_accounting() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 1);
        let first = manager.reserve_pieces(peer(1), [0].iter().copied(), true);
        assert_eq!(first, vec![0]);

        let second = manager.reserve_pieces(peer(2), [0].iter().copied(), true);
        assert_eq!(second, vec![0]);

        // peer 1's pipeline limit of 1 is still spent on its original entry
        // for index 0, so a distinct candidate is not reserved for it
        let third = manager.reserve_pieces(peer(1), [1].iter().copied(), true);
        assert!(third.is_empty());
    }

    #[test]
    fn expired_entries_surface_in_failed_requests() {
        let manager = PieceRequestManager::new(Duration::from_millis(1), 5);
        manager.reserve_pieces(peer(1), [0].iter().copied(), false);
        std::thread::sleep(Duration::from_millis(5));
        let failed = manager.get_failed_requests();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, RequestStatus::Expired);
        // extraction removes the entry, so a retry can reserve it again
        let reserved =
            manager.reserve_pieces(peer(2), [0].iter().copied(), false);
        assert_eq!(reserved, vec![0]);
    }

    #[test]
    fn clear_peer_removes_only_its_entries() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 5);
        manager.reserve_pieces(peer(1), [0].iter().copied(), false);
        manager.reserve_pieces(peer(2), [1].iter().copied(), false);
        manager.clear_peer(peer(1));
        let reserved =
            manager.reserve_pieces(peer(3), [0, 1].iter().copied(), false);
        assert_eq!(reserved, vec![0]);
    }

    #[test]
    fn clear_removes_single_index() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 5);
        manager.reserve_pieces(peer(1), [0].iter().copied(), false);
        manager.clear(0);
        let reserved =
            manager.reserve_pieces(peer(2), [0].iter().copied(), false);
        assert_eq!(reserved, vec![0]);
    }

    #[test]
    fn clear_removes_entries_for_every_peer_holding_the_index() {
        let manager = PieceRequestManager::new(Duration::from_secs(30), 5);
        manager.reserve_pieces(peer(1), [0].iter().copied(), true);
        manager.reserve_pieces(peer(2), [0].iter().copied(), true);
        manager.clear(0);
        assert!(manager.is_empty());
    }
}
