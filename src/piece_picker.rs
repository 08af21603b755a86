//! The piece scheduler.
//!
//! Chooses which piece a peer session should download next. The policy is
//! deliberately simple (not rarest-first, not optimal): it partitions work
//! across peers without any cross-peer coordination beyond a claim set per
//! piece, falling back to picking randomly among whatever a late-joining
//! peer can offer once every piece is already spoken for.

use std::{collections::HashSet, net::SocketAddr};

use rand::Rng;

use crate::{error::Result, Bitfield, PieceIndex};

/// Picks pieces to download and tracks, per piece, which peers have
/// claimed it.
///
/// Shared (behind a lock) by every peer session of a torrent, since the
/// "at most one peer per piece" invariant (outside of the fallback phase)
/// requires a single source of truth.
pub(crate) struct PiecePicker {
    /// Whether piece `i` has been fully downloaded and verified.
    completed: Vec<bool>,
    /// The peers that have claimed piece `i` as their current download.
    /// Left populated (not cleared) when a peer disconnects mid-piece: see
    /// the module-level docs in `torrent.rs` for why this is intentional.
    claims: Vec<HashSet<SocketAddr>>,
}

impl PiecePicker {
    /// Creates a new piece picker for a torrent with `piece_count` pieces,
    /// none of which are complete yet.
    pub fn new(piece_count: usize) -> Self {
        Self {
            completed: vec![false; piece_count],
            claims: vec![HashSet::new(); piece_count],
        }
    }

    /// Registers a peer's bitfield and returns whether we are interested
    /// in the peer, i.e. whether it has at least one piece we don't have
    /// yet.
    pub fn register_availability(
        &mut self,
        peer_has: &Bitfield,
    ) -> Result<bool> {
        let is_interested = (0..self.completed.len())
            .any(|i| !self.completed[i] && peer_has.get(i).map_or(false, |b| *b));
        Ok(is_interested)
    }

    /// Picks the next piece `claimant` should download, registering the
    /// claim, or returns `None` if `claimant`'s bitfield has nothing left
    /// to offer.
    ///
    /// Phase 1: the lowest incomplete, unclaimed piece that `claimant`
    /// has. Phase 2 (only if phase 1 finds nothing): a uniformly random
    /// incomplete piece that `claimant` has, regardless of existing
    /// claims. Phase 2 intentionally violates the at-most-one-claimant
    /// invariant; duplicate work is resolved by the block assembler
    /// deduplicating fragments by offset.
    pub fn pick_piece(
        &mut self,
        peer_has: &Bitfield,
        claimant: SocketAddr,
    ) -> Option<PieceIndex> {
        for i in 0..self.completed.len() {
            if !self.completed[i]
                && self.claims[i].is_empty()
                && peer_has.get(i).map_or(false, |b| *b)
            {
                self.claims[i].insert(claimant);
                return Some(i);
            }
        }

        let candidates: Vec<PieceIndex> = (0..self.completed.len())
            .filter(|&i| {
                !self.completed[i] && peer_has.get(i).map_or(false, |b| *b)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        self.claims[index].insert(claimant);
        Some(index)
    }

    /// Marks piece `index` as complete, clearing its claim set.
    pub fn received_piece(&mut self, index: PieceIndex) {
        self.completed[index] = true;
        self.claims[index].clear();
    }

    /// Releases `claimant`'s hold on piece `index` without marking it
    /// complete, so another peer may claim it in phase 1.
    ///
    /// Used both when a peer that had a piece in flight disconnects, and
    /// when a piece fails hash verification and is reopened for retry.
    pub fn release_claim(&mut self, index: PieceIndex, claimant: SocketAddr) {
        self.claims[index].remove(&claimant);
    }

    /// Clears every claimant of piece `index` without marking it complete.
    ///
    /// Used when a piece fails hash verification: every peer that
    /// contributed to the now-discarded fragments (relevant mainly in the
    /// fallback phase, where more than one peer may have claimed it) must
    /// be able to re-claim it.
    pub fn clear_claims(&mut self, index: PieceIndex) {
        self.claims[index].clear();
    }

    /// Returns true once every piece is complete.
    pub fn is_complete(&self) -> bool {
        self.completed.iter().all(|&c| c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn all_true(n: usize) -> Bitfield {
        let mut bf = Bitfield::repeat(false, n);
        for mut bit in bf.iter_mut() {
            *bit = true;
        }
        bf
    }

    #[test]
    fn phase_one_skips_claimed_pieces() {
        let mut picker = PiecePicker::new(2);
        let bitfield = all_true(2);
        // peer A claims the lowest unclaimed piece, which is piece 0
        assert_eq!(picker.pick_piece(&bitfield, addr(1)), Some(0));
        // peer B, arriving second, must skip piece 0 since it's claimed
        assert_eq!(picker.pick_piece(&bitfield, addr(2)), Some(1));
    }

    #[test]
    fn phase_two_falls_back_once_everything_is_claimed() {
        let mut picker = PiecePicker::new(1);
        let bitfield = all_true(1);
        assert_eq!(picker.pick_piece(&bitfield, addr(1)), Some(0));
        // the only piece is already claimed; phase 2 still offers it since
        // claims don't block the fallback
        assert_eq!(picker.pick_piece(&bitfield, addr(2)), Some(0));
    }

    #[test]
    fn returns_none_when_peer_has_nothing_useful() {
        let mut picker = PiecePicker::new(1);
        picker.received_piece(0);
        let bitfield = all_true(1);
        assert_eq!(picker.pick_piece(&bitfield, addr(1)), None);
    }

    #[test]
    fn received_piece_clears_claims_and_marks_complete() {
        let mut picker = PiecePicker::new(1);
        let bitfield = all_true(1);
        picker.pick_piece(&bitfield, addr(1));
        assert!(!picker.is_complete());
        picker.received_piece(0);
        assert!(picker.is_complete());
        // a completed piece is never picked again
        assert_eq!(picker.pick_piece(&bitfield, addr(2)), None);
    }

    #[test]
    fn release_claim_allows_phase_one_reassignment() {
        let mut picker = PiecePicker::new(1);
        let bitfield = all_true(1);
        assert_eq!(picker.pick_piece(&bitfield, addr(1)), Some(0));
        // without releasing, the piece is still claimed, so a second peer
        // only gets it via phase 2's fallback (which ignores claims)
        picker.release_claim(0, addr(1));
        // after release, a fresh claimant can still take it in phase 1
        // terms (claims are now empty again)
        assert_eq!(picker.pick_piece(&bitfield, addr(2)), Some(0));
    }

    #[test]
    fn register_availability_reports_interest() {
        let mut picker = PiecePicker::new(2);
        let mut bitfield = Bitfield::repeat(false, 2);
        *bitfield.get_mut(1).unwrap() = true;
        assert!(picker.register_availability(&bitfield).unwrap());
        picker.received_piece(1);
        assert!(!picker.register_availability(&bitfield).unwrap());
    }
}
