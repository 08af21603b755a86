//! The block assembler & verifier.
//!
//! Accumulates a piece's block fragments, deduplicates by offset, and
//! verifies SHA-1 integrity once a piece is fully received. This is
//! deliberately synchronous and IO-free, unlike [`crate::disk`], so its
//! invariants (pairwise-disjoint offsets, hash-gated completion) can be
//! driven deterministically in tests without a runtime. The torrent
//! controller is the sole owner of this ledger, shared across peer
//! sessions behind an `Arc<RwLock<_>>` the same way [`crate::piece_picker`]
//! already is; once a piece verifies, its bytes are handed to
//! [`crate::disk`] for the actual file write.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::{PieceIndex, Sha1Hash};

/// What happened to a block just handed to the assembler.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BlockOutcome {
    /// The piece was already complete; the block is dropped.
    AlreadyComplete,
    /// A fragment at this offset already exists. The new one is dropped;
    /// per spec this is equivalent to acceptance from the caller's point
    /// of view (the download should carry on requesting the next block)
    /// since it only arises from the scheduler's fallback phase handing
    /// the same piece to more than one peer.
    Duplicate,
    /// The block was appended; the piece is still incomplete.
    Accepted,
    /// The block completed the piece.
    Completed(PieceCompletion),
}

/// The result of finalizing a piece once all its blocks have arrived.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PieceCompletion {
    /// The concatenated bytes matched the expected SHA-1 hash.
    Valid(Vec<u8>),
    /// The hash didn't match. The piece's fragments are discarded and the
    /// piece becomes available to claim again (see `DESIGN.md`'s
    /// resolution of the spec's open question on hash-mismatch policy).
    Invalid,
}

/// The in-progress fragment ledger for a single incomplete piece.
struct PieceLedger {
    /// Received fragments, keyed by their offset within the piece. A
    /// `BTreeMap` keeps them ordered for finalization without a separate
    /// sort step.
    fragments: BTreeMap<u32, Vec<u8>>,
}

impl PieceLedger {
    fn new() -> Self {
        Self {
            fragments: BTreeMap::new(),
        }
    }

    fn received_len(&self) -> u32 {
        self.fragments.values().map(|b| b.len() as u32).sum()
    }
}

/// Owns, per piece, either the in-progress fragment ledger or a marker
/// that the piece is complete and verified.
pub(crate) struct PieceAssembler {
    ledgers: Vec<Option<PieceLedger>>,
    completed: Vec<bool>,
    piece_lens: Vec<u32>,
    piece_hashes: Vec<Sha1Hash>,
}

impl PieceAssembler {
    /// Creates a new assembler for a torrent whose pieces have the given
    /// lengths and expected SHA-1 hashes (both indexed by piece index).
    pub fn new(piece_lens: Vec<u32>, piece_hashes: Vec<Sha1Hash>) -> Self {
        debug_assert_eq!(piece_lens.len(), piece_hashes.len());
        let piece_count = piece_lens.len();
        Self {
            ledgers: (0..piece_count).map(|_| Some(PieceLedger::new())).collect(),
            completed: vec![false; piece_count],
            piece_lens,
            piece_hashes,
        }
    }

    /// Returns whether piece `index` has been verified complete.
    pub fn is_piece_complete(&self, index: PieceIndex) -> bool {
        self.completed[index]
    }

    /// Returns whether every piece in the torrent has been verified.
    pub fn is_complete(&self) -> bool {
        self.completed.iter().all(|&c| c)
    }

    /// Hands a newly received block to the assembler.
    ///
    /// Follows spec §4.5 exactly: a block for an already-complete piece is
    /// dropped; a duplicate offset is dropped; otherwise the fragment is
    /// appended, and if it completes the piece, the piece is hashed and
    /// finalized.
    pub fn add_block(
        &mut self,
        index: PieceIndex,
        begin: u32,
        block: Vec<u8>,
    ) -> BlockOutcome {
        if self.completed[index] {
            return BlockOutcome::AlreadyComplete;
        }

        let ledger = self.ledgers[index]
            .as_mut()
            .expect("incomplete piece must have a ledger");
        if ledger.fragments.contains_key(&begin) {
            return BlockOutcome::Duplicate;
        }
        ledger.fragments.insert(begin, block);

        if ledger.received_len() == self.piece_lens[index] {
            BlockOutcome::Completed(self.finalize(index))
        } else {
            BlockOutcome::Accepted
        }
    }

    /// Concatenates a fully-received piece's fragments and verifies its
    /// hash, storing the verified bytes on success or discarding the
    /// fragments (making the piece claimable again) on mismatch.
    fn finalize(&mut self, index: PieceIndex) -> PieceCompletion {
        let ledger = self.ledgers[index]
            .take()
            .expect("finalizing a piece without a ledger");

        let mut bytes = Vec::with_capacity(self.piece_lens[index] as usize);
        for (_, fragment) in ledger.fragments {
            bytes.extend_from_slice(&fragment);
        }

        let digest = Sha1::digest(&bytes);

        if digest.as_slice() == self.piece_hashes[index] {
            self.completed[index] = true;
            PieceCompletion::Valid(bytes)
        } else {
            log::warn!("Piece {} failed hash verification", index);
            self.ledgers[index] = Some(PieceLedger::new());
            PieceCompletion::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    #[test]
    fn accepts_out_of_order_fragments_and_finalizes() {
        let data = b"ABCDEFGH".to_vec();
        let mut assembler = PieceAssembler::new(vec![8], vec![sha1(&data)]);

        assert_eq!(
            assembler.add_block(0, 4, data[4..].to_vec()),
            BlockOutcome::Accepted
        );
        match assembler.add_block(0, 0, data[..4].to_vec()) {
            BlockOutcome::Completed(PieceCompletion::Valid(bytes)) => {
                assert_eq!(bytes, data)
            }
            other => panic!("expected valid completion, got {:?}", other),
        }
        assert!(assembler.is_piece_complete(0));
        assert!(assembler.is_complete());
    }

    #[test]
    fn drops_duplicate_fragment_at_same_offset() {
        let data = b"ABCDEFGH".to_vec();
        let mut assembler = PieceAssembler::new(vec![8], vec![sha1(&data)]);
        assembler.add_block(0, 0, data[..4].to_vec());
        assert_eq!(
            assembler.add_block(0, 0, vec![b'X'; 4]),
            BlockOutcome::Duplicate
        );
    }

    #[test]
    fn drops_blocks_for_already_complete_piece() {
        let data = b"AAAA".to_vec();
        let mut assembler = PieceAssembler::new(vec![4], vec![sha1(&data)]);
        assembler.add_block(0, 0, data);
        assert_eq!(
            assembler.add_block(0, 0, vec![b'Z'; 4]),
            BlockOutcome::AlreadyComplete
        );
    }

    #[test]
    fn hash_mismatch_discards_fragments_and_allows_retry() {
        let mut assembler = PieceAssembler::new(vec![4], vec![[0xFF; 20]]);
        match assembler.add_block(0, 0, b"AAAA".to_vec()) {
            BlockOutcome::Completed(PieceCompletion::Invalid) => {}
            other => panic!("expected invalid completion, got {:?}", other),
        }
        assert!(!assembler.is_piece_complete(0));
        // the piece is claimable again: a fresh fragment at the same
        // offset is accepted rather than treated as a duplicate
        assert_eq!(
            assembler.add_block(0, 0, b"BBBB".to_vec()),
            BlockOutcome::Accepted
        );
    }

    #[test]
    fn multi_block_piece_completes_after_all_fragments() {
        let data: Vec<u8> = (0..20u8).collect();
        let mut assembler = PieceAssembler::new(vec![20], vec![sha1(&data)]);
        assert_eq!(
            assembler.add_block(0, 0, data[0..8].to_vec()),
            BlockOutcome::Accepted
        );
        assert_eq!(
            assembler.add_block(0, 8, data[8..16].to_vec()),
            BlockOutcome::Accepted
        );
        match assembler.add_block(0, 16, data[16..20].to_vec()) {
            BlockOutcome::Completed(PieceCompletion::Valid(bytes)) => {
                assert_eq!(bytes, data)
            }
            other => panic!("expected valid completion, got {:?}", other),
        }
    }
}
