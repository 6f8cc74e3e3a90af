//! In-memory assembly and verification of a single torrent piece.
//!
//! A [`Piece`] only ever holds block buffers in memory; it has no notion of
//! a file or a file offset. Once all its blocks have arrived and the hash
//! matches, it hands the assembled, verified bytes back to its caller
//! ([`crate::disk::BlockStore`]), which owns the file handle and performs
//! the actual write. This keeps hashing/buffering logic decoupled from disk
//! IO and is easy to unit test without touching the filesystem.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash};

/// The result of feeding a freshly received block into a piece.
#[derive(Debug)]
pub enum AddBlockOutcome {
    /// This block offset was already filled; the new data was ignored.
    Duplicate,
    /// The block was recorded; the piece is not yet complete.
    Accepted,
    /// The piece's last missing block was just filled and the resulting
    /// whole-piece hash matches the expected hash. Carries the piece's
    /// contiguous, verified payload for the caller to write to disk.
    Completed(Vec<u8>),
    /// The piece's last missing block was just filled but the whole-piece
    /// hash does not match; all progress on the piece has been discarded and
    /// it must be downloaded again from scratch.
    HashFailed,
}

/// An in-progress (or already verified) piece download.
///
/// Tracks which blocks have arrived, which are currently outstanding
/// requests (and when they were made, so that they can be timed out and
/// re-requested), and whether the piece has been fully verified.
#[derive(Debug)]
pub struct Piece {
    /// The index of this piece within the torrent.
    pub index: PieceIndex,
    /// The length of the whole piece, in bytes.
    pub len: u32,
    /// The expected SHA-1 hash of the piece, taken from the metainfo.
    pub expected_hash: Sha1Hash,
    /// Successfully received blocks, keyed by their byte offset within the
    /// piece. Sorted so that the pieces can be concatenated in order once
    /// complete.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// Outstanding block requests, keyed by offset, mapped to the instant
    /// the request was made.
    pending_requests: BTreeMap<u32, Instant>,
    /// Set once the piece has been fully downloaded and its hash verified.
    is_complete: bool,
    /// Whether this piece has entered endgame mode, in which case
    /// [`Piece::next_request`] may return blocks that already have an
    /// outstanding (but unfulfilled) request, to race multiple peers for the
    /// torrent's last few pieces.
    pub is_endgame: bool,
}

impl Piece {
    /// Creates a new, empty piece download.
    pub fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        Self {
            index,
            len,
            expected_hash,
            blocks: BTreeMap::new(),
            pending_requests: BTreeMap::new(),
            is_complete: false,
            is_endgame: false,
        }
    }

    /// Returns true once all blocks have arrived and the piece hash has been
    /// verified.
    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Returns the percentage (0-100) of the piece's bytes downloaded so
    /// far.
    pub fn download_percent(&self) -> f64 {
        if self.is_complete {
            return 100.0;
        }
        let downloaded: u32 = self.blocks.values().map(|b| b.len() as u32).sum();
        downloaded as f64 / self.len as f64 * 100.0
    }

    /// Returns the next block to request, if any, honoring `request_timeout`
    /// as the point at which an outstanding request is considered lost and
    /// eligible for a retry.
    ///
    /// Outside endgame, a block with an outstanding, not-yet-timed-out
    /// request is never returned twice. In endgame mode, blocks that are
    /// still missing are returned regardless of whether they already have a
    /// pending request, so that they can be requested from more than one
    /// peer at once.
    pub fn next_request(
        &mut self,
        now: Instant,
        request_timeout: Duration,
    ) -> Option<BlockInfo> {
        if self.is_complete {
            return None;
        }
        for block_index in 0..block_count(self.len) {
            let offset = block_index as u32 * crate::BLOCK_LEN;
            if self.blocks.contains_key(&offset) {
                continue;
            }
            let needs_request = match self.pending_requests.get(&offset) {
                None => true,
                Some(requested_at) => {
                    self.is_endgame || now.duration_since(*requested_at) >= request_timeout
                }
            };
            if needs_request {
                self.pending_requests.insert(offset, now);
                return Some(BlockInfo {
                    piece_index: self.index,
                    offset,
                    len: block_len(self.len, block_index),
                });
            }
        }
        None
    }

    /// Records a received block.
    ///
    /// If this was the piece's last missing block, the whole piece is
    /// hashed: on success the piece is marked complete and its contiguous
    /// bytes are returned for the caller to persist; on failure all
    /// in-memory progress is discarded so the piece can be attempted again.
    pub fn add_block(&mut self, offset: u32, data: Vec<u8>) -> AddBlockOutcome {
        if self.is_complete || self.blocks.contains_key(&offset) {
            return AddBlockOutcome::Duplicate;
        }

        self.pending_requests.remove(&offset);
        self.blocks.insert(offset, data);

        if self.blocks.len() != block_count(self.len) {
            return AddBlockOutcome::Accepted;
        }

        let mut buf = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            buf.extend_from_slice(block);
        }

        let digest = Sha1::digest(&buf);
        if digest.as_slice() == self.expected_hash {
            self.is_complete = true;
            self.blocks.clear();
            self.pending_requests.clear();
            AddBlockOutcome::Completed(buf)
        } else {
            log::warn!("piece {} failed hash verification", self.index);
            self.blocks.clear();
            self.pending_requests.clear();
            AddBlockOutcome::HashFailed
        }
    }

    /// Marks the piece as complete without going through block assembly,
    /// used when resuming a download whose completion bitfield already
    /// reports this piece as present on disk.
    pub fn set_complete_from_prior_download(&mut self) {
        self.is_complete = true;
        self.blocks.clear();
        self.pending_requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    #[test]
    fn completes_on_last_matching_block() {
        let data = vec![7u8; crate::BLOCK_LEN as usize];
        let hash = hash_of(&data);
        let mut piece = Piece::new(0, data.len() as u32, hash);

        let outcome = piece.add_block(0, data.clone());
        assert!(matches!(outcome, AddBlockOutcome::Completed(ref buf) if *buf == data));
        assert!(piece.is_complete());
        assert_eq!(piece.download_percent(), 100.0);
    }

    #[test]
    fn detects_hash_mismatch_and_resets() {
        let data = vec![7u8; crate::BLOCK_LEN as usize];
        let wrong_hash = hash_of(&[0u8; 4]);
        let mut piece = Piece::new(0, data.len() as u32, wrong_hash);

        let outcome = piece.add_block(0, data);
        assert!(matches!(outcome, AddBlockOutcome::HashFailed));
        assert!(!piece.is_complete());
        assert_eq!(piece.download_percent(), 0.0);
    }

    #[test]
    fn duplicate_block_is_ignored() {
        let len = 2 * crate::BLOCK_LEN;
        let data = vec![1u8; len as usize];
        let hash = hash_of(&data);
        let mut piece = Piece::new(0, len, hash);

        let first = vec![1u8; crate::BLOCK_LEN as usize];
        assert!(matches!(
            piece.add_block(0, first.clone()),
            AddBlockOutcome::Accepted
        ));
        assert!(matches!(
            piece.add_block(0, first),
            AddBlockOutcome::Duplicate
        ));
    }

    #[test]
    fn next_request_skips_recently_requested_blocks() {
        let len = 2 * crate::BLOCK_LEN;
        let mut piece = Piece::new(0, len, [0; 20]);

        let now = Instant::now();
        let timeout = Duration::from_secs(1);
        let first = piece.next_request(now, timeout).unwrap();
        assert_eq!(first.offset, 0);
        let second = piece.next_request(now, timeout).unwrap();
        assert_eq!(second.offset, crate::BLOCK_LEN);
        assert!(piece.next_request(now, timeout).is_none());
    }

    #[test]
    fn next_request_retries_after_timeout() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN, [0; 20]);
        let now = Instant::now();
        let timeout = Duration::from_millis(1);

        assert!(piece.next_request(now, timeout).is_some());
        let later = now + Duration::from_millis(10);
        assert!(piece.next_request(later, timeout).is_some());
    }

    #[test]
    fn endgame_allows_duplicate_outstanding_requests() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN, [0; 20]);
        piece.is_endgame = true;
        let now = Instant::now();
        let timeout = Duration::from_secs(1);

        assert!(piece.next_request(now, timeout).is_some());
        // Without endgame mode this would be None, since the request is
        // still within its timeout.
        assert!(piece.next_request(now, timeout).is_some());
    }
}
