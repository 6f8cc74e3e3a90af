//! Parsing of `.torrent` metainfo files (single-file torrents only).

use crate::{error::*, Sha1Hash};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

/// The length of a single SHA-1 piece hash, in bytes.
const HASH_LEN: u64 = 20;

/// A parsed `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    /// Parses a metainfo instance from its raw bencoded byte form, checking
    /// that the announce URL, piece hash count and declared file length are
    /// mutually consistent.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        if !(self.info.pieces.len() as u64).is_multiple_of(HASH_LEN) {
            return Err(Error::InvalidMetainfo(format!(
                "pieces field length ({}) is not a multiple of {}",
                self.info.pieces.len(),
                HASH_LEN
            )));
        }
        let piece_count = self.piece_count();
        if piece_count == 0 {
            return Err(Error::InvalidMetainfo("torrent has no pieces".into()));
        }
        let full_pieces_len =
            (piece_count as u64 - 1) * self.info.piece_length;
        let last_piece_len = self.info.length - full_pieces_len;
        if last_piece_len == 0 || last_piece_len > self.info.piece_length {
            return Err(Error::InvalidMetainfo(
                "declared length, piece length and piece hash count are \
                 inconsistent"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Computes the 20 byte SHA-1 info-hash that uniquely identifies the
    /// torrent, by hashing the bencoded `info` dictionary byte-exactly as it
    /// appeared in the torrent file.
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns the number of pieces the torrent is split into.
    pub fn piece_count(&self) -> usize {
        (self.info.pieces.len() as u64 / HASH_LEN) as usize
    }

    /// Returns the SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let start = index * HASH_LEN as usize;
        let end = start + HASH_LEN as usize;
        let slice = self.info.pieces.get(start..end)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// The length of the single file in the torrent, in bytes.
    pub length: u64,
    pub private: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(piece_length: u64, length: u64, piece_count: usize) -> Info {
        Info {
            name: "foo".into(),
            pieces: ByteBuf::from(vec![0u8; piece_count * 20]),
            piece_length,
            length,
            private: None,
        }
    }

    #[test]
    fn validate_accepts_consistent_lengths() {
        // 3 full pieces of 16 plus a final 8 byte piece.
        let metainfo = Metainfo {
            announce: "http://example.com/announce".into(),
            info: make_info(16, 3 * 16 + 8, 4),
        };
        assert!(metainfo.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inconsistent_lengths() {
        // A last piece longer than the nominal piece length can't be real.
        let metainfo = Metainfo {
            announce: "http://example.com/announce".into(),
            info: make_info(16, 3 * 16 + 17, 4),
        };
        assert!(metainfo.validate().is_err());
    }

    #[test]
    fn info_hash_is_stable_for_same_info() {
        let metainfo = Metainfo {
            announce: "http://example.com/announce".into(),
            info: make_info(16, 3 * 16 + 8, 4),
        };
        let a = metainfo.info_hash().unwrap();
        let b = metainfo.info_hash().unwrap();
        assert_eq!(a, b);
    }
}
