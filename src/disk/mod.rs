//! Owns the on-disk file for the torrent's single file, the in-progress
//! piece downloads, and the persisted completion bitfield.
//!
//! This is deliberately the only place that touches the filesystem for the
//! torrent payload: [`crate::piece::Piece`] only ever assembles bytes in
//! memory and hands back a verified buffer, which `BlockStore` then writes
//! at the right offset.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use crate::{
    error::*,
    metainfo::Metainfo,
    piece::{AddBlockOutcome, Piece},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex,
};

/// Suffix appended to the file name while the download is still in
/// progress, to distinguish it from a completed, seedable file.
const IN_PROGRESS_SUFFIX: &str = ".part";
/// Suffix of the sidecar file that persists the completion bitfield across
/// restarts.
const BITFIELD_SUFFIX: &str = ".bitfield";

/// The outcome of submitting a received block to the store.
#[derive(Debug)]
pub enum WriteBlockOutcome {
    /// The block was a duplicate of already-held data; nothing changed.
    Duplicate,
    /// The block was recorded; its piece is not yet complete.
    Accepted,
    /// The block completed its piece, which verified successfully and was
    /// written to disk. Carries the piece index so the caller can broadcast
    /// a `have` message.
    PieceCompleted(PieceIndex),
    /// The block completed its piece, but the resulting hash did not match;
    /// the piece must be downloaded again.
    PieceHashMismatch(PieceIndex),
}

/// Owns the single torrent file and all piece bookkeeping.
pub struct BlockStore {
    info: StorageInfo,
    handle: File,
    /// In-progress and already-verified pieces, indexed by piece index.
    pieces: Vec<Piece>,
    /// Which pieces have been fully downloaded and verified.
    bitfield: Bitfield,
    /// Total bytes uploaded to other peers since the store was opened.
    uploaded: u64,
    path: PathBuf,
    bitfield_path: PathBuf,
    final_path: PathBuf,
}

impl BlockStore {
    /// Opens (or creates) the backing file for `metainfo` in `download_dir`,
    /// restoring progress from a previous run's bitfield sidecar file unless
    /// `clean` is set, in which case any previous progress is discarded.
    pub fn open(
        metainfo: &Metainfo,
        download_dir: PathBuf,
        clean: bool,
    ) -> Result<Self> {
        let info = StorageInfo::new(metainfo, download_dir);
        let final_path = info.file_path();
        let mut path = final_path.clone();
        path.set_file_name(format!(
            "{}{}",
            info.file_name, IN_PROGRESS_SUFFIX
        ));
        let mut bitfield_path = final_path.clone();
        bitfield_path.set_file_name(format!(
            "{}{}",
            info.file_name, BITFIELD_SUFFIX
        ));

        if clean {
            for p in [&path, &bitfield_path, &final_path] {
                if p.exists() {
                    log::info!("Removing existing artifact at {:?}", p);
                    fs::remove_file(p)?;
                }
            }
        }

        let mut pieces: Vec<Piece> = (0..info.piece_count)
            .map(|index| {
                let len = info.piece_len(index)?;
                let hash = metainfo.piece_hash(index).ok_or_else(|| {
                    Error::InvalidMetainfo(format!(
                        "missing piece hash for index {}",
                        index
                    ))
                })?;
                Ok(Piece::new(index, len, hash))
            })
            .collect::<Result<_>>()?;

        // If the final (completed) file already exists, treat the download
        // as already finished and seed from it directly.
        let (handle, is_already_complete) = if final_path.exists() {
            log::info!(
                "Found already completed download at {:?}; seeding",
                final_path
            );
            (
                OpenOptions::new().read(true).write(true).open(&final_path)?,
                true,
            )
        } else if path.exists() {
            log::debug!("Resuming in-progress download at {:?}", path);
            (
                OpenOptions::new().read(true).write(true).open(&path)?,
                false,
            )
        } else {
            log::debug!(
                "Creating new {} byte download file at {:?}",
                info.download_len,
                path
            );
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            handle.set_len(info.download_len)?;
            (handle, false)
        };

        let bitfield = if is_already_complete {
            for piece in pieces.iter_mut() {
                piece.set_complete_from_prior_download();
            }
            Bitfield::repeat(true, info.piece_count)
        } else {
            Self::load_bitfield(&bitfield_path, &mut pieces, info.piece_count)?
        };

        let path = if is_already_complete { final_path.clone() } else { path };

        Ok(Self {
            info,
            handle,
            pieces,
            bitfield,
            uploaded: 0,
            path,
            bitfield_path,
            final_path,
        })
    }

    /// Loads the persisted completion bitfield sidecar file, marking the
    /// corresponding pieces as already complete. If no sidecar exists, a
    /// fresh all-missing bitfield is created and persisted.
    fn load_bitfield(
        bitfield_path: &PathBuf,
        pieces: &mut [Piece],
        piece_count: usize,
    ) -> Result<Bitfield> {
        if bitfield_path.exists() {
            let mut raw = String::new();
            File::open(bitfield_path)?.read_to_string(&mut raw)?;
            let mut bitfield = Bitfield::with_capacity(piece_count);
            for (index, ch) in raw.trim().chars().enumerate() {
                let has = ch == '1';
                bitfield.push(has);
                if has {
                    if let Some(piece) = pieces.get_mut(index) {
                        piece.set_complete_from_prior_download();
                    }
                }
            }
            bitfield.resize(piece_count, false);
            log::info!("Resumed progress from bitfield sidecar at {:?}", bitfield_path);
            Ok(bitfield)
        } else {
            let bitfield = Bitfield::repeat(false, piece_count);
            Self::persist_bitfield(bitfield_path, &bitfield)?;
            Ok(bitfield)
        }
    }

    fn persist_bitfield(path: &PathBuf, bitfield: &Bitfield) -> Result<()> {
        let raw: String = bitfield
            .iter()
            .map(|bit| if *bit { '1' } else { '0' })
            .collect();
        let mut file = File::create(path)?;
        file.write_all(raw.as_bytes())?;
        Ok(())
    }

    /// Writes the completion bitfield to its sidecar file.
    pub fn flush_bitfield(&self) -> Result<()> {
        Self::persist_bitfield(&self.bitfield_path, &self.bitfield)
    }

    /// Returns our own bitfield, to send to newly connected peers.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Returns true if we have fully downloaded and verified the given
    /// piece.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.bitfield.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Returns true if the whole torrent is complete.
    pub fn is_complete(&self) -> bool {
        self.bitfield.all()
    }

    /// Returns an iterator over the indices of pieces we are still missing.
    pub fn missing_pieces(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.bitfield
            .iter()
            .enumerate()
            .filter(|(_, has)| !**has)
            .map(|(index, _)| index)
    }

    /// Gives mutable access to the in-progress piece at `index`, for the
    /// scheduler to pull the next block request from.
    pub fn piece_mut(&mut self, index: PieceIndex) -> Option<&mut Piece> {
        self.pieces.get_mut(index)
    }

    /// Returns the total number of bytes downloaded and verified so far.
    pub fn bytes_downloaded(&self) -> u64 {
        let missing: u64 = self
            .missing_pieces()
            .map(|index| self.info.piece_len(index).unwrap_or(0) as u64)
            .sum();
        self.info.download_len - missing
    }

    /// Returns the total number of bytes still left to download.
    pub fn bytes_left(&self) -> u64 {
        self.info.download_len - self.bytes_downloaded()
    }

    /// Returns the total number of bytes uploaded to peers so far.
    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded
    }

    /// Records a block received from a peer. If it completes a piece, the
    /// piece is hashed and, on success, written to disk at its offset.
    pub fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<WriteBlockOutcome> {
        let piece_index = info.piece_index;
        let piece = self
            .pieces
            .get_mut(piece_index)
            .ok_or(Error::InvalidPieceIndex)?;

        match piece.add_block(info.offset, data) {
            AddBlockOutcome::Duplicate => Ok(WriteBlockOutcome::Duplicate),
            AddBlockOutcome::Accepted => Ok(WriteBlockOutcome::Accepted),
            AddBlockOutcome::HashFailed => {
                Ok(WriteBlockOutcome::PieceHashMismatch(piece_index))
            }
            AddBlockOutcome::Completed(payload) => {
                let offset = self.info.piece_offset(piece_index);
                self.handle.seek(SeekFrom::Start(offset))?;
                self.handle.write_all(&payload)?;
                if let Some(mut bit) = self.bitfield.get_mut(piece_index) {
                    *bit = true;
                }
                log::info!(
                    "Piece {} verified and written ({}/{})",
                    piece_index,
                    self.bitfield.count_ones(),
                    self.info.piece_count
                );
                self.flush_bitfield()?;
                if self.is_complete() {
                    self.finalize()?;
                }
                Ok(WriteBlockOutcome::PieceCompleted(piece_index))
            }
        }
    }

    /// Reads a block of data from disk to answer a peer's request.
    pub fn read_block(&mut self, info: BlockInfo) -> Result<Vec<u8>> {
        let piece_offset = self.info.piece_offset(info.piece_index);
        let offset = piece_offset + info.offset as u64;
        let mut buf = vec![0; info.len as usize];
        self.handle.seek(SeekFrom::Start(offset))?;
        self.handle.read_exact(&mut buf)?;
        self.uploaded += buf.len() as u64;
        Ok(buf)
    }

    /// Renames the in-progress file to its final name and removes the
    /// bitfield sidecar, once the whole torrent is complete.
    fn finalize(&mut self) -> Result<()> {
        if self.path != self.final_path {
            fs::rename(&self.path, &self.final_path)?;
            self.path = self.final_path.clone();
        }
        if self.bitfield_path.exists() {
            fs::remove_file(&self.bitfield_path)?;
        }
        log::info!("Download complete: {:?}", self.final_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::Info, BLOCK_LEN};
    use sha1::Digest;
    use tempfile::tempdir;

    fn make_torrent(piece_len: u32, piece_count: usize, last_piece_len: u32) -> (Metainfo, Vec<Vec<u8>>) {
        let mut payloads = Vec::new();
        let mut pieces_concat = Vec::new();
        for index in 0..piece_count {
            let len = if index == piece_count - 1 {
                last_piece_len
            } else {
                piece_len
            };
            let payload = vec![index as u8; len as usize];
            let digest = sha1::Sha1::digest(&payload);
            pieces_concat.extend_from_slice(&digest);
            payloads.push(payload);
        }
        let length = (piece_count as u64 - 1) * piece_len as u64 + last_piece_len as u64;
        let metainfo = Metainfo {
            announce: "http://example.com/announce".into(),
            info: Info {
                name: "test-file".into(),
                pieces: serde_bytes::ByteBuf::from(pieces_concat),
                piece_length: piece_len as u64,
                length,
                private: None,
            },
        };
        (metainfo, payloads)
    }

    #[test]
    fn writes_and_reads_blocks_roundtrip() {
        let dir = tempdir().unwrap();
        let (metainfo, payloads) = make_torrent(BLOCK_LEN, 2, BLOCK_LEN / 2);
        let mut store =
            BlockStore::open(&metainfo, dir.path().to_path_buf(), false).unwrap();

        for (index, payload) in payloads.iter().enumerate() {
            let outcome = store
                .write_block(
                    BlockInfo {
                        piece_index: index,
                        offset: 0,
                        len: payload.len() as u32,
                    },
                    payload.clone(),
                )
                .unwrap();
            assert!(matches!(outcome, WriteBlockOutcome::PieceCompleted(_)));
        }

        assert!(store.is_complete());

        let read_back = store
            .read_block(BlockInfo {
                piece_index: 0,
                offset: 0,
                len: payloads[0].len() as u32,
            })
            .unwrap();
        assert_eq!(read_back, payloads[0]);
    }

    #[test]
    fn resumes_from_bitfield_sidecar() {
        let dir = tempdir().unwrap();
        let (metainfo, payloads) = make_torrent(BLOCK_LEN, 2, BLOCK_LEN / 2);
        {
            let mut store =
                BlockStore::open(&metainfo, dir.path().to_path_buf(), false)
                    .unwrap();
            store
                .write_block(
                    BlockInfo {
                        piece_index: 0,
                        offset: 0,
                        len: payloads[0].len() as u32,
                    },
                    payloads[0].clone(),
                )
                .unwrap();
        }

        let store =
            BlockStore::open(&metainfo, dir.path().to_path_buf(), false).unwrap();
        assert!(store.has_piece(0));
        assert!(!store.has_piece(1));
    }

    #[test]
    fn clean_discards_prior_progress() {
        let dir = tempdir().unwrap();
        let (metainfo, payloads) = make_torrent(BLOCK_LEN, 2, BLOCK_LEN / 2);
        {
            let mut store =
                BlockStore::open(&metainfo, dir.path().to_path_buf(), false)
                    .unwrap();
            store
                .write_block(
                    BlockInfo {
                        piece_index: 0,
                        offset: 0,
                        len: payloads[0].len() as u32,
                    },
                    payloads[0].clone(),
                )
                .unwrap();
        }

        let store =
            BlockStore::open(&metainfo, dir.path().to_path_buf(), true).unwrap();
        assert!(!store.has_piece(0));
    }
}
