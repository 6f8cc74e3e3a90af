use std::path::PathBuf;

use crate::{error::*, metainfo::Metainfo, PieceIndex};

/// Information about a torrent's storage details: the piece count and
/// length, download length, and destination path.
///
/// Since this engine only deals with single-file torrents, there is no file
/// intersection math to do here: a piece's bytes always live in the one
/// file, at `index * piece_len`.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The total length of the torrent's file, in bytes.
    pub download_len: u64,
    /// The path of the downloaded file, relative to the download directory.
    pub file_name: String,
    /// The download destination directory of the torrent.
    pub download_dir: PathBuf,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.info.length;
        let piece_len = metainfo.info.piece_length as u32;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file_name: metainfo.info.name.clone(),
            download_dir,
        }
    }

    /// Returns the full path of the downloaded file.
    pub fn file_path(&self) -> PathBuf {
        self.download_dir.join(&self.file_name)
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the byte offset of the piece at the given index within the
    /// file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(piece_count: usize, piece_len: u32, last_piece_len: u32) -> StorageInfo {
        let download_len =
            (piece_count as u64 - 1) * piece_len as u64 + last_piece_len as u64;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file_name: "foo".into(),
            download_dir: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn piece_len_returns_nominal_len_for_all_but_last() {
        let info = info(4, 16, 8);
        assert_eq!(info.piece_len(0).unwrap(), 16);
        assert_eq!(info.piece_len(1).unwrap(), 16);
        assert_eq!(info.piece_len(2).unwrap(), 16);
    }

    #[test]
    fn piece_len_returns_last_piece_len_for_final_piece() {
        let info = info(4, 16, 8);
        assert_eq!(info.piece_len(3).unwrap(), 8);
    }

    #[test]
    fn piece_len_errors_on_out_of_bounds_index() {
        let info = info(4, 16, 8);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn piece_offset_is_index_times_nominal_piece_len() {
        let info = info(4, 16, 8);
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(1), 16);
        assert_eq!(info.piece_offset(3), 48);
    }

    #[test]
    fn file_path_joins_dir_and_name() {
        let info = info(1, 16, 16);
        assert_eq!(info.file_path(), PathBuf::from("/tmp/foo"));
    }
}
