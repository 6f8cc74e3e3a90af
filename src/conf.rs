//! This module defines types used to configure the engine and its parts.
//!
//! The core never parses CLI flags itself; it receives a fully built
//! [`Conf`] from whatever thin external collaborator (the `torrentula`
//! binary's `clap` parser, in this repo) reads the user's wishes.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id, used if the caller does not provide one.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-TR0001-000000000000";

/// The default TCP port the engine listens for inbound peer connections on.
pub const DEFAULT_PORT: u16 = 6881;

/// Strategy for choosing which missing piece to assign to a freshly
/// unchoked, interested peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PieceSelection {
    /// First missing piece the peer's bitfield reports it has, biased to
    /// avoid assigning the same piece to more than one peer outside endgame.
    #[default]
    Default,
    /// Rarest-first: pick uniformly among the rarest pieces the peer has.
    RarestFirst,
    /// Uniformly random missing piece the peer has.
    Random,
    /// Proportional-share: peers that sent data last epoch get an upload
    /// allotment proportional to what they sent; unchoking follows the same
    /// proportional rule instead of top-four tit-for-tat.
    ProportionalShare,
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default client id, [`DEFAULT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *DEFAULT_CLIENT_ID,
                port: DEFAULT_PORT,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The TCP port the engine listens for inbound peer connections on.
    pub port: u16,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's file is placed upon download and
    /// from which it is seeded.
    pub download_dir: PathBuf,

    /// If true, remove any prior partial download and bitfield sidecar
    /// before starting.
    pub clean: bool,

    /// If true, keep the event loop running after completion to serve
    /// requests from other peers instead of exiting.
    pub seed_after_completion: bool,

    /// The minimum number of peers we want to keep in the torrent at all
    /// times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// How many peers to request from the tracker per announce.
    pub tracker_numwant: usize,

    /// If the tracker doesn't provide a minimum announce interval, we
    /// default to this.
    pub announce_interval: Duration,

    /// Disconnect a peer if nothing has been received from it in this long.
    pub peer_inactivity_timeout: Duration,

    /// Re-issue timeout for an outstanding block request.
    pub piece_request_timeout: Duration,

    /// Scheduling epoch duration for choking decisions and re-announces.
    pub epoch_duration: Duration,

    /// Max outstanding block requests per peer.
    pub max_peer_outstanding_requests: usize,

    /// Number of connection attempts allowed before a peer is dropped from
    /// the working set for good.
    pub max_connection_attempts: usize,

    /// Verified-completion percentage (0-100) at which endgame mode kicks in
    /// for all remaining pieces.
    pub endgame_threshold: f64,

    /// Number of rarest pieces to randomly choose among under the
    /// rarest-first strategy.
    pub num_rarest_pieces: usize,

    /// Which piece-assignment strategy the scheduler uses.
    pub piece_selection: PieceSelection,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            clean: false,
            seed_after_completion: false,
            min_requested_peer_count: 30,
            max_connected_peer_count: 55,
            tracker_numwant: 80,
            announce_interval: Duration::from_secs(30 * 60),
            peer_inactivity_timeout: Duration::from_secs(120),
            piece_request_timeout: Duration::from_secs(1),
            epoch_duration: Duration::from_secs(10),
            max_peer_outstanding_requests: 100,
            max_connection_attempts: 10,
            endgame_threshold: 95.0,
            num_rarest_pieces: 60,
            piece_selection: PieceSelection::default(),
        }
    }
}
