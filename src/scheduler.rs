//! Choking policy and piece assignment.
//!
//! The two halves are independent: [`Scheduler::choose_unchokes`] decides,
//! once per epoch, which peers we upload to; [`Scheduler::assign_piece`]
//! decides, whenever a peer becomes free, which piece it should be asked to
//! help with next. Both are pure functions over summaries the engine
//! gathers from its [`crate::peer::PeerConnection`]s, so they can be unit
//! tested without any socket involved.

use std::{collections::HashMap, net::SocketAddr};

use rand::seq::SliceRandom;

use crate::{conf::PieceSelection, conf::TorrentConf, Bitfield, PieceIndex};

/// The number of peers kept unchoked purely by tit-for-tat ranking (the
/// "top four").
const TIT_FOR_TAT_SLOTS: usize = 4;

/// The upload allotment, in bytes, given under proportional-share to a peer
/// with no epoch receipts yet (e.g. the optimistic unchoke), so it isn't
/// starved of any allotment at all before it has a chance to reciprocate.
const PROPORTIONAL_SHARE_FLOOR: u64 = 2 * crate::BLOCK_LEN as u64;

/// The subset of a peer's state the scheduler needs to make its decisions.
#[derive(Clone, Debug)]
pub struct PeerSummary {
    pub addr: SocketAddr,
    pub bytes_received_epoch: u64,
    pub is_interested: bool,
    pub is_choked_by_us: bool,
    pub bitfield: Bitfield,
    pub has_assigned_piece: bool,
}

pub struct Scheduler {
    piece_selection: PieceSelection,
    num_rarest_pieces: usize,
    endgame_threshold: f64,
    pub is_endgame: bool,
}

impl Scheduler {
    pub fn new(conf: &TorrentConf) -> Self {
        Self {
            piece_selection: conf.piece_selection,
            num_rarest_pieces: conf.num_rarest_pieces,
            endgame_threshold: conf.endgame_threshold,
            is_endgame: false,
        }
    }

    /// Updates endgame status given the overall verified-completion
    /// percentage, returning true if this call newly entered endgame mode.
    pub fn update_endgame(&mut self, percent_complete: f64) -> bool {
        if !self.is_endgame
            && self.endgame_threshold < 100.0
            && percent_complete >= self.endgame_threshold
        {
            self.is_endgame = true;
            true
        } else {
            false
        }
    }

    /// Chooses which peers to keep or newly unchoke this epoch.
    ///
    /// Under the default and rarest-first/random piece-selection strategies,
    /// this is tit-for-tat: the top [`TIT_FOR_TAT_SLOTS`] interested peers by
    /// bytes received from them last epoch, plus one additional peer chosen
    /// at random from the rest (the "optimistic unchoke"), to give new peers
    /// a chance to prove themselves.
    ///
    /// Under [`PieceSelection::ProportionalShare`], the top-four cutoff is
    /// dropped: every peer that sent us a non-zero number of bytes last
    /// epoch is unchoked, plus one optimistic unchoke among the rest, and
    /// each unchoked peer is returned with an upload allotment (in bytes)
    /// proportional to what it sent us — [`PROPORTIONAL_SHARE_FLOOR`] for
    /// one that sent nothing yet. Every other strategy returns `None`
    /// (unbounded) for all of them.
    pub fn choose_unchokes(&self, peers: &[PeerSummary]) -> Vec<(SocketAddr, Option<u64>)> {
        if peers.is_empty() {
            return Vec::new();
        }

        let mut ranked: Vec<&PeerSummary> =
            peers.iter().filter(|p| p.is_interested).collect();
        ranked.sort_by_key(|p| std::cmp::Reverse(p.bytes_received_epoch));

        let mut unchoked: Vec<SocketAddr> = match self.piece_selection {
            PieceSelection::ProportionalShare => ranked
                .iter()
                .filter(|p| p.bytes_received_epoch > 0)
                .map(|p| p.addr)
                .collect(),
            _ => ranked
                .iter()
                .take(TIT_FOR_TAT_SLOTS)
                .map(|p| p.addr)
                .collect(),
        };

        let rest: Vec<&PeerSummary> = peers
            .iter()
            .filter(|p| !unchoked.contains(&p.addr))
            .collect();
        if let Some(lucky) = rest.choose(&mut rand::thread_rng()) {
            unchoked.push(lucky.addr);
        }

        match self.piece_selection {
            PieceSelection::ProportionalShare => {
                let bytes_received: HashMap<SocketAddr, u64> =
                    peers.iter().map(|p| (p.addr, p.bytes_received_epoch)).collect();
                unchoked
                    .into_iter()
                    .map(|addr| {
                        let bytes = bytes_received.get(&addr).copied().unwrap_or(0);
                        let allotment = if bytes > 0 {
                            bytes
                        } else {
                            PROPORTIONAL_SHARE_FLOOR
                        };
                        (addr, Some(allotment))
                    })
                    .collect()
            }
            _ => unchoked.into_iter().map(|addr| (addr, None)).collect(),
        }
    }

    /// Counts, for each piece index, how many peers in `bitfields` have it.
    pub fn compute_rarity(
        bitfields: impl Iterator<Item = Bitfield>,
        piece_count: usize,
    ) -> Vec<u32> {
        let mut counts = vec![0u32; piece_count];
        for bitfield in bitfields {
            for (index, has) in bitfield.iter().enumerate().take(piece_count) {
                if *has {
                    counts[index] += 1;
                }
            }
        }
        counts
    }

    /// Picks the next piece to assign to a peer advertising `peer_bitfield`,
    /// given the set of pieces still missing overall and their rarity, per
    /// the configured [`PieceSelection`] strategy.
    pub fn assign_piece(
        &self,
        peer_bitfield: &Bitfield,
        missing: &[PieceIndex],
        rarity: &[u32],
    ) -> Option<PieceIndex> {
        let candidates: Vec<PieceIndex> = missing
            .iter()
            .copied()
            .filter(|&index| peer_bitfield.get(index).map(|b| *b).unwrap_or(false))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        match self.piece_selection {
            PieceSelection::Default => candidates.first().copied(),
            PieceSelection::Random | PieceSelection::ProportionalShare => {
                candidates.choose(&mut rand::thread_rng()).copied()
            }
            PieceSelection::RarestFirst => {
                let mut ranked = candidates.clone();
                ranked.sort_by_key(|&index| rarity.get(index).copied().unwrap_or(0));
                let pool: Vec<PieceIndex> =
                    ranked.into_iter().take(self.num_rarest_pieces).collect();
                pool.choose(&mut rand::thread_rng()).copied()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn conf() -> TorrentConf {
        TorrentConf::new(PathBuf::from("/tmp"))
    }

    fn peer(addr: &str, bytes: u64, interested: bool) -> PeerSummary {
        PeerSummary {
            addr: addr.parse().unwrap(),
            bytes_received_epoch: bytes,
            is_interested: interested,
            is_choked_by_us: true,
            bitfield: Bitfield::repeat(true, 4),
            has_assigned_piece: false,
        }
    }

    #[test]
    fn unchokes_top_four_interested_peers_plus_one_optimistic() {
        let scheduler = Scheduler::new(&conf());
        let peers = vec![
            peer("127.0.0.1:1", 500, true),
            peer("127.0.0.1:2", 400, true),
            peer("127.0.0.1:3", 300, true),
            peer("127.0.0.1:4", 200, true),
            peer("127.0.0.1:5", 100, true),
            peer("127.0.0.1:6", 50, false),
        ];
        let unchoked = scheduler.choose_unchokes(&peers);
        // top 4 by bytes received plus one optimistic unchoke
        assert_eq!(unchoked.len(), 5);
        let addrs: Vec<SocketAddr> = unchoked.iter().map(|(addr, _)| *addr).collect();
        for addr in ["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3", "127.0.0.1:4"] {
            assert!(addrs.contains(&addr.parse().unwrap()));
        }
        // the default strategy never allots; serving stays unbounded.
        assert!(unchoked.iter().all(|(_, allotment)| allotment.is_none()));
    }

    #[test]
    fn proportional_share_unchokes_every_peer_with_nonzero_bytes() {
        let mut conf = conf();
        conf.piece_selection = PieceSelection::ProportionalShare;
        let scheduler = Scheduler::new(&conf);
        let peers = vec![
            peer("127.0.0.1:1", 500, true),
            peer("127.0.0.1:2", 400, true),
            peer("127.0.0.1:3", 300, true),
            peer("127.0.0.1:4", 200, true),
            peer("127.0.0.1:5", 100, true),
            peer("127.0.0.1:6", 0, true),
        ];
        let unchoked = scheduler.choose_unchokes(&peers);
        // every peer with nonzero bytes received, plus one optimistic unchoke
        // among the rest (which may or may not be the zero-byte peer).
        assert!(unchoked.len() >= 5);
        let by_addr: HashMap<SocketAddr, Option<u64>> = unchoked.into_iter().collect();
        for (addr, bytes) in [
            ("127.0.0.1:1", 500),
            ("127.0.0.1:2", 400),
            ("127.0.0.1:3", 300),
            ("127.0.0.1:4", 200),
            ("127.0.0.1:5", 100),
        ] {
            // proportional-share allots exactly what the peer sent us.
            assert_eq!(by_addr.get(&addr.parse().unwrap()), Some(&Some(bytes)));
        }
    }

    #[test]
    fn proportional_share_gives_the_floor_allotment_to_a_zero_byte_optimistic_unchoke() {
        let mut conf = conf();
        conf.piece_selection = PieceSelection::ProportionalShare;
        let scheduler = Scheduler::new(&conf);
        let peers = vec![peer("127.0.0.1:1", 0, true)];

        let unchoked = scheduler.choose_unchokes(&peers);
        assert_eq!(unchoked.len(), 1);
        assert_eq!(unchoked[0], ("127.0.0.1:1".parse().unwrap(), Some(PROPORTIONAL_SHARE_FLOOR)));
    }

    #[test]
    fn compute_rarity_counts_peers_with_piece() {
        let mut a = Bitfield::repeat(false, 3);
        a.set(0, true);
        let mut b = Bitfield::repeat(false, 3);
        b.set(0, true);
        b.set(1, true);
        let rarity = Scheduler::compute_rarity(vec![a, b].into_iter(), 3);
        assert_eq!(rarity, vec![2, 1, 0]);
    }

    #[test]
    fn default_strategy_picks_first_candidate() {
        let scheduler = Scheduler::new(&conf());
        let bitfield = Bitfield::repeat(true, 4);
        let missing = vec![2, 3];
        let rarity = vec![0; 4];
        assert_eq!(
            scheduler.assign_piece(&bitfield, &missing, &rarity),
            Some(2)
        );
    }

    #[test]
    fn assign_piece_returns_none_when_peer_has_no_missing_piece() {
        let scheduler = Scheduler::new(&conf());
        let bitfield = Bitfield::repeat(false, 4);
        let missing = vec![0, 1, 2];
        let rarity = vec![0; 4];
        assert_eq!(scheduler.assign_piece(&bitfield, &missing, &rarity), None);
    }

    #[test]
    fn endgame_activates_past_threshold() {
        let mut conf = conf();
        conf.endgame_threshold = 90.0;
        let mut scheduler = Scheduler::new(&conf);
        assert!(!scheduler.update_endgame(80.0));
        assert!(!scheduler.is_endgame);
        assert!(scheduler.update_endgame(95.0));
        assert!(scheduler.is_endgame);
    }
}
