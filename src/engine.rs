//! The single-threaded event loop that drives a torrent download (and,
//! optionally, the subsequent seeding).
//!
//! `Client` owns every peer connection, the tracker client and the on-disk
//! [`crate::disk::BlockStore`]. Each call to [`Client::tick`] makes one
//! round of progress: accept inbound connections, dial outbound ones,
//! drive every peer's non-blocking IO, dispatch newly decoded messages,
//! assign piece requests, and, once per epoch, re-run the choking
//! algorithm and re-announce to the tracker. No peer gets a task of its
//! own; everything here is cooperative.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use futures::FutureExt;
use tokio::net::TcpListener;

use crate::{
    conf::Conf,
    disk::{BlockStore, WriteBlockOutcome},
    error::*,
    metainfo::Metainfo,
    peer::{codec::Message, PeerConnection},
    scheduler::{PeerSummary, Scheduler},
    storage_info::StorageInfo,
    tracker::{AnnounceParams, Event as TrackerEvent, Tracker},
    BlockInfo, Sha1Hash,
};

/// Ties together the tracker, the disk store, the scheduler and every peer
/// connection for a single torrent.
pub struct Client {
    conf: Conf,
    info_hash: Sha1Hash,
    storage: StorageInfo,
    store: BlockStore,
    tracker: Tracker,
    scheduler: Scheduler,
    listener: TcpListener,
    peers: HashMap<SocketAddr, PeerConnection>,
    epoch_start: Instant,
    last_announce: Instant,
    announce_interval: Duration,
    sent_started: bool,
    sent_completed: bool,
}

impl Client {
    /// Opens the torrent's `BlockStore`, validates its announce URL, and
    /// binds the listening socket, but does not yet contact the tracker or
    /// connect to any peer; call [`Client::run`] for that.
    pub async fn new(conf: Conf, metainfo: Metainfo) -> Result<Self> {
        let info_hash = metainfo.info_hash()?;
        let storage = StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
        let store = BlockStore::open(&metainfo, conf.torrent.download_dir.clone(), conf.torrent.clean)?;
        let tracker = Tracker::new(&metainfo.announce, info_hash, conf.engine.client_id)?;
        let scheduler = Scheduler::new(&conf.torrent);

        let listener = TcpListener::bind(("0.0.0.0", conf.engine.port)).await?;
        log::info!("Listening for peer connections on port {}", conf.engine.port);

        let announce_interval = conf.torrent.announce_interval;
        Ok(Self {
            conf,
            info_hash,
            storage,
            store,
            tracker,
            scheduler,
            listener,
            peers: HashMap::new(),
            epoch_start: Instant::now(),
            last_announce: Instant::now() - announce_interval,
            announce_interval,
            sent_started: false,
            sent_completed: false,
        })
    }

    /// Runs the torrent to completion (or forever, if configured to seed
    /// afterwards), returning once the process should exit.
    pub async fn run(&mut self) -> Result<()> {
        let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

        loop {
            if ctrl_c.as_mut().now_or_never().is_some() {
                log::info!("Received shutdown signal");
                break;
            }

            self.accept_inbound()?;
            self.connect_outbound();
            self.poll_peers()?;
            self.update_interest();
            self.dispatch_requests()?;
            self.send_keepalives()?;

            if self.epoch_start.elapsed() >= self.conf.torrent.epoch_duration {
                self.run_epoch().await?;
            }

            if self.store.is_complete() && !self.conf.torrent.seed_after_completion {
                log::info!("Download complete, exiting");
                break;
            }

            // Yield to the runtime between ticks instead of busy-spinning a
            // core; short enough not to visibly delay request dispatch.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.shutdown().await
    }

    /// Accepts any inbound connections waiting on the listening socket, up
    /// to the configured connected-peer cap.
    fn accept_inbound(&mut self) -> Result<()> {
        while self.peers.len() < self.conf.torrent.max_connected_peer_count {
            match self.listener.accept().now_or_never() {
                Some(Ok((stream, addr))) => {
                    log::info!("Accepted inbound connection from {}", addr);
                    let conn = PeerConnection::inbound(
                        addr,
                        stream,
                        self.conf.engine.client_id,
                        self.info_hash,
                    );
                    self.peers.insert(addr, conn);
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        Ok(())
    }

    /// Begins connecting to known peers that aren't yet connected or
    /// in-flight, up to the connected-peer cap.
    fn connect_outbound(&mut self) {
        let budget = self
            .conf
            .torrent
            .max_connected_peer_count
            .saturating_sub(self.peers.len());
        let mut started = 0;
        for conn in self.peers.values_mut() {
            if started >= budget {
                break;
            }
            if conn.state == crate::peer::State::Idle {
                if conn.connection_attempts >= self.conf.torrent.max_connection_attempts {
                    continue;
                }
                conn.begin_connect();
                started += 1;
            }
        }
    }

    /// Adds newly discovered peer addresses from a tracker announce,
    /// skipping any we're already tracking.
    fn add_discovered_peers(&mut self, addrs: Vec<SocketAddr>) {
        for addr in addrs {
            self.peers.entry(addr).or_insert_with(|| {
                PeerConnection::outbound(addr, self.conf.engine.client_id, self.info_hash)
            });
        }
    }

    /// Drives every peer connection's non-blocking IO forward by one step
    /// and dispatches whatever messages that produced.
    fn poll_peers(&mut self) -> Result<()> {
        let mut dead = Vec::new();
        let mut events: Vec<(SocketAddr, Vec<Message>)> = Vec::new();

        for (addr, conn) in self.peers.iter_mut() {
            if conn.state == crate::peer::State::Disconnected {
                dead.push(*addr);
                continue;
            }
            match conn.poll() {
                Ok(msgs) => {
                    if conn.state == crate::peer::State::Disconnected {
                        dead.push(*addr);
                    } else if conn.is_connected()
                        && conn.is_timed_out(Instant::now(), self.conf.torrent.peer_inactivity_timeout)
                    {
                        log::info!("Peer {} timed out", addr);
                        dead.push(*addr);
                    } else if !msgs.is_empty() {
                        events.push((*addr, msgs));
                    }
                }
                Err(e) => {
                    log::debug!("Peer {} IO error: {}", addr, e);
                    dead.push(*addr);
                }
            }
        }

        for addr in dead {
            let Some(conn) = self.peers.get_mut(&addr) else { continue };
            // An outbound peer under its attempt cap keeps its slot and its
            // attempt count, reset to `Idle` so `connect_outbound` redials
            // it; everything else (inbound peers, or outbound peers that
            // have exhausted their attempts) is dropped for good.
            if conn.is_outbound() && conn.connection_attempts < self.conf.torrent.max_connection_attempts {
                conn.reset_for_retry();
            } else {
                self.peers.remove(&addr);
            }
        }

        for (addr, msgs) in events {
            for msg in msgs {
                self.handle_message(addr, msg)?;
            }
        }

        Ok(())
    }

    fn handle_message(&mut self, addr: SocketAddr, msg: Message) -> Result<()> {
        let piece_count = self.storage.piece_count;
        let Some(conn) = self.peers.get_mut(&addr) else {
            return Ok(());
        };

        match msg {
            Message::KeepAlive => {}
            Message::Choke => conn.peer_choking = true,
            Message::Unchoke => conn.peer_choking = false,
            Message::Interested => conn.peer_interested = true,
            Message::NotInterested => conn.peer_interested = false,
            Message::Have(index) => {
                if index as usize >= conn.remote_bitfield.len() {
                    conn.remote_bitfield.resize(piece_count, false);
                }
                if let Some(mut bit) = conn.remote_bitfield.get_mut(index as usize) {
                    *bit = true;
                }
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(piece_count, false);
                conn.remote_bitfield = bitfield;
            }
            Message::Request(info) => {
                if conn.am_choking {
                    log::trace!("Ignoring request from choked state by peer {}", addr);
                } else {
                    conn.incoming_requests.push_back(info);
                }
            }
            Message::Piece { index, begin, block } => {
                let len = block.len() as u32;
                conn.bytes_received_epoch += len as u64;
                conn.outgoing_requests.retain(|r| {
                    !(r.info.piece_index == index as usize && r.info.offset == begin)
                });
                let info = BlockInfo {
                    piece_index: index as usize,
                    offset: begin,
                    len,
                };
                match self.store.write_block(info, block)? {
                    WriteBlockOutcome::PieceCompleted(piece_index) => {
                        self.broadcast_have(piece_index)?;
                    }
                    WriteBlockOutcome::PieceHashMismatch(piece_index) => {
                        log::warn!("Piece {} failed verification, will retry", piece_index);
                    }
                    WriteBlockOutcome::Duplicate | WriteBlockOutcome::Accepted => {}
                }
            }
            Message::Cancel(info) => {
                if let Some(conn) = self.peers.get_mut(&addr) {
                    conn.incoming_requests.retain(|r| *r != info);
                }
            }
        }
        Ok(())
    }

    /// Sends a `have` message to every connected peer, letting them know we
    /// now possess `piece_index`.
    fn broadcast_have(&mut self, piece_index: crate::PieceIndex) -> Result<()> {
        for conn in self.peers.values_mut() {
            if conn.is_active() {
                conn.send(Message::Have(piece_index as u32))?;
            }
        }
        Ok(())
    }

    /// Marks ourselves interested in any peer that has at least one piece we
    /// are missing, and not interested otherwise.
    fn update_interest(&mut self) {
        let missing: Vec<_> = self.store.missing_pieces().collect();
        for conn in self.peers.values_mut() {
            if !conn.is_active() {
                continue;
            }
            let has_wanted_piece = missing
                .iter()
                .any(|&index| conn.remote_bitfield.get(index).map(|b| *b).unwrap_or(false));
            if has_wanted_piece && !conn.am_interested {
                conn.am_interested = true;
                let _ = conn.send(Message::Interested);
            } else if !has_wanted_piece && conn.am_interested {
                conn.am_interested = false;
                let _ = conn.send(Message::NotInterested);
            }
        }
    }

    /// Assigns missing pieces to unchoked, interested peers without one yet,
    /// then fills each active peer's outstanding request queue up to the
    /// configured cap, and serves any requests peers have made of us.
    fn dispatch_requests(&mut self) -> Result<()> {
        let missing: Vec<_> = self.store.missing_pieces().collect();
        let rarity = Scheduler::compute_rarity(
            self.peers.values().map(|c| c.remote_bitfield.clone()),
            self.storage.piece_count,
        );

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in &addrs {
            let needs_assignment = {
                let conn = &self.peers[addr];
                conn.is_active() && !conn.peer_choking && conn.am_interested && conn.assigned_piece.is_none()
            };
            if needs_assignment {
                let piece = {
                    let conn = &self.peers[addr];
                    self.scheduler.assign_piece(&conn.remote_bitfield, &missing, &rarity)
                };
                if let Some(index) = piece {
                    self.peers.get_mut(addr).unwrap().assigned_piece = Some(index);
                }
            }
        }

        let now = Instant::now();
        let timeout = self.conf.torrent.piece_request_timeout;
        let max_outstanding = self.conf.torrent.max_peer_outstanding_requests;
        let is_endgame = self.scheduler.is_endgame;

        for addr in &addrs {
            let (assigned, outstanding) = {
                let conn = &self.peers[addr];
                (conn.assigned_piece, conn.outgoing_requests.len())
            };
            let Some(piece_index) = assigned else { continue };
            if outstanding >= max_outstanding {
                continue;
            }
            let Some(piece) = self.store.piece_mut(piece_index) else { continue };
            piece.is_endgame = is_endgame;

            let mut requests = Vec::new();
            for _ in outstanding..max_outstanding {
                match piece.next_request(now, timeout) {
                    Some(info) => requests.push(info),
                    None => break,
                }
            }
            if requests.is_empty() && piece.is_complete() {
                self.peers.get_mut(addr).unwrap().assigned_piece = None;
            }
            if let Some(conn) = self.peers.get_mut(addr) {
                for info in requests {
                    conn.outgoing_requests.push_back(crate::peer::OutgoingRequest {
                        info,
                        requested_at: now,
                    });
                    conn.send(Message::Request(info))?;
                }
            }
        }

        // Serve requests peers have made of us, honoring a per-peer upload
        // allotment when one is set (proportional-share): requests that
        // would exceed the remaining budget stay queued for a later epoch
        // rather than being dropped.
        for addr in &addrs {
            let (requests, allotment) = {
                let conn = self.peers.get_mut(addr).unwrap();
                (std::mem::take(&mut conn.incoming_requests), conn.allotment)
            };

            let mut remaining = allotment;
            let mut serve = Vec::new();
            let mut deferred = std::collections::VecDeque::new();
            for info in requests {
                match remaining {
                    Some(budget) if info.len as u64 > budget => deferred.push_back(info),
                    Some(budget) => {
                        remaining = Some(budget - info.len as u64);
                        serve.push(info);
                    }
                    None => serve.push(info),
                }
            }

            for info in serve {
                let data = self.store.read_block(info)?;
                if let Some(conn) = self.peers.get_mut(addr) {
                    conn.send(Message::Piece {
                        index: info.piece_index as u32,
                        begin: info.offset,
                        block: data,
                    })?;
                }
            }

            if let Some(conn) = self.peers.get_mut(addr) {
                conn.incoming_requests.extend(deferred);
                conn.allotment = remaining;
            }
        }

        Ok(())
    }

    fn send_keepalives(&mut self) -> Result<()> {
        let now = Instant::now();
        for conn in self.peers.values_mut() {
            if conn.is_active() {
                conn.send_keepalive_if_needed(now)?;
            }
        }
        Ok(())
    }

    /// Runs the once-per-epoch maintenance: choking transitions, endgame
    /// activation, and a tracker re-announce if due.
    async fn run_epoch(&mut self) -> Result<()> {
        log::debug!("Establishing new epoch");

        let summaries: Vec<PeerSummary> = self
            .peers
            .iter()
            .filter(|(_, c)| c.is_active())
            .map(|(addr, c)| PeerSummary {
                addr: *addr,
                bytes_received_epoch: c.bytes_received_epoch,
                is_interested: c.peer_interested,
                is_choked_by_us: c.am_choking,
                bitfield: c.remote_bitfield.clone(),
                has_assigned_piece: c.assigned_piece.is_some(),
            })
            .collect();

        let to_unchoke: HashMap<SocketAddr, Option<u64>> =
            self.scheduler.choose_unchokes(&summaries).into_iter().collect();
        for conn in self.peers.values_mut() {
            if !conn.is_active() {
                continue;
            }
            match to_unchoke.get(&conn.addr) {
                Some(allotment) => {
                    if conn.am_choking {
                        conn.am_choking = false;
                        let _ = conn.send(Message::Unchoke);
                    }
                    conn.allotment = *allotment;
                }
                None => {
                    if !conn.am_choking {
                        conn.am_choking = true;
                        let _ = conn.send(Message::Choke);
                    }
                    conn.allotment = None;
                }
            }
            conn.bytes_received_epoch = 0;
            conn.bytes_sent_epoch = 0;
        }

        let percent_complete = self.store.bytes_downloaded() as f64 / self.storage.download_len as f64 * 100.0;
        if self.scheduler.update_endgame(percent_complete) {
            log::info!("Entering endgame mode at {:.1}% complete", percent_complete);
        }

        log::info!(
            "{:.1}% downloaded, {} peers connected",
            percent_complete,
            self.peers.len()
        );

        self.epoch_start = Instant::now();

        if self.last_announce.elapsed() >= self.announce_interval {
            self.reannounce().await?;
        }

        Ok(())
    }

    async fn reannounce(&mut self) -> Result<()> {
        let event = if !self.sent_started {
            TrackerEvent::Started
        } else if self.store.is_complete() && !self.sent_completed {
            TrackerEvent::Completed
        } else {
            TrackerEvent::None
        };

        match self.announce(event).await {
            Ok(response) => {
                self.announce_interval = response.interval;
                self.add_discovered_peers(response.peers);
            }
            Err(e) => {
                // Per the design, repeated tracker failures don't abort the
                // download; we simply log and retry at the next interval.
                log::warn!("Tracker announce failed: {}", e);
            }
        }
        self.last_announce = Instant::now();
        Ok(())
    }

    async fn announce(&mut self, event: TrackerEvent) -> Result<crate::tracker::AnnounceResponse> {
        let params = AnnounceParams {
            uploaded: self.store.bytes_uploaded(),
            downloaded: self.store.bytes_downloaded(),
            left: self.store.bytes_left(),
            port: self.conf.engine.port,
            event,
        };
        let response = self.tracker.announce(params).await?;
        match event {
            TrackerEvent::Started => self.sent_started = true,
            TrackerEvent::Completed => self.sent_completed = true,
            _ => {}
        }
        Ok(response)
    }

    /// Flushes the completion bitfield to disk, tells the tracker we're
    /// leaving the swarm, and drops the listening socket.
    async fn shutdown(&mut self) -> Result<()> {
        log::info!("Shutting down");
        self.store.flush_bitfield()?;
        if let Err(e) = self.announce(TrackerEvent::Stopped).await {
            log::warn!("Failed to notify tracker of shutdown: {}", e);
        }
        Ok(())
    }

    /// The address the engine is listening for inbound peer connections on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The number of currently tracked peer connections (connecting,
    /// handshaking or active).
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The tracked state of a given peer, if we still have an entry for it.
    pub fn peer_state(&self, addr: SocketAddr) -> Option<crate::peer::State> {
        self.peers.get(&addr).map(|c| c.state)
    }
}
