//! A single peer connection.
//!
//! [`PeerConnection`] is a plain state machine plus a pair of byte buffers;
//! it performs no blocking IO and spawns no task of its own. The engine
//! event loop (see [`crate::engine`]) owns every connection and, once per
//! tick, asks each one to make progress: fill its read buffer via
//! `try_read`, decode whatever complete frames that yields, and drain its
//! write buffer via `try_write`. This is what keeps the whole client
//! single-threaded: one `Client::tick` drives every peer in turn instead of
//! a task per peer.

pub mod codec;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures::task::noop_waker_ref;
use std::task::Context;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, BlockInfo, PeerId, Sha1Hash};

use self::codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// The state of a [`PeerConnection`], advancing strictly left to right save
/// for the terminal [`State::Disconnected`], which can be reached from any
/// other state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Not connected and no connection attempt in progress yet.
    Idle,
    /// A non-blocking `connect` is in flight.
    Connecting,
    /// The TCP connection is established; our handshake has not been sent
    /// yet.
    TcpEstablished,
    /// We've sent our handshake and are waiting for the peer's.
    HandshakeSent,
    /// We've received and validated the peer's handshake.
    HandshakeReceived,
    /// Past the handshake, waiting for the peer's first bitfield (or first
    /// non-bitfield message, which implicitly ends the window).
    BitfieldWindow,
    /// Steady state message exchange.
    Active,
    /// The connection has been torn down; this `PeerConnection` is done.
    Disconnected,
}

/// A block we are waiting on, together with when we asked for it so we can
/// give up and reassign it after a timeout.
#[derive(Clone, Copy, Debug)]
pub struct OutgoingRequest {
    pub info: BlockInfo,
    pub requested_at: Instant,
}

/// A peer connection, keyed by the remote's `(ip, port)`.
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub state: State,
    is_outbound: bool,
    stream: Option<TcpStream>,
    connect_fut: Option<
        std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<TcpStream>> + Send>>,
    >,

    read_buf: BytesMut,
    write_buf: BytesMut,

    our_peer_id: PeerId,
    info_hash: Sha1Hash,
    pub remote_peer_id: Option<PeerId>,

    /// The piece availability the peer has advertised.
    pub remote_bitfield: Bitfield,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// The piece currently assigned to this peer by the scheduler, if any.
    pub assigned_piece: Option<crate::PieceIndex>,

    /// Requests we've sent to the peer and are waiting to be served.
    pub outgoing_requests: VecDeque<OutgoingRequest>,
    /// Requests the peer has sent us and that we still owe a `piece` reply
    /// to.
    pub incoming_requests: VecDeque<BlockInfo>,

    pub last_activity: Instant,
    last_keepalive_sent: Instant,

    /// Bytes received from / sent to the peer during the current epoch,
    /// reset by the scheduler at the start of each new epoch.
    pub bytes_received_epoch: u64,
    pub bytes_sent_epoch: u64,

    /// Number of times we've attempted (and failed) to establish this
    /// outbound connection.
    pub connection_attempts: usize,

    /// Remaining upload budget, in bytes, for serving this peer's requests
    /// during the current epoch, under the proportional-share strategy.
    /// `None` means unbounded (the default strategy doesn't allot at all).
    pub allotment: Option<u64>,
}

impl PeerConnection {
    /// Creates a connection that still needs to be dialed.
    pub fn outbound(addr: SocketAddr, our_peer_id: PeerId, info_hash: Sha1Hash) -> Self {
        Self::new(addr, our_peer_id, info_hash, None, true)
    }

    /// Creates a connection from an already-accepted inbound socket.
    pub fn inbound(
        addr: SocketAddr,
        stream: TcpStream,
        our_peer_id: PeerId,
        info_hash: Sha1Hash,
    ) -> Self {
        Self::new(addr, our_peer_id, info_hash, Some(stream), false)
    }

    fn new(
        addr: SocketAddr,
        our_peer_id: PeerId,
        info_hash: Sha1Hash,
        stream: Option<TcpStream>,
        is_outbound: bool,
    ) -> Self {
        let state = if stream.is_some() {
            State::TcpEstablished
        } else {
            State::Idle
        };
        Self {
            addr,
            state,
            is_outbound,
            stream,
            connect_fut: None,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::with_capacity(32 * 1024),
            our_peer_id,
            info_hash,
            remote_peer_id: None,
            remote_bitfield: Bitfield::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            assigned_piece: None,
            outgoing_requests: VecDeque::new(),
            incoming_requests: VecDeque::new(),
            last_activity: Instant::now(),
            last_keepalive_sent: Instant::now(),
            bytes_received_epoch: 0,
            bytes_sent_epoch: 0,
            connection_attempts: 0,
            allotment: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            State::TcpEstablished
                | State::HandshakeSent
                | State::HandshakeReceived
                | State::BitfieldWindow
                | State::Active
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active)
    }

    pub fn is_outbound(&self) -> bool {
        self.is_outbound
    }

    /// Clears all transport and session state after a disconnect, putting
    /// the connection back to `Idle` so it can be redialed, while retaining
    /// the long-lived stats (`connection_attempts`) that bound how many
    /// times that's allowed to happen.
    pub fn reset_for_retry(&mut self) {
        self.state = State::Idle;
        self.stream = None;
        self.connect_fut = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.remote_peer_id = None;
        self.remote_bitfield = Bitfield::new();
        self.am_choking = true;
        self.am_interested = false;
        self.peer_choking = true;
        self.peer_interested = false;
        self.assigned_piece = None;
        self.outgoing_requests.clear();
        self.incoming_requests.clear();
        self.last_activity = Instant::now();
        self.last_keepalive_sent = Instant::now();
        self.bytes_received_epoch = 0;
        self.bytes_sent_epoch = 0;
        self.allotment = None;
    }

    /// Begins a non-blocking outbound connection attempt.
    pub fn begin_connect(&mut self) {
        debug_assert!(self.is_outbound);
        self.state = State::Connecting;
        self.connection_attempts += 1;
        let addr = self.addr;
        self.connect_fut = Some(Box::pin(async move { TcpStream::connect(addr).await }));
    }

    /// Sends our handshake over the just-established connection.
    fn send_handshake(&mut self) -> Result<()> {
        let handshake = Handshake::new(self.info_hash, self.our_peer_id);
        HandshakeCodec.encode(handshake, &mut self.write_buf)?;
        self.state = State::HandshakeSent;
        Ok(())
    }

    /// Drives this connection's non-blocking IO forward by one step: if a
    /// connect is in flight, poll it once; otherwise fill the read buffer,
    /// decode whatever frames are available, and drain the write buffer.
    /// Returns the messages decoded this tick.
    pub fn poll(&mut self) -> Result<Vec<Message>> {
        if let Some(fut) = self.connect_fut.as_mut() {
            let mut cx = Context::from_waker(noop_waker_ref());
            match fut.as_mut().poll(&mut cx) {
                std::task::Poll::Pending => return Ok(Vec::new()),
                std::task::Poll::Ready(Ok(stream)) => {
                    self.connect_fut = None;
                    self.stream = Some(stream);
                    self.state = State::TcpEstablished;
                }
                std::task::Poll::Ready(Err(e)) => {
                    log::debug!("Connect to {} failed: {}", self.addr, e);
                    self.connect_fut = None;
                    self.state = State::Disconnected;
                    return Ok(Vec::new());
                }
            }
        }

        if self.state == State::TcpEstablished && self.is_outbound {
            self.send_handshake()?;
        }

        let stream = match &self.stream {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };

        // Drain anything pending in the write buffer.
        while !self.write_buf.is_empty() {
            match stream.try_write(&self.write_buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        // Read as much as is available without blocking.
        loop {
            match stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    if !self.read_buf.is_empty() {
                        break;
                    }
                    self.state = State::Disconnected;
                    return Ok(Vec::new());
                }
                Ok(_) => {
                    self.last_activity = Instant::now();
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.decode_available()
    }

    fn decode_available(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        if matches!(
            self.state,
            State::TcpEstablished | State::HandshakeSent
        ) {
            if let Some(handshake) = HandshakeCodec.decode(&mut self.read_buf)? {
                if handshake.info_hash != self.info_hash {
                    log::warn!("Peer {} sent mismatched info hash", self.addr);
                    self.state = State::Disconnected;
                    return Ok(messages);
                }
                self.remote_peer_id = Some(handshake.peer_id);
                if !self.is_outbound {
                    self.send_handshake_reply()?;
                }
                self.state = State::BitfieldWindow;
            } else {
                return Ok(messages);
            }
        }

        while let Some(msg) = PeerCodec.decode(&mut self.read_buf)? {
            if self.state == State::BitfieldWindow {
                // The window closes on the very first post-handshake message,
                // bitfield or not; whichever it is, it's still accepted.
                self.state = State::Active;
                messages.push(msg);
            } else if matches!(msg, Message::Bitfield(_)) {
                log::debug!(
                    "Peer {} sent a bitfield outside its bitfield window; discarding",
                    self.addr
                );
            } else {
                messages.push(msg);
            }
        }

        Ok(messages)
    }

    /// As an inbound peer, reply to the initiator's handshake with our own.
    fn send_handshake_reply(&mut self) -> Result<()> {
        let handshake = Handshake::new(self.info_hash, self.our_peer_id);
        HandshakeCodec.encode(handshake, &mut self.write_buf)?;
        Ok(())
    }

    /// Queues a message to be sent on the next `poll`.
    pub fn send(&mut self, msg: Message) -> Result<()> {
        PeerCodec.encode(msg, &mut self.write_buf)?;
        Ok(())
    }

    /// Sends a keepalive if more than a minute has passed since the last
    /// one, per the protocol's 2-minute keepalive interval convention.
    pub fn send_keepalive_if_needed(&mut self, now: Instant) -> Result<()> {
        if now.duration_since(self.last_keepalive_sent) >= Duration::from_secs(60) {
            self.send(Message::KeepAlive)?;
            self.last_keepalive_sent = now;
        }
        Ok(())
    }

    /// Returns true if the peer has been silent for longer than `timeout`.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_outbound_connection_starts_idle() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let conn = PeerConnection::outbound(addr, [0; 20], [1; 20]);
        assert_eq!(conn.state, State::Idle);
        assert!(!conn.is_connected());
    }

    #[test]
    fn begin_connect_transitions_to_connecting() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut conn = PeerConnection::outbound(addr, [0; 20], [1; 20]);
        conn.begin_connect();
        assert_eq!(conn.state, State::Connecting);
        assert_eq!(conn.connection_attempts, 1);
    }

    #[test]
    fn is_timed_out_after_inactivity() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut conn = PeerConnection::outbound(addr, [0; 20], [1; 20]);
        conn.last_activity = Instant::now() - Duration::from_secs(200);
        assert!(conn.is_timed_out(Instant::now(), Duration::from_secs(120)));
    }

    #[test]
    fn bitfield_window_closes_on_first_message_of_any_kind() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut conn = PeerConnection::outbound(addr, [0; 20], [1; 20]);
        conn.state = State::BitfieldWindow;

        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();
        conn.read_buf.extend_from_slice(&buf);

        let msgs = conn.decode_available().unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], Message::Unchoke));
        assert_eq!(conn.state, State::Active);
    }

    #[test]
    fn bitfield_arriving_after_window_closed_is_discarded() {
        // Scenario 3: a BITFIELD sent after some other message must be
        // logged and dropped, leaving the remote bitfield untouched.
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut conn = PeerConnection::outbound(addr, [0; 20], [1; 20]);
        conn.state = State::Active;

        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(Bitfield::repeat(true, 8)), &mut buf)
            .unwrap();
        conn.read_buf.extend_from_slice(&buf);

        let msgs = conn.decode_available().unwrap();
        assert!(msgs.is_empty());
        assert_eq!(conn.state, State::Active);
        assert!(conn.remote_bitfield.is_empty());
    }

    #[test]
    fn bitfield_within_window_is_accepted_and_closes_window() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut conn = PeerConnection::outbound(addr, [0; 20], [1; 20]);
        conn.state = State::BitfieldWindow;

        let bitfield = Bitfield::repeat(true, 8);
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        conn.read_buf.extend_from_slice(&buf);

        let msgs = conn.decode_available().unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], Message::Bitfield(b) if *b == bitfield));
        assert_eq!(conn.state, State::Active);
    }

    #[test]
    fn reset_for_retry_clears_transport_but_keeps_attempt_count() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut conn = PeerConnection::outbound(addr, [0; 20], [1; 20]);
        conn.begin_connect();
        conn.begin_connect();
        conn.state = State::Disconnected;
        conn.remote_bitfield = Bitfield::repeat(true, 4);

        conn.reset_for_retry();

        assert_eq!(conn.state, State::Idle);
        assert_eq!(conn.connection_attempts, 2);
        assert!(conn.remote_bitfield.is_empty());
    }
}
