//! Wire encoding and decoding of the handshake and the peer message stream.
//!
//! Both codecs are plain [`tokio_util::codec::{Encoder, Decoder}`]
//! implementations: they operate on an in-memory [`BytesMut`] buffer rather
//! than directly on an `AsyncRead`/`AsyncWrite` socket. [`super::PeerConnection`]
//! fills and drains that buffer itself via `try_read`/`try_write`, which lets
//! one task drive many peer connections without blocking on any single one.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, BlockInfo, PeerId, Sha1Hash};

/// The protocol string sent as part of the handshake, identifying this as a
/// BitTorrent v1 connection.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The 68 byte handshake message exchanged before any other communication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Length of the handshake message, in bytes: 1 + 19 + 8 + 20 + 20.
const HANDSHAKE_LEN: usize = 68;

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::InvalidMetainfo(format!(
                "invalid handshake protocol string length: {}",
                prot_len
            )));
        }

        if buf.len() < 1 + prot_len + 8 + 20 + 20 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// A parsed peer wire message, per the base BitTorrent protocol (BEP 3): no
/// extension or fast-peers messages are modeled.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel(BlockInfo),
}

/// The largest frame length (the length-prefix value, excluding the prefix
/// itself) we will accept: a full block plus the largest message header
/// (`piece`'s 9 bytes), rounded up to the buffer floor the framing contract
/// promises. A peer claiming a longer frame is violating the protocol
/// rather than just being slow, so it is disconnected instead of accepted
/// into an unbounded allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 + 13;

/// The on-the-wire message type tags, following the `id` byte of each
/// non-keepalive message.
#[repr(u8)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put_slice(&block);
            }
            Message::Cancel(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::InvalidMetainfo(format!(
                "frame length {} exceeds max of {}",
                len, MAX_FRAME_LEN
            )));
        }
        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = buf[0];
        let payload_len = len - 1;
        let msg = match id {
            x if x == MessageId::Choke as u8 => Message::Choke,
            x if x == MessageId::Unchoke as u8 => Message::Unchoke,
            x if x == MessageId::Interested as u8 => Message::Interested,
            x if x == MessageId::NotInterested as u8 => Message::NotInterested,
            x if x == MessageId::Have as u8 => {
                if payload_len != 4 {
                    return Err(invalid_len("have", payload_len));
                }
                let index = u32::from_be_bytes(buf[1..5].try_into().unwrap());
                buf.advance(1);
                Message::Have(index)
            }
            x if x == MessageId::Bitfield as u8 => {
                let bytes = buf[1..1 + payload_len].to_vec();
                buf.advance(1);
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            x if x == MessageId::Request as u8 => {
                if payload_len != 12 {
                    return Err(invalid_len("request", payload_len));
                }
                let info = read_block_info(&buf[1..13]);
                buf.advance(1);
                Message::Request(info)
            }
            x if x == MessageId::Piece as u8 => {
                if payload_len < 8 {
                    return Err(invalid_len("piece", payload_len));
                }
                let index = u32::from_be_bytes(buf[1..5].try_into().unwrap());
                let begin = u32::from_be_bytes(buf[5..9].try_into().unwrap());
                let block = buf[9..1 + payload_len].to_vec();
                buf.advance(1);
                Message::Piece { index, begin, block }
            }
            x if x == MessageId::Cancel as u8 => {
                if payload_len != 12 {
                    return Err(invalid_len("cancel", payload_len));
                }
                let info = read_block_info(&buf[1..13]);
                buf.advance(1);
                Message::Cancel(info)
            }
            other => {
                return Err(Error::InvalidMetainfo(format!(
                    "unknown message id {}",
                    other
                )))
            }
        };

        buf.advance(payload_len);

        Ok(Some(msg))
    }
}

fn invalid_len(kind: &str, len: usize) -> Error {
    Error::InvalidMetainfo(format!("invalid {} message length {}", kind, len))
}

fn read_block_info(buf: &[u8]) -> BlockInfo {
    BlockInfo {
        piece_index: u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize,
        offset: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        len: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::new([7; 20], [9; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_decode_waits_for_more_bytes() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..10]);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn simple_messages_round_trip() {
        for msg in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
        ] {
            let mut buf = BytesMut::new();
            PeerCodec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn request_round_trips() {
        let msg = Message::Request(BlockInfo {
            piece_index: 3,
            offset: crate::BLOCK_LEN,
            len: crate::BLOCK_LEN,
        });
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn piece_round_trips() {
        let msg = Message::Piece {
            index: 1,
            begin: 0,
            block: vec![1, 2, 3, 4],
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let msg = Message::Piece {
            index: 1,
            begin: 0,
            block: vec![0; 100],
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversize_frame_length_is_a_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN as u32 + 1);
        buf.put_u8(0); // a single byte of "payload" is enough to provoke the check
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn frame_length_at_the_max_is_accepted_as_in_progress() {
        // Right at the limit is not a violation; it's just incomplete until
        // the rest of the bytes arrive.
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN as u32);
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bitfield_round_trips() {
        // The wire form is byte-packed, so a bit count that isn't a multiple
        // of 8 comes back padded with trailing zero bits; the engine trims
        // it to the torrent's piece count after decoding.
        let mut bitfield = Bitfield::repeat(false, 20);
        bitfield.set(0, true);
        bitfield.set(19, true);
        let msg = Message::Bitfield(bitfield.clone());
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(mut decoded) => {
                decoded.truncate(20);
                assert_eq!(decoded, bitfield);
            }
            other => panic!("expected a bitfield message, got {:?}", other),
        }
    }
}
