//! The BitTorrent peer wire protocol: the handshake and the length-prefixed
//! message stream that follows it.
//!
//! Two codecs are used in sequence on the same TCP stream, mirroring the
//! protocol itself: [`HandshakeCodec`] decodes/encodes exactly one
//! fixed-size handshake, after which the connection is handed over (buffer
//! and all, via `tokio_util::codec::FramedParts`) to [`PeerCodec`], which
//! decodes/encodes the rest of the session's length-prefixed messages.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::SessionError, BlockInfo, PeerId, PieceIndex, Sha1Hash};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 1 + PROTOCOL_STRING.len() + 8 + 20 + 20;

/// The initial, fixed-length message exchanged by both peers before any
/// other traffic. Its wire form never changes size, so it gets its own
/// dedicated codec rather than sharing [`PeerCodec`]'s framing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = SessionError;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let Handshake { info_hash, peer_id } = handshake;
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put(PROTOCOL_STRING);
        buf.put_u64(0); // 8 reserved bytes, no extensions are supported
        buf.put(&info_hash[..]);
        buf.put(&peer_id[..]);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = SessionError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let protocol_len = buf[0] as usize;
        let full_len = 1 + protocol_len + 8 + 20 + 20;
        if buf.len() < full_len {
            buf.reserve(full_len - buf.len());
            return Ok(None);
        }

        let mut buf = buf.split_to(full_len);
        buf.advance(1);
        let protocol = buf.split_to(protocol_len);
        if protocol != PROTOCOL_STRING {
            return Err(SessionError::InvalidProtocolString);
        }
        buf.advance(8); // reserved bytes, ignored

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[..20]);
        buf.advance(20);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[..20]);

        Ok(Some(Handshake::new(info_hash, peer_id)))
    }
}

/// A single message of the BEP3 peer wire protocol exchanged after the
/// handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(crate::Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// A message with an id outside the range this codec understands. The
    /// length-prefixed payload has already been consumed off the wire (so
    /// framing stays in sync); the caller just logs and drops it.
    Unknown(u8),
}

/// The single-byte message type tag that follows a message's length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    /// Returns `None` for an id this codec doesn't know, rather than an
    /// error: an unrecognized message id is not a protocol violation, just a
    /// message this peer doesn't speak, and §4.3 has the decoder skip its
    /// payload and carry on rather than tearing down the session.
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Block),
            8 => Some(Self::Cancel),
            _ => None,
        }
    }
}

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = SessionError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
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
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                // length = message id byte + payload, matching BEP3: the
                // original reference implementation this is derived from
                // miscounted this as just the payload length, dropping the
                // id byte.
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put(&bytes[..]);
            }
            Message::Request(block_info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block_info.piece_index as u32);
                buf.put_u32(block_info.offset);
                buf.put_u32(block_info.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 4 + 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put(&data[..]);
            }
            Message::Cancel(block_info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block_info.piece_index as u32);
                buf.put_u32(block_info.offset);
                buf.put_u32(block_info.len);
            }
            Message::Unknown(id) => {
                // we only ever produce this variant by decoding a peer's
                // message; we never originate one ourselves.
                buf.put_u32(1);
                buf.put_u8(id);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = SessionError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let raw_id = buf[0];
        let mut payload = buf.split_to(length);
        // the length prefix counts the id byte itself, so the remaining
        // payload is `length - 1` bytes, not `length`.
        payload.advance(1);

        let Some(id) = MessageId::from_u8(raw_id) else {
            // an id we don't recognize isn't a protocol violation: the
            // payload has already been consumed above so framing stays in
            // sync, we just have nothing to do with it.
            log::debug!("peer sent unknown message id {}, skipping", raw_id);
            return Ok(Some(Message::Unknown(raw_id)));
        };

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(SessionError::InvalidMessageLength);
                }
                let piece_index = payload.get_u32() as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bitfield = crate::Bitfield::from_vec(payload.to_vec());
                Message::Bitfield(bitfield)
            }
            MessageId::Request | MessageId::Cancel => {
                if payload.len() != 12 {
                    return Err(SessionError::InvalidMessageLength);
                }
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                let len = payload.get_u32();
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len,
                };
                if id == MessageId::Request {
                    Message::Request(block_info)
                } else {
                    Message::Cancel(block_info)
                }
            }
            MessageId::Block => {
                if payload.len() < 8 {
                    return Err(SessionError::InvalidMessageLength);
                }
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                let data = payload.to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_decode_needs_more_returns_none() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put(&b"BitTorrent protocol"[..10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(8);
        buf.put(&b"nonsense"[..]);
        buf.put_u64(0);
        buf.put(&[0u8; 20][..]);
        buf.put(&[0u8; 20][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(SessionError::InvalidProtocolString)
        ));
    }

    fn round_trip(msg: Message) -> Message {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn keep_alive_round_trips() {
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn simple_messages_round_trip() {
        assert_eq!(round_trip(Message::Choke), Message::Choke);
        assert_eq!(round_trip(Message::Unchoke), Message::Unchoke);
        assert_eq!(round_trip(Message::Interested), Message::Interested);
        assert_eq!(round_trip(Message::NotInterested), Message::NotInterested);
    }

    #[test]
    fn have_round_trips() {
        let msg = Message::Have { piece_index: 42 };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn bitfield_round_trips() {
        let mut bitfield = crate::Bitfield::repeat(false, 16);
        bitfield.set(0, true);
        bitfield.set(15, true);
        let msg = Message::Bitfield(bitfield);
        // a readable diff matters here: a mismatch would otherwise print as
        // two opaque `Message::Bitfield(BitVec)` values.
        pretty_assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn request_and_cancel_round_trip() {
        let block_info = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        assert_eq!(
            round_trip(Message::Request(block_info)),
            Message::Request(block_info)
        );
        assert_eq!(
            round_trip(Message::Cancel(block_info)),
            Message::Cancel(block_info)
        );
    }

    #[test]
    fn block_round_trips() {
        let msg = Message::Block {
            piece_index: 1,
            offset: 0,
            data: vec![9u8; 100],
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn block_length_prefix_accounts_for_id_byte() {
        // regression test for the classic off-by-one: length must be
        // `1 + payload.len()`, not `payload.len()`.
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let msg = Message::Block {
            piece_index: 0,
            offset: 0,
            data: vec![1, 2, 3, 4],
        };
        codec.encode(msg, &mut buf).unwrap();
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        // id(1) + piece_index(4) + offset(4) + data(4)
        assert_eq!(length, 1 + 4 + 4 + 4);
    }

    #[test]
    fn decode_returns_none_when_message_is_incomplete() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // missing the 4-byte piece index
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn unknown_message_id_is_skipped_without_closing_the_session() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        // id 20 isn't one this codec knows; its payload must still be
        // consumed so framing stays in sync with the next message.
        buf.put_u32(1 + 3);
        buf.put_u8(20);
        buf.put(&[1u8, 2, 3][..]);
        buf.put_u32(1);
        buf.put_u8(MessageId::Unchoke as u8);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unknown(20)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert!(buf.is_empty());
    }
}
