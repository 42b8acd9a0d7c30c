//! The BitTorrent-style handshake and the length-prefixed message codec used
//! for everything exchanged after it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::TransportError;
use crate::{PeerId, PieceIndex, Sha1Hash};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed-size handshake exchanged before any application message.
#[derive(PartialEq)]
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

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("prot", &String::from_utf8_lossy(&self.prot))
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

pub struct HandshakeCodec;

const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = TransportError;

    fn encode(
        &mut self,
        handshake: Handshake,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(19);
        dst.extend_from_slice(&handshake.prot);
        dst.extend_from_slice(&handshake.reserved);
        dst.extend_from_slice(&handshake.info_hash);
        dst.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = TransportError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let prot_len = src[0] as usize;
        if prot_len != 19 {
            return Err(TransportError::IncorrectProtocol);
        }
        if src.remaining() < HANDSHAKE_LEN {
            return Ok(None);
        }
        src.advance(1);

        let mut prot = [0; 19];
        src.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The reason given in an `ERROR` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The requester's `PIECE_REQUEST` could not be satisfied.
    PieceRequestFailed,
    /// Any other, unclassified failure.
    Other(u8),
}

impl ErrorCode {
    fn to_wire(self) -> u8 {
        match self {
            Self::PieceRequestFailed => 0,
            Self::Other(code) => code,
        }
    }

    fn from_wire(code: u8) -> Self {
        match code {
            0 => Self::PieceRequestFailed,
            other => Self::Other(other),
        }
    }
}

/// The application message set this crate's `Dispatcher` speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Error {
        code: ErrorCode,
        index: PieceIndex,
        text: String,
    },
    AnnouncePiece {
        index: PieceIndex,
    },
    PieceRequest {
        index: PieceIndex,
        offset: u32,
        length: u32,
    },
    PiecePayload {
        index: PieceIndex,
        offset: u32,
        payload: Vec<u8>,
    },
    CancelPiece {
        index: PieceIndex,
    },
    Bitfield(crate::Bitfield),
    Complete,
}

#[repr(u8)]
enum MessageId {
    Error = 0,
    AnnouncePiece = 1,
    PieceRequest = 2,
    PiecePayload = 3,
    CancelPiece = 4,
    Bitfield = 5,
    Complete = 6,
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = TransportError;

    fn encode(
        &mut self,
        msg: Message,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::Error { code, index, text } => {
                let text = text.into_bytes();
                dst.put_u32(1 + 1 + 4 + text.len() as u32);
                dst.put_u8(MessageId::Error as u8);
                dst.put_u8(code.to_wire());
                dst.put_u32(index as u32);
                dst.extend_from_slice(&text);
            }
            Message::AnnouncePiece { index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(MessageId::AnnouncePiece as u8);
                dst.put_u32(index as u32);
            }
            Message::PieceRequest {
                index,
                offset,
                length,
            } => {
                dst.put_u32(1 + 4 + 4 + 4);
                dst.put_u8(MessageId::PieceRequest as u8);
                dst.put_u32(index as u32);
                dst.put_u32(offset);
                dst.put_u32(length);
            }
            Message::PiecePayload {
                index,
                offset,
                payload,
            } => {
                dst.put_u32(1 + 4 + 4 + payload.len() as u32);
                dst.put_u8(MessageId::PiecePayload as u8);
                dst.put_u32(index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&payload);
            }
            Message::CancelPiece { index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(MessageId::CancelPiece as u8);
                dst.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.into_vec();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.extend_from_slice(&raw);
            }
            Message::Complete => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Complete as u8);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < 4 {
            return Ok(None);
        }
        let msg_len = {
            let mut peek = std::io::Cursor::new(&src[..]);
            peek.get_u32() as usize
        };
        if src.remaining() < 4 + msg_len {
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Err(TransportError::UnexpectedKeepAlive);
        }

        let body_len = msg_len - 1;
        let msg = match src.get_u8() {
            id if id == MessageId::Error as u8 => {
                if body_len < 5 {
                    return Err(TransportError::InvalidMessageLen(msg_len));
                }
                let code = ErrorCode::from_wire(src.get_u8());
                let index = src.get_u32() as PieceIndex;
                let mut text = vec![0; body_len - 5];
                src.copy_to_slice(&mut text);
                Message::Error {
                    code,
                    index,
                    text: String::from_utf8_lossy(&text).into_owned(),
                }
            }
            id if id == MessageId::AnnouncePiece as u8 => {
                if body_len != 4 {
                    return Err(TransportError::InvalidMessageLen(msg_len));
                }
                Message::AnnouncePiece {
                    index: src.get_u32() as PieceIndex,
                }
            }
            id if id == MessageId::PieceRequest as u8 => {
                if body_len != 12 {
                    return Err(TransportError::InvalidMessageLen(msg_len));
                }
                Message::PieceRequest {
                    index: src.get_u32() as PieceIndex,
                    offset: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            id if id == MessageId::PiecePayload as u8 => {
                if body_len < 8 {
                    return Err(TransportError::InvalidMessageLen(msg_len));
                }
                let index = src.get_u32() as PieceIndex;
                let offset = src.get_u32();
                let mut payload = vec![0; body_len - 8];
                src.copy_to_slice(&mut payload);
                Message::PiecePayload {
                    index,
                    offset,
                    payload,
                }
            }
            id if id == MessageId::CancelPiece as u8 => {
                if body_len != 4 {
                    return Err(TransportError::InvalidMessageLen(msg_len));
                }
                Message::CancelPiece {
                    index: src.get_u32() as PieceIndex,
                }
            }
            id if id == MessageId::Bitfield as u8 => {
                let mut raw = vec![0; body_len];
                src.copy_to_slice(&mut raw);
                Message::Bitfield(crate::Bitfield::from_vec(raw))
            }
            id if id == MessageId::Complete as u8 => {
                if body_len != 0 {
                    return Err(TransportError::InvalidMessageLen(msg_len));
                }
                Message::Complete
            }
            id => return Err(TransportError::InvalidMessageId(id)),
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([1; 20], [2; 20]);
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [1; 20]);
        assert_eq!(decoded.peer_id, [2; 20]);
    }

    #[test]
    fn handshake_rejects_wrong_protocol_len() {
        let mut buf = BytesMut::new();
        buf.put_u8(20);
        let err = HandshakeCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::IncorrectProtocol));
    }

    #[test]
    fn handshake_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"BitTorrent protocol");
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
    }

    fn round_trip(msg: Message) {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn every_message_variant_round_trips() {
        round_trip(Message::Error {
            code: ErrorCode::PieceRequestFailed,
            index: 3,
            text: "nope".to_owned(),
        });
        round_trip(Message::AnnouncePiece { index: 7 });
        round_trip(Message::PieceRequest {
            index: 1,
            offset: 0,
            length: 1 << 14,
        });
        round_trip(Message::PiecePayload {
            index: 1,
            offset: 0,
            payload: vec![1, 2, 3, 4],
        });
        round_trip(Message::CancelPiece { index: 2 });
        round_trip(Message::Bitfield(crate::Bitfield::from_vec(vec![
            0xff, 0x00,
        ])));
        round_trip(Message::Complete);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::AnnouncePiece as u8);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_rejects_unknown_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xfe);
        let err = MessageCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessageId(0xfe)));
    }

    #[test]
    fn decode_rejects_garbage_length() {
        let mut buf = BytesMut::new();
        // declares a 9-byte body (1 id + 8), but AnnouncePiece only ever
        // carries a 4-byte index
        buf.put_u32(9);
        buf.put_u8(MessageId::AnnouncePiece as u8);
        buf.put_u32(9);
        buf.put_u32(0);
        let err = MessageCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessageLen(9)));
    }
}
