use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use snafu::ensure;
use std::fmt;

use crate::bitfield::BitField;
use crate::error::{
    Error, InvalidFrameSnafu, InvalidHandshakeSnafu, InvalidPayloadSnafu, Result,
};
use crate::util::ShaHash;

/// Identifies a block: the protocol's addressable unit of transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PeerRequest {
    /// specifying the zero-based piece index
    pub index: u32,
    /// specifying the zero-based byte offset within the piece
    pub begin: u32,
    /// specifying the requested length.
    pub length: u32,
}

impl PeerRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

/// A delivered block.
#[derive(Clone, PartialEq, Eq)]
pub struct Piece {
    /// specifying the zero-based piece index
    pub index: u32,
    /// specifying the zero-based byte offset within the piece
    pub begin: u32,
    /// block of data, which is a subset of the piece specified by index.
    pub block: Bytes,
}

impl Piece {
    /// The request this block answers.
    pub fn request(&self) -> PeerRequest {
        PeerRequest::new(self.index, self.begin, self.block.len() as u32)
    }
}

impl fmt::Debug for Piece {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("begin", &self.begin)
            .field("len", &self.block.len())
            .finish()
    }
}

/// All of the remaining messages in the protocol take the form of <length prefix><message ID><payload>.
/// The length prefix is a four byte big-endian value. The message ID is a single decimal byte.
/// integers in the peer wire protocol are encoded as four byte big-endian values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// heartbeat generally 2 minute interval
    KeepAlive,
    Choke,
    UnChoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield {
        /// packed bitfield representing the pieces that have been successfully downloaded
        index_field: Bytes,
    },
    Request {
        peer_request: PeerRequest,
    },
    Piece {
        piece: Piece,
    },
    Cancel {
        peer_request: PeerRequest,
    },
    /// The port message is sent by newer versions of the Mainline that implements a DHT tracker.
    /// The listen port is the port this peer's DHT node is listening on.
    Port {
        port: u16,
    },
    /// A message with an id this client does not implement, kept as is so the
    /// stream framing survives protocol extensions.
    Generic {
        id: u8,
        payload: Bytes,
    },
}

impl PeerMessage {
    pub const CHOKE_ID: u8 = 0;
    pub const UNCHOKE_ID: u8 = 1;
    pub const INTERESTED_ID: u8 = 2;
    pub const NOT_INTERESTED_ID: u8 = 3;
    pub const HAVE_ID: u8 = 4;
    pub const BITFIELD_ID: u8 = 5;
    pub const REQUEST_ID: u8 = 6;
    pub const PIECE_ID: u8 = 7;
    pub const CANCEL_ID: u8 = 8;
    pub const PORT_ID: u8 = 9;

    /// Size of the length prefix of every message.
    pub const LENGTH_PREFIX: usize = 4;

    pub fn bitfield(field: &BitField) -> Self {
        PeerMessage::Bitfield {
            index_field: Bytes::from(field.to_bytes()),
        }
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        PeerMessage::Request {
            peer_request: PeerRequest::new(index, begin, length),
        }
    }

    /// The message id, `None` for a `KeepAlive`.
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            PeerMessage::KeepAlive => return None,
            PeerMessage::Choke => Self::CHOKE_ID,
            PeerMessage::UnChoke => Self::UNCHOKE_ID,
            PeerMessage::Interested => Self::INTERESTED_ID,
            PeerMessage::NotInterested => Self::NOT_INTERESTED_ID,
            PeerMessage::Have { .. } => Self::HAVE_ID,
            PeerMessage::Bitfield { .. } => Self::BITFIELD_ID,
            PeerMessage::Request { .. } => Self::REQUEST_ID,
            PeerMessage::Piece { .. } => Self::PIECE_ID,
            PeerMessage::Cancel { .. } => Self::CANCEL_ID,
            PeerMessage::Port { .. } => Self::PORT_ID,
            PeerMessage::Generic { id, .. } => *id,
        };
        Some(id)
    }

    fn payload_len(&self) -> usize {
        match self {
            PeerMessage::KeepAlive
            | PeerMessage::Choke
            | PeerMessage::UnChoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => 0,
            PeerMessage::Have { .. } => 4,
            PeerMessage::Bitfield { index_field } => index_field.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 12,
            PeerMessage::Piece { piece } => 8 + piece.block.len(),
            PeerMessage::Port { .. } => 2,
            PeerMessage::Generic { payload, .. } => payload.len(),
        }
    }

    /// Number of bytes of the encoded frame, including the length prefix.
    pub fn encoded_len(&self) -> usize {
        match self {
            PeerMessage::KeepAlive => Self::LENGTH_PREFIX,
            msg => Self::LENGTH_PREFIX + 1 + msg.payload_len(),
        }
    }

    /// Append the length prefixed frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        let id = match self.id() {
            Some(id) => id,
            None => {
                dst.put_u32(0);
                return;
            }
        };
        dst.put_u32(1 + self.payload_len() as u32);
        dst.put_u8(id);
        match self {
            PeerMessage::Have { index } => dst.put_u32(*index),
            PeerMessage::Bitfield { index_field } => dst.put_slice(index_field),
            PeerMessage::Request { peer_request } | PeerMessage::Cancel { peer_request } => {
                dst.put_u32(peer_request.index);
                dst.put_u32(peer_request.begin);
                dst.put_u32(peer_request.length);
            }
            PeerMessage::Piece { piece } => {
                dst.put_u32(piece.index);
                dst.put_u32(piece.begin);
                dst.put_slice(&piece.block);
            }
            PeerMessage::Port { port } => dst.put_u16(*port),
            PeerMessage::Generic { payload, .. } => dst.put_slice(payload),
            _ => {}
        }
    }

    /// The encoded frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a complete frame, length prefix included.
    pub fn decode(frame: &[u8]) -> Result<PeerMessage> {
        ensure!(
            frame.len() >= Self::LENGTH_PREFIX,
            InvalidFrameSnafu {
                reason: format!("frame of {} bytes has no length prefix", frame.len()),
            }
        );
        let length = BigEndian::read_u32(&frame[..4]) as usize;
        let body = &frame[4..];
        ensure!(
            body.len() == length,
            InvalidFrameSnafu {
                reason: format!(
                    "length prefix announces {} bytes but frame carries {}",
                    length,
                    body.len()
                ),
            }
        );
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        Self::from_parts(body[0], Bytes::copy_from_slice(&body[1..]))
    }

    /// Build the message for an id and the payload that followed it.
    pub fn from_parts(id: u8, payload: Bytes) -> Result<PeerMessage> {
        let msg = match id {
            Self::CHOKE_ID => PeerMessage::Choke,
            Self::UNCHOKE_ID => PeerMessage::UnChoke,
            Self::INTERESTED_ID => PeerMessage::Interested,
            Self::NOT_INTERESTED_ID => PeerMessage::NotInterested,
            Self::HAVE_ID => {
                require_payload(id, &payload, 4)?;
                PeerMessage::Have {
                    index: BigEndian::read_u32(&payload[0..4]),
                }
            }
            Self::BITFIELD_ID => PeerMessage::Bitfield {
                index_field: payload,
            },
            Self::REQUEST_ID | Self::CANCEL_ID => {
                require_payload(id, &payload, 12)?;
                let peer_request = PeerRequest {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                };
                if id == Self::REQUEST_ID {
                    PeerMessage::Request { peer_request }
                } else {
                    PeerMessage::Cancel { peer_request }
                }
            }
            Self::PIECE_ID => {
                require_payload(id, &payload, 8)?;
                PeerMessage::Piece {
                    piece: Piece {
                        index: BigEndian::read_u32(&payload[0..4]),
                        begin: BigEndian::read_u32(&payload[4..8]),
                        block: payload.slice(8..),
                    },
                }
            }
            Self::PORT_ID => {
                require_payload(id, &payload, 2)?;
                PeerMessage::Port {
                    port: BigEndian::read_u16(&payload[0..2]),
                }
            }
            id => PeerMessage::Generic { id, payload },
        };
        Ok(msg)
    }
}

fn require_payload(id: u8, payload: &[u8], expected: usize) -> Result<()> {
    ensure!(
        payload.len() >= expected,
        InvalidPayloadSnafu {
            id,
            expected,
            actual: payload.len(),
        }
    );
    Ok(())
}

/// The handshake is a required message and must be the first message transmitted by the client.
/// `handshake: `<pstrlen><pstr><reserved><info_hash><peer_id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// string identifier of the protocol
    pub pstr: Bytes,
    /// eight (8) reserved bytes. All current implementations use all zeroes.
    pub reserved: [u8; 8],
    /// 20-byte SHA1 hash of the info key in the metainfo file.
    /// This is the same info_hash that is transmitted in tracker requests.
    pub info_hash: ShaHash,
    /// 20-byte string used as a unique ID for the client
    pub peer_id: ShaHash,
}

impl Handshake {
    pub const BITTORRENT_IDENTIFIER: &'static [u8] = b"BitTorrent protocol";

    /// Bytes following the protocol string: reserved, info hash and peer id.
    pub const FIXED_SUFFIX_LEN: usize = 8 + 20 + 20;

    pub fn new(info_hash: ShaHash, peer_id: ShaHash) -> Self {
        Self::with_protocol(Self::BITTORRENT_IDENTIFIER, info_hash, peer_id)
    }

    pub fn with_protocol(pstr: impl Into<Bytes>, info_hash: ShaHash, peer_id: ShaHash) -> Self {
        Self {
            pstr: pstr.into(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn new_with_random_id(info_hash: ShaHash) -> Self {
        Self::new(info_hash, ShaHash::random_peer_id())
    }

    /// Length of the protocol string as sent in the first byte.
    #[inline]
    pub fn plen(&self) -> usize {
        self.pstr.len()
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.pstr.len() + Self::FIXED_SUFFIX_LEN
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        ensure!(
            self.pstr.len() <= u8::MAX as usize,
            InvalidHandshakeSnafu {
                reason: format!("protocol string of {} bytes", self.pstr.len()),
            }
        );
        dst.reserve(self.encoded_len());
        dst.put_u8(self.pstr.len() as u8);
        dst.put_slice(&self.pstr);
        dst.put_slice(&self.reserved);
        dst.put_slice(self.info_hash.as_ref());
        dst.put_slice(self.peer_id.as_ref());
        Ok(())
    }

    /// Parse a complete handshake. The protocol string may have any length,
    /// the suffix is always 48 bytes.
    pub fn decode(src: &[u8]) -> Result<Handshake> {
        let plen = *src.first().ok_or_else(|| Error::InvalidHandshake {
            reason: "empty handshake".to_string(),
        })? as usize;
        let expected = 1 + plen + Self::FIXED_SUFFIX_LEN;
        ensure!(
            src.len() >= expected,
            InvalidHandshakeSnafu {
                reason: format!("expected {} bytes, got {}", expected, src.len()),
            }
        );
        let rest = &src[1 + plen..expected];
        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        reserved.copy_from_slice(&rest[..8]);
        info_hash.copy_from_slice(&rest[8..28]);
        peer_id.copy_from_slice(&rest[28..]);
        Ok(Handshake {
            pstr: Bytes::copy_from_slice(&src[1..1 + plen]),
            reserved,
            info_hash: info_hash.into(),
            peer_id: peer_id.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frame_sizes() {
        assert_eq!(PeerMessage::KeepAlive.to_bytes().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(PeerMessage::Choke.to_bytes().as_ref(), &[0, 0, 0, 1, 0]);
        assert_eq!(
            PeerMessage::Have { index: 0x0102 }.to_bytes().as_ref(),
            &[0, 0, 0, 5, 4, 0, 0, 1, 2]
        );
        let req = PeerMessage::request(1, 16384, 16384);
        assert_eq!(req.to_bytes().len(), 4 + 1 + 12);
        assert_eq!(
            PeerMessage::Port { port: 6881 }.to_bytes().as_ref(),
            &[0, 0, 0, 3, 9, 0x1A, 0xE1]
        );
    }

    #[test]
    fn undersized_payloads_are_rejected() {
        let have = [0, 0, 0, 3, 4, 0, 1];
        match PeerMessage::decode(&have) {
            Err(Error::InvalidPayload {
                id: 4,
                expected: 4,
                actual: 2,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
        let request = [0, 0, 0, 9, 6, 0, 0, 0, 1, 0, 0, 0, 2];
        assert!(matches!(
            PeerMessage::decode(&request),
            Err(Error::InvalidPayload { id: 6, .. })
        ));
        let piece = [0, 0, 0, 5, 7, 0, 0, 0, 1];
        assert!(matches!(
            PeerMessage::decode(&piece),
            Err(Error::InvalidPayload { id: 7, .. })
        ));
        let port = [0, 0, 0, 2, 9, 1];
        assert!(matches!(
            PeerMessage::decode(&port),
            Err(Error::InvalidPayload { id: 9, .. })
        ));
    }

    #[test]
    fn length_prefix_must_match() {
        assert!(matches!(
            PeerMessage::decode(&[0, 0, 0, 2, 0]),
            Err(Error::InvalidFrame { .. })
        ));
        assert!(matches!(
            PeerMessage::decode(&[0, 0]),
            Err(Error::InvalidFrame { .. })
        ));
    }

    #[test]
    fn unknown_ids_are_kept() {
        let msg = PeerMessage::decode(&[0, 0, 0, 4, 20, 1, 2, 3]).unwrap();
        assert_eq!(
            msg,
            PeerMessage::Generic {
                id: 20,
                payload: Bytes::from_static(&[1, 2, 3]),
            }
        );
        assert_eq!(msg.to_bytes().as_ref(), &[0, 0, 0, 4, 20, 1, 2, 3]);
    }

    #[test]
    fn handshake_layout() {
        let info_hash = ShaHash::from([1; 20]);
        let peer_id = ShaHash::from([2; 20]);
        let mut buf = BytesMut::new();
        Handshake::new(info_hash, peer_id).encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[1; 20]);
        assert_eq!(&buf[48..68], &[2; 20]);

        let handshake = Handshake::decode(&buf).unwrap();
        assert_eq!(handshake.plen(), 19);
        assert_eq!(handshake.info_hash, info_hash);
        assert_eq!(handshake.peer_id, peer_id);
    }

    #[test]
    fn handshake_with_custom_protocol() {
        let mut buf = BytesMut::new();
        let handshake =
            Handshake::with_protocol(&b"custom"[..], ShaHash::from([3; 20]), ShaHash::from([4; 20]));
        handshake.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 1 + 6 + 48);
        assert_eq!(Handshake::decode(&buf).unwrap(), handshake);
        assert!(matches!(
            Handshake::decode(&buf[..40]),
            Err(Error::InvalidHandshake { .. })
        ));
    }
}
