use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::piece::BLOCK_SIZE;
use crate::proto::message::{Handshake, PeerMessage};

/// Frames the length prefixed peer wire messages exchanged after the handshake.
#[derive(Debug, Clone)]
pub struct PeerWireCodec {
    /// maximum permitted number of bytes per frame
    max: usize,
}

impl PeerWireCodec {
    pub fn new_with_max_length(max: usize) -> Self {
        Self { max }
    }

    /// Frame limit that fits a `piece` message carrying `block_size` bytes.
    pub fn max_length_for_block(block_size: u32) -> usize {
        // length(4) + identifier(1) + payload (index(4) + offset(4) + block)
        4 + 1 + 8 + block_size as usize * 2
    }

    /// Frame limit that fits the bitfield of a torrent with `num_pieces` pieces.
    pub fn max_length_for_bitfield(num_pieces: usize) -> usize {
        // length(4) + identifier(1) + one bit per piece
        4 + 1 + (num_pieces + 7) / 8
    }
}

impl Default for PeerWireCodec {
    fn default() -> Self {
        Self {
            max: Self::max_length_for_block(BLOCK_SIZE),
        }
    }
}

impl Decoder for PeerWireCodec {
    type Item = PeerMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PeerMessage::LENGTH_PREFIX {
            return Ok(None);
        }
        let length = BigEndian::read_u32(&src[..4]) as usize;
        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }
        let frame_len = PeerMessage::LENGTH_PREFIX + length;
        if frame_len > self.max {
            return Err(Error::FrameTooLarge {
                length: frame_len,
                max: self.max,
            });
        }
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(frame_len).freeze();
        frame.advance(4);
        let id = frame.get_u8();
        PeerMessage::from_parts(id, frame).map(Some)
    }
}

impl Encoder<PeerMessage> for PeerWireCodec {
    type Error = Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Frames the single handshake each side sends before any other message.
#[derive(Debug, Clone, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let plen = match src.first() {
            Some(plen) => *plen as usize,
            None => return Ok(None),
        };
        let total = 1 + plen + Handshake::FIXED_SUFFIX_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let raw = src.split_to(total);
        Handshake::decode(&raw).map(Some)
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::BitField;
    use crate::proto::message::{Piece, PeerRequest};
    use crate::util::ShaHash;
    use bytes::Bytes;

    macro_rules! peer_wire_msg_ende {
        ($( $msg:expr ),*) => {
            let mut codec = PeerWireCodec::default();
            $(
            {
                let msg = $msg;
                let mut buf = BytesMut::with_capacity(msg.encoded_len());
                codec.encode(msg.clone(), &mut buf).unwrap();
                assert_eq!(buf.len(), msg.encoded_len());
                assert_eq!(PeerMessage::decode(&buf).unwrap(), msg);
                assert_eq!(Some(msg), codec.decode(&mut buf).unwrap());
                assert!(buf.is_empty());
            }
            )*
        };
    }

    #[test]
    fn peer_wire_codec() {
        let mut field = BitField::new(12);
        field.set(0, true);
        field.set(11, true);

        peer_wire_msg_ende!(
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::UnChoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have { index: 100 },
            PeerMessage::bitfield(&field),
            PeerMessage::Request {
                peer_request: PeerRequest {
                    index: 1,
                    begin: 2,
                    length: 16384
                }
            },
            PeerMessage::Piece {
                piece: Piece {
                    index: 1,
                    begin: 2,
                    block: Bytes::new()
                }
            },
            PeerMessage::Piece {
                piece: Piece {
                    index: 1,
                    begin: 2,
                    block: std::iter::repeat(1).take(BLOCK_SIZE as usize).collect()
                }
            },
            PeerMessage::Cancel {
                peer_request: PeerRequest {
                    index: 1,
                    begin: 2,
                    length: 16384
                }
            },
            PeerMessage::Port { port: 8080 },
            PeerMessage::Generic {
                id: 20,
                payload: Bytes::from_static(b"d1:md11:ut_metadatai1eee")
            }
        );
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = PeerWireCodec::default();
        let frame = PeerMessage::Have { index: 7 }.to_bytes();
        let mut buf = BytesMut::from(&frame[..6]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&frame[6..]);
        buf.extend_from_slice(&PeerMessage::UnChoke.to_bytes());
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PeerMessage::Have { index: 7 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(PeerMessage::UnChoke));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = PeerWireCodec::new_with_max_length(64);
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0, 7][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn handshake_codec_reads_variable_prefix() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new(ShaHash::from([9; 20]), ShaHash::from([8; 20]));
        let mut buf = BytesMut::new();
        codec.encode(handshake.clone(), &mut buf).unwrap();
        buf.extend_from_slice(&PeerMessage::Interested.to_bytes());

        let mut partial = buf.split_to(30);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);

        assert_eq!(codec.decode(&mut partial).unwrap(), Some(handshake));
        // the remaining bytes belong to the next codec
        assert_eq!(
            PeerWireCodec::default().decode(&mut partial).unwrap(),
            Some(PeerMessage::Interested)
        );
    }
}
