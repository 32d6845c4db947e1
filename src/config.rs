use bytes::Bytes;
use std::time::Duration;

use crate::piece::BLOCK_SIZE;
use crate::proto::codec::PeerWireCodec;
use crate::proto::message::Handshake;

/// The configuration shared by a swarm, its sessions and their connections.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// How long to wait for a TCP connection to be established.
    pub connect_timeout: Duration,
    /// Deadline for the handshake and for every single frame read.
    pub read_timeout: Duration,
    /// Capacity of every bounded queue.
    pub queue_capacity: usize,
    /// Period of the scheduling tick.
    pub schedule_interval: Duration,
    /// Maximum number of block requests in flight per peer.
    pub max_requests_per_peer: usize,
    /// Maximum size of a block; pieces are partitioned into blocks of this size.
    pub block_size: u32,
    /// Frames announcing more bytes are rejected.
    pub max_frame_length: usize,
    /// Protocol string sent in the handshake.
    pub protocol: Bytes,
}

impl SwarmConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
    pub const QUEUE_CAPACITY: usize = 100;
    pub const SCHEDULE_INTERVAL: Duration = Duration::from_secs(1);
    pub const MAX_REQUESTS_PER_PEER: usize = 64;

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_schedule_interval(mut self, interval: Duration) -> Self {
        self.schedule_interval = interval;
        self
    }

    pub fn with_max_requests_per_peer(mut self, max: usize) -> Self {
        self.max_requests_per_peer = max;
        self
    }

    /// Also raises the frame limit so a full block still fits in one frame.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self.max_frame_length = self
            .max_frame_length
            .max(PeerWireCodec::max_length_for_block(block_size));
        self
    }

    /// Raises the frame limit so the bitfield of a torrent with `num_pieces`
    /// pieces fits in one frame.
    pub fn with_num_pieces(mut self, num_pieces: usize) -> Self {
        self.max_frame_length = self
            .max_frame_length
            .max(PeerWireCodec::max_length_for_bitfield(num_pieces));
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Modifies the protocol name used on the wire. Can be used to create
    /// incompatibilities between networks on purpose.
    pub fn with_protocol_name(mut self, name: impl Into<Bytes>) -> Self {
        self.protocol = name.into();
        self
    }

    pub(crate) fn codec(&self) -> PeerWireCodec {
        PeerWireCodec::new_with_max_length(self.max_frame_length)
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::CONNECT_TIMEOUT,
            read_timeout: Self::READ_TIMEOUT,
            queue_capacity: Self::QUEUE_CAPACITY,
            schedule_interval: Self::SCHEDULE_INTERVAL,
            max_requests_per_peer: Self::MAX_REQUESTS_PER_PEER,
            block_size: BLOCK_SIZE,
            max_frame_length: PeerWireCodec::max_length_for_block(BLOCK_SIZE),
            protocol: Bytes::from_static(Handshake::BITTORRENT_IDENTIFIER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::BitField;
    use crate::proto::message::PeerMessage;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn bitfield_of_large_torrent_fits_frame() {
        let num_pieces = 300_000;
        let mut pieces = BitField::new(num_pieces);
        pieces.set(0, true);
        pieces.set(num_pieces - 1, true);
        let msg = PeerMessage::bitfield(&pieces);

        let mut buf = BytesMut::new();
        SwarmConfig::default().codec().encode(msg.clone(), &mut buf).unwrap();
        let mut frame = buf.clone();
        assert!(SwarmConfig::default().codec().decode(&mut frame).is_err());

        let config = SwarmConfig::default().with_num_pieces(num_pieces);
        assert_eq!(config.max_frame_length, 4 + 1 + 37_500);
        assert_eq!(config.codec().decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn small_torrents_keep_block_limit() {
        let config = SwarmConfig::default().with_num_pieces(10);
        assert_eq!(
            config.max_frame_length,
            PeerWireCodec::max_length_for_block(BLOCK_SIZE)
        );
    }
}
