use bytes::{Bytes, BytesMut};

use crate::bitfield::BitField;
use crate::error::{Error, Result};
use crate::proto::message::PeerRequest;
use crate::util::ShaHash;

/// 2^14 16kb per block, the conventional maximum block size.
pub const BLOCK_SIZE: u32 = 16384;

/// Location and checksum of a single piece of the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceDescriptor {
    /// zero-based index of the piece
    pub index: u32,
    /// offset of the first byte of the piece inside the whole torrent
    pub offset: u64,
    /// number of bytes in the piece, only the last piece may be shorter
    pub length: u32,
    /// expected SHA-1 of the piece
    pub hash: ShaHash,
}

impl PieceDescriptor {
    /// Computes the descriptors of all pieces.
    ///
    /// The last piece is `total_length % piece_length` long, or a full piece if
    /// that remainder is zero.
    pub fn generate(total_length: u64, piece_length: u32, hashes: &[ShaHash]) -> Vec<Self> {
        let piece_length_u64 = u64::from(piece_length);
        hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let offset = index as u64 * piece_length_u64;
                let length = total_length.saturating_sub(offset).min(piece_length_u64) as u32;
                PieceDescriptor {
                    index: index as u32,
                    offset,
                    length,
                    hash: *hash,
                }
            })
            .collect()
    }

    /// Number of blocks of at most `block_size` bytes covering the piece.
    pub fn num_blocks(&self, block_size: u32) -> usize {
        ((self.length + block_size - 1) / block_size) as usize
    }

    /// The deterministic partition of the piece into requests, starting at
    /// offset 0 with the last block truncated to the remaining bytes.
    pub fn blocks(&self, block_size: u32) -> impl Iterator<Item = PeerRequest> + '_ {
        let length = self.length;
        (0..self.num_blocks(block_size) as u32).map(move |block| {
            let begin = block * block_size;
            PeerRequest::new(self.index, begin, block_size.min(length - begin))
        })
    }

    /// Checks that a block of `length` bytes at `begin` is one of the blocks of
    /// the partition.
    pub fn check_block(&self, begin: u32, length: usize, block_size: u32) -> Result<()> {
        let aligned = begin % block_size == 0 && begin < self.length;
        let expected = if aligned {
            block_size.min(self.length - begin) as usize
        } else {
            0
        };
        if !aligned || length != expected {
            return Err(Error::BadBlock {
                request: PeerRequest::new(self.index, begin, length as u32),
            });
        }
        Ok(())
    }

    /// Whether `data` matches the expected checksum.
    pub fn is_valid(&self, data: &[u8]) -> bool {
        ShaHash::from_bytes(data) == self.hash
    }
}

/// Assembly buffer for a piece whose blocks are still arriving.
///
/// Completion is tracked per block, not per byte.
#[derive(Debug)]
pub struct PendingPiece {
    descriptor: PieceDescriptor,
    block_size: u32,
    buffer: BytesMut,
    /// Which blocks were received.
    received: BitField,
}

impl PendingPiece {
    pub fn new(descriptor: PieceDescriptor, block_size: u32) -> Self {
        let num_blocks = descriptor.num_blocks(block_size);
        Self {
            buffer: BytesMut::zeroed(descriptor.length as usize),
            received: BitField::new(num_blocks),
            block_size,
            descriptor,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &PieceDescriptor {
        &self.descriptor
    }

    /// Copies a block into the buffer.
    ///
    /// Returns `false` if the block was already received. Blocks that do not
    /// match the partition of the piece are rejected.
    pub fn add_block(&mut self, begin: u32, data: &[u8]) -> Result<bool> {
        self.descriptor
            .check_block(begin, data.len(), self.block_size)?;
        let block = (begin / self.block_size) as usize;
        if self.received.get(block) {
            return Ok(false);
        }
        let begin = begin as usize;
        self.buffer[begin..begin + data.len()].copy_from_slice(data);
        self.received.set(block, true);
        Ok(true)
    }

    /// Whether the block starting at `begin` was received.
    pub fn has_block(&self, begin: u32) -> bool {
        let block = (begin / self.block_size) as usize;
        block < self.received.len() && self.received.get(block)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received.is_complete()
    }

    /// Requests for the blocks that are still missing.
    pub fn missing_blocks(&self) -> impl Iterator<Item = PeerRequest> + '_ {
        self.descriptor
            .blocks(self.block_size)
            .filter(move |req| !self.has_block(req.begin))
    }

    /// Checks the assembled bytes against the expected hash. Calling this
    /// repeatedly on the same buffer gives the same answer.
    pub fn verify(&self) -> Result<()> {
        let got = ShaHash::from_bytes(&self.buffer);
        if got == self.descriptor.hash {
            Ok(())
        } else {
            Err(Error::MismatchedHashes {
                index: self.descriptor.index,
                expected: self.descriptor.hash,
                got,
            })
        }
    }

    /// Turn the buffer into the piece's bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}
