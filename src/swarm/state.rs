//! Scheduling and assembly state of a swarm. Owned by the coordinator task, no
//! IO happens here.

use bytes::Bytes;
use fnv::FnvHashMap;
use std::net::SocketAddr;

use crate::bitfield::BitField;
use crate::error::{Error, Result};
use crate::peer::ChokeType;
use crate::piece::{PendingPiece, PieceDescriptor};
use crate::proto::message::{PeerRequest, Piece};

/// What the coordinator knows about a peer, mirrored from its session.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub choke: ChokeType,
    pub pieces: BitField,
}

/// Outcome of adding a block.
#[derive(Debug)]
pub enum BlockOutcome {
    /// Stored, the piece is still incomplete.
    Pending,
    /// The block was already received or the piece is already verified.
    Duplicate,
    /// The piece is complete and matches its hash.
    Completed { index: u32, offset: u64, data: Bytes },
    /// The piece is complete but corrupt and was discarded.
    Corrupt { index: u32, error: Error },
}

#[derive(Debug)]
pub struct SwarmState {
    pieces: Vec<PieceDescriptor>,
    block_size: u32,
    /// local bitfield, only ever written here
    have: BitField,
    peers: FnvHashMap<SocketAddr, PeerView>,
    pending: FnvHashMap<u32, PendingPiece>,
}

impl SwarmState {
    /// # Panics
    ///
    /// If `have` does not have one bit per piece.
    pub fn new(pieces: Vec<PieceDescriptor>, have: BitField, block_size: u32) -> Self {
        assert_eq!(
            pieces.len(),
            have.len(),
            "local bitfield must have one bit per piece"
        );
        Self {
            pieces,
            block_size,
            have,
            peers: Default::default(),
            pending: Default::default(),
        }
    }

    #[inline]
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    #[inline]
    pub fn have(&self) -> &BitField {
        &self.have
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.have.is_complete()
    }

    #[inline]
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&PeerView> {
        self.peers.get(addr)
    }

    pub fn add_peer(&mut self, addr: SocketAddr) {
        let num_pieces = self.num_pieces();
        self.peers.entry(addr).or_insert_with(|| PeerView {
            choke: ChokeType::Choked,
            pieces: BitField::new(num_pieces),
        });
    }

    pub fn remove_peer(&mut self, addr: &SocketAddr) -> Option<PeerView> {
        self.peers.remove(addr)
    }

    pub fn set_choke(&mut self, addr: &SocketAddr, choke: ChokeType) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.choke = choke;
        }
    }

    /// Replaces the pieces a peer has. The bitfield comes from the session,
    /// which already checked its length.
    pub fn set_pieces(&mut self, addr: &SocketAddr, pieces: BitField) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.pieces = pieces;
        }
    }

    pub fn set_have(&mut self, addr: &SocketAddr, index: u32) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.pieces.set(index as usize, true);
        }
    }

    /// The blocks to request from every unchoked peer: for each piece the peer
    /// has and we lack, the blocks not received yet. At most `limit` requests
    /// per peer.
    pub fn schedule(&self, limit: usize) -> Vec<(SocketAddr, Vec<PeerRequest>)> {
        if self.is_complete() {
            return Vec::new();
        }
        self.peers
            .iter()
            .filter(|(_, peer)| peer.choke == ChokeType::UnChoked)
            .map(|(addr, peer)| {
                let requests = self
                    .have
                    .missing()
                    .filter(|index| peer.pieces.get(*index))
                    .flat_map(|index| self.missing_blocks(index))
                    .take(limit)
                    .collect::<Vec<_>>();
                (*addr, requests)
            })
            .filter(|(_, requests)| !requests.is_empty())
            .collect()
    }

    fn missing_blocks(&self, index: usize) -> Vec<PeerRequest> {
        match self.pending.get(&(index as u32)) {
            Some(pending) => pending.missing_blocks().collect(),
            None => self.pieces[index].blocks(self.block_size).collect(),
        }
    }

    /// Stores a received block and verifies the piece once every block is
    /// there.
    ///
    /// A verified piece sets its local bit, a corrupt one is discarded and
    /// stays requestable.
    pub fn on_block(&mut self, piece: Piece) -> Result<BlockOutcome> {
        let index = piece.index;
        let descriptor = self
            .pieces
            .get(index as usize)
            .ok_or(Error::PieceOutOfRange {
                index,
                num_pieces: self.pieces.len(),
            })?;
        if self.have.get(index as usize) {
            return Ok(BlockOutcome::Duplicate);
        }
        // no assembly buffer for blocks that can never be part of the piece
        descriptor.check_block(piece.begin, piece.block.len(), self.block_size)?;

        let block_size = self.block_size;
        let pending = self
            .pending
            .entry(index)
            .or_insert_with(|| PendingPiece::new(descriptor.clone(), block_size));
        if !pending.add_block(piece.begin, &piece.block)? {
            return Ok(BlockOutcome::Duplicate);
        }
        if !pending.is_complete() {
            return Ok(BlockOutcome::Pending);
        }

        let pending = match self.pending.remove(&index) {
            Some(pending) => pending,
            None => return Ok(BlockOutcome::Pending),
        };
        match pending.verify() {
            Ok(()) => {
                self.have.set(index as usize, true);
                let offset = pending.descriptor().offset;
                Ok(BlockOutcome::Completed {
                    index,
                    offset,
                    data: pending.into_bytes(),
                })
            }
            Err(error) => Ok(BlockOutcome::Corrupt { index, error }),
        }
    }

    /// Clears the bit of a piece that could not be persisted so it is
    /// downloaded again.
    pub fn mark_missing(&mut self, index: u32) {
        self.have.set(index as usize, false);
    }
}
