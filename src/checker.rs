//! Verification of data already present in storage, so an interrupted
//! download resumes where it stopped.

use tokio::task;

use crate::bitfield::BitField;
use crate::disk::Storage;
use crate::error::{Error, Result};
use crate::piece::PieceDescriptor;

/// Reads every piece from `storage` and sets the bit of each one matching its
/// hash. Pieces that cannot be read count as missing.
pub fn check_pieces<S: Storage + ?Sized>(storage: &mut S, pieces: &[PieceDescriptor]) -> BitField {
    let mut have = BitField::new(pieces.len());
    for piece in pieces {
        match storage.read_block(piece.offset, piece.length as usize) {
            Ok(data) if piece.is_valid(&data) => have.set(piece.index as usize, true),
            Ok(_) => trace!("Piece {} does not match its hash", piece.index),
            Err(err) => trace!("Piece {} unreadable: {}", piece.index, err),
        }
    }
    debug!("{} of {} pieces already present", have.count_ones(), have.len());
    have
}

/// Runs [`check_pieces`] on the blocking pool and hands the storage back.
pub async fn check_torrent<S: Storage>(
    mut storage: S,
    pieces: Vec<PieceDescriptor>,
) -> Result<(S, BitField)> {
    task::spawn_blocking(move || {
        let have = check_pieces(&mut storage, &pieces);
        (storage, have)
    })
    .await
    .map_err(|err| Error::Io {
        source: std::io::Error::new(std::io::ErrorKind::Other, err),
    })
}
