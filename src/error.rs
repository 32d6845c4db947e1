use bendy::decoding::Error as DecodingError;
use snafu::Snafu;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::proto::message::PeerRequest;
use crate::util::ShaHash;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("IO Err {}", source))]
    Io { source: io::Error },
    #[snafu(display("Timed out after {:?} while {}", after, operation))]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[snafu(display("Connection to {} closed", addr))]
    ConnectionClosed { addr: SocketAddr },
    #[snafu(display("Invalid handshake: {}", reason))]
    InvalidHandshake { reason: String },
    #[snafu(display("Info hash mismatch, expected {}, got {}", expected, got))]
    InfoHashMismatch { expected: ShaHash, got: ShaHash },
    #[snafu(display("Invalid frame: {}", reason))]
    InvalidFrame { reason: String },
    #[snafu(display("Frame of {} bytes exceeds the maximum of {}", length, max))]
    FrameTooLarge { length: usize, max: usize },
    #[snafu(display(
        "Invalid payload for message {}, expected at least {} bytes but got {}",
        id,
        expected,
        actual
    ))]
    InvalidPayload {
        id: u8,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("Piece index {} out of range for {} pieces", index, num_pieces))]
    PieceOutOfRange { index: u32, num_pieces: usize },
    #[snafu(display("Can't process block: {:?}", request))]
    BadBlock { request: PeerRequest },
    #[snafu(display("Found mismatched hashes for piece {}, expected {}, got {}", index, expected, got))]
    MismatchedHashes {
        index: u32,
        expected: ShaHash,
        got: ShaHash,
    },
    #[snafu(display(
        "Range {}..{} is outside of the {} bytes of storage",
        offset,
        offset + length,
        total
    ))]
    OutOfBounds { offset: u64, length: u64, total: u64 },
    #[snafu(display("Bendecoding error: {}", reason))]
    Bendecoding { reason: String },
    #[snafu(display("Tracker failure: {}", reason))]
    TrackerFailure { reason: String },
    #[snafu(display("HTTP error: {}", source))]
    Http { source: reqwest::Error },
    #[snafu(display(
        "Failed To Add Torrent Because Another Torrent With The Same InfoHash {} Is Already Added",
        hash
    ))]
    ExistingInfoHash { hash: ShaHash },
    #[snafu(display("No torrent registered for InfoHash {}", hash))]
    TorrentInfoHashNotFound { hash: ShaHash },
    #[snafu(display("Swarm for {} is no longer running", hash))]
    SwarmStopped { hash: ShaHash },
    #[snafu(display("Peer {} was dropped for misbehaving", addr))]
    PeerBanned { addr: SocketAddr },
}

/// Coarse classification of an [`Error`], used to decide at which
/// granularity a failure is recovered from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused, reset or timed out. The peer is dropped.
    Transport,
    /// The remote violated the wire protocol. The peer is dropped and not
    /// retried.
    Protocol,
    /// A piece failed its checksum. The piece is discarded.
    Integrity,
    /// The storage collaborator failed to read or write.
    Storage,
    /// Malformed torrent metadata.
    Metadata,
    /// The tracker could not be reached or rejected the announce.
    Tracker,
    /// Lookup or registration of a torrent failed.
    Registry,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } | Error::Timeout { .. } | Error::ConnectionClosed { .. } => {
                ErrorKind::Transport
            }
            Error::InvalidHandshake { .. }
            | Error::InfoHashMismatch { .. }
            | Error::InvalidFrame { .. }
            | Error::FrameTooLarge { .. }
            | Error::InvalidPayload { .. }
            | Error::PieceOutOfRange { .. }
            | Error::BadBlock { .. }
            | Error::PeerBanned { .. } => ErrorKind::Protocol,
            Error::MismatchedHashes { .. } => ErrorKind::Integrity,
            Error::OutOfBounds { .. } => ErrorKind::Storage,
            Error::Bendecoding { .. } => ErrorKind::Metadata,
            Error::TrackerFailure { .. } | Error::Http { .. } => ErrorKind::Tracker,
            Error::ExistingInfoHash { .. }
            | Error::TorrentInfoHashNotFound { .. }
            | Error::SwarmStopped { .. } => ErrorKind::Registry,
        }
    }

    /// Whether the error was caused by the remote peer misbehaving.
    #[inline]
    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io { source: err }
    }
}

impl From<DecodingError> for Error {
    fn from(err: DecodingError) -> Error {
        Error::Bendecoding {
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        Error::Http { source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_errors() {
        let io: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(io.kind(), ErrorKind::Transport);

        let payload = Error::InvalidPayload {
            id: 4,
            expected: 4,
            actual: 2,
        };
        assert!(payload.is_protocol());
        assert_eq!(
            payload.to_string(),
            "Invalid payload for message 4, expected at least 4 bytes but got 2"
        );

        let hash = Error::MismatchedHashes {
            index: 1,
            expected: ShaHash::from([0; 20]),
            got: ShaHash::from([1; 20]),
        };
        assert_eq!(hash.kind(), ErrorKind::Integrity);
    }
}
