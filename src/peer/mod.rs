pub mod connection;
pub mod session;

use std::fmt;
use std::net::SocketAddr;

use crate::util::PeerId;

pub use connection::PeerConnection;
pub use session::{PeerSession, ReceivedBlock, SessionCommand, SessionEvent, SessionState};

/// Status of our connection to a node reported by the BitTorrent protocol.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChokeType {
    /// remote has chocked the client
    /// When a peer chokes the client, it is a notification that no requests will be answered until the client is unchoked.
    Choked = 0,
    /// client currently accepts request
    UnChoked = 1,
}

impl Default for ChokeType {
    fn default() -> Self {
        ChokeType::Choked
    }
}

/// Status of our interest to download a target by the BitTorrent protocol.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InterestType {
    /// remote has no interest to download.
    NotInterested = 0,
    /// remote is currently interested to download.
    Interested = 1,
}

impl Default for InterestType {
    fn default() -> Self {
        InterestType::NotInterested
    }
}

/// A remote endpoint, as announced by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub addr: SocketAddr,
    /// the peer's bittorrent id, if the tracker reported it
    pub peer_id: Option<PeerId>,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
        }
    }

    pub fn with_peer_id(addr: SocketAddr, peer_id: PeerId) -> Self {
        Self {
            addr,
            peer_id: Some(peer_id),
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::new(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.addr.fmt(f)
    }
}
