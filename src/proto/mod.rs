//! The BitTorrent peer wire protocol: the handshake and the length prefixed
//! messages that follow it.

pub mod codec;
pub mod message;

pub use codec::{HandshakeCodec, PeerWireCodec};
pub use message::{Handshake, PeerMessage, PeerRequest, Piece};
