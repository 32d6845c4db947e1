//! BitTorrent peer wire protocol and swarm coordination.
//!
//! A [`SwarmManager`] runs one coordinator task per torrent. Each coordinator
//! owns the sessions of its peers, schedules block requests, verifies the
//! assembled pieces and hands them to a [`Storage`](disk::Storage).

#[macro_use]
extern crate log;

pub mod bitfield;
pub mod checker;
pub mod config;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod proto;
pub mod swarm;
pub mod tracker;
pub mod util;

pub use bitfield::BitField;
pub use config::SwarmConfig;
pub use error::{Error, ErrorKind, Result};
pub use metainfo::MetaInfo;
pub use swarm::{SwarmEvent, SwarmHandle, SwarmManager, SwarmSnapshot, SwarmStatus};
pub use util::{InfoHash, PeerId, ShaHash};
