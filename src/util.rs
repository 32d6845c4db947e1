use rand::Rng;
use sha1::{Digest, Sha1};
use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Length of a SHA-1 hash.
pub const SHA_HASH_LEN: usize = 20;

/// Prefix of the peer ids generated by this client (Azureus style).
pub const PEER_ID_PREFIX: &[u8; 8] = b"-BS0100-";

/// SHA-1 hash wrapper type for performing operations on the hash.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaHash {
    hash: [u8; SHA_HASH_LEN],
}

/// 20-byte identifier of a torrent, the SHA-1 of its bencoded info dictionary.
pub type InfoHash = ShaHash;

/// 20-byte identifier a client presents in its handshake.
pub type PeerId = ShaHash;

impl ShaHash {
    /// Create a ShaHash by hashing the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            hash: Sha1::digest(bytes).into(),
        }
    }

    pub fn random() -> Self {
        Self {
            hash: rand::thread_rng().gen(),
        }
    }

    /// A random peer id carrying the client prefix.
    pub fn random_peer_id() -> Self {
        let mut hash: [u8; SHA_HASH_LEN] = rand::thread_rng().gen();
        hash[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        Self { hash }
    }

    #[inline]
    pub fn len() -> usize {
        SHA_HASH_LEN
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; SHA_HASH_LEN] {
        &self.hash
    }
}

impl AsRef<[u8]> for ShaHash {
    fn as_ref(&self) -> &[u8] {
        &self.hash
    }
}

impl From<ShaHash> for [u8; SHA_HASH_LEN] {
    fn from(sha: ShaHash) -> [u8; SHA_HASH_LEN] {
        sha.hash
    }
}

impl From<[u8; SHA_HASH_LEN]> for ShaHash {
    fn from(sha_hash: [u8; SHA_HASH_LEN]) -> ShaHash {
        ShaHash { hash: sha_hash }
    }
}

impl TryFrom<&[u8]> for ShaHash {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != SHA_HASH_LEN {
            Err(())
        } else {
            let hash: [u8; SHA_HASH_LEN] = value.try_into().map_err(|_| ())?;
            Ok(Self { hash })
        }
    }
}

impl PartialEq<[u8]> for ShaHash {
    fn eq(&self, other: &[u8]) -> bool {
        self.hash[..] == *other
    }
}

impl fmt::Display for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ShaHash({})", self)
    }
}

/// Polls `fut` unless `token` fires first.
pub(crate) async fn until_cancelled<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}
