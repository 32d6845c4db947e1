//! Registry of the swarms of all active torrents.

use fnv::FnvHashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use crate::bitfield::BitField;
use crate::config::SwarmConfig;
use crate::disk::Storage;
use crate::error::{Error, Result};
use crate::peer::PeerConnection;
use crate::piece::PieceDescriptor;
use crate::swarm::{SwarmEvent, SwarmHandle, SwarmSnapshot};
use crate::util::{InfoHash, PeerId};

/// Owns one [`SwarmHandle`] per registered torrent.
///
/// All swarms share the local peer id, the configuration and one event
/// channel.
#[derive(Debug)]
pub struct SwarmManager {
    peer_id: PeerId,
    config: SwarmConfig,
    events: mpsc::Sender<SwarmEvent>,
    swarms: FnvHashMap<InfoHash, SwarmHandle>,
}

impl SwarmManager {
    /// Creates an empty manager and the receiving end of its event channel.
    pub fn new(peer_id: PeerId, config: SwarmConfig) -> (Self, mpsc::Receiver<SwarmEvent>) {
        let (events, rx) = mpsc::channel(config.queue_capacity);
        let manager = Self {
            peer_id,
            config,
            events,
            swarms: Default::default(),
        };
        (manager, rx)
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Spawns the swarm of a torrent in the stopped state.
    pub fn register_torrent<S: Storage>(
        &mut self,
        info_hash: InfoHash,
        pieces: Vec<PieceDescriptor>,
        have: BitField,
        storage: S,
    ) -> Result<()> {
        if self.swarms.contains_key(&info_hash) {
            return Err(Error::ExistingInfoHash { hash: info_hash });
        }
        debug!("Registering torrent {} with {} pieces", info_hash, pieces.len());
        let handle = SwarmHandle::spawn(
            info_hash,
            self.peer_id,
            pieces,
            have,
            storage,
            self.config.clone(),
            self.events.clone(),
        );
        self.swarms.insert(info_hash, handle);
        Ok(())
    }

    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.swarms.contains_key(info_hash)
    }

    pub fn info_hashes(&self) -> impl Iterator<Item = &InfoHash> {
        self.swarms.keys()
    }

    fn swarm(&self, info_hash: &InfoHash) -> Result<&SwarmHandle> {
        self.swarms
            .get(info_hash)
            .ok_or(Error::TorrentInfoHashNotFound { hash: *info_hash })
    }

    pub async fn start(&self, info_hash: &InfoHash) -> Result<()> {
        self.swarm(info_hash)?.start().await
    }

    pub async fn stop(&self, info_hash: &InfoHash) -> Result<()> {
        self.swarm(info_hash)?.stop().await
    }

    /// Connects to `addr` on behalf of the torrent. Connect and handshake run
    /// in the background, a failure arrives as [`SwarmEvent::PeerDropped`].
    pub async fn add_peer(&self, info_hash: &InfoHash, addr: SocketAddr) -> Result<()> {
        self.swarm(info_hash)?.connect(addr).await
    }

    /// Routes an established connection to the swarm of the info hash it
    /// handshaked with.
    ///
    /// The connection keeps the frame limit it was handshaked with, torrents
    /// with very many pieces need a config from [`SwarmConfig::with_num_pieces`].
    pub async fn add_connection(&self, conn: PeerConnection) -> Result<()> {
        let info_hash = conn.remote_handshake().info_hash;
        match self.swarms.get(&info_hash) {
            Some(swarm) => swarm.add_peer(conn).await,
            None => {
                conn.disconnect().await;
                Err(Error::TorrentInfoHashNotFound { hash: info_hash })
            }
        }
    }

    pub async fn status(&self, info_hash: &InfoHash) -> Result<SwarmSnapshot> {
        self.swarm(info_hash)?.status().await
    }

    /// Disconnects every peer of the torrent and waits for its swarm to stop
    /// before forgetting it.
    pub async fn remove_torrent(&mut self, info_hash: &InfoHash) -> Result<()> {
        let handle = self
            .swarms
            .remove(info_hash)
            .ok_or(Error::TorrentInfoHashNotFound { hash: *info_hash })?;
        handle.shutdown().await;
        info!("Removed torrent {}", info_hash);
        Ok(())
    }

    /// Removes every torrent.
    pub async fn shutdown(&mut self) {
        for (info_hash, handle) in self.swarms.drain() {
            handle.shutdown().await;
            debug!("Swarm {} shut down", info_hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryStorage;
    use crate::peer::connection::tests::connected_pair;
    use crate::swarm::SwarmStatus;
    use crate::util::ShaHash;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time;

    fn register(manager: &mut SwarmManager, info_hash: InfoHash) -> Result<()> {
        let data = vec![7u8; 10];
        let pieces = PieceDescriptor::generate(10, 10, &[ShaHash::from_bytes(&data)]);
        manager.register_torrent(info_hash, pieces, BitField::new(1), MemoryStorage::new(10))
    }

    #[tokio::test]
    async fn registry() {
        let (mut manager, _events) = SwarmManager::new(ShaHash::random_peer_id(), SwarmConfig::default());
        let first = ShaHash::from([1; 20]);
        let unknown = ShaHash::from([2; 20]);

        register(&mut manager, first).unwrap();
        assert!(matches!(
            register(&mut manager, first),
            Err(Error::ExistingInfoHash { .. })
        ));
        assert!(manager.contains(&first));
        assert_eq!(manager.info_hashes().count(), 1);

        manager.start(&first).await.unwrap();
        assert_eq!(
            manager.status(&first).await.unwrap().status,
            SwarmStatus::Started
        );
        assert!(matches!(
            manager.start(&unknown).await,
            Err(Error::TorrentInfoHashNotFound { .. })
        ));

        manager.remove_torrent(&first).await.unwrap();
        assert!(!manager.contains(&first));
        assert!(matches!(
            manager.status(&first).await,
            Err(Error::TorrentInfoHashNotFound { .. })
        ));
        assert!(manager.remove_torrent(&first).await.is_err());
    }

    #[tokio::test]
    async fn connection_is_routed_by_info_hash() {
        let config = SwarmConfig::default();
        let (mut manager, mut events) = SwarmManager::new(ShaHash::random_peer_id(), config.clone());

        let (conn, _remote) = connected_pair(&config).await;
        assert!(manager.add_connection(conn).await.is_err());

        register(&mut manager, ShaHash::from([1; 20])).unwrap();
        let (conn, _remote) = connected_pair(&config).await;
        manager.add_connection(conn).await.unwrap();
        match events.recv().await.unwrap() {
            SwarmEvent::PeerConnected { info_hash, peer_id, .. } => {
                assert_eq!(info_hash, ShaHash::from([1; 20]));
                assert_eq!(peer_id, ShaHash::from([0xAB; 20]));
            }
            other => panic!("unexpected event {:?}", other),
        }
        manager.shutdown().await;
        assert_eq!(manager.info_hashes().count(), 0);
    }

    #[tokio::test]
    async fn failed_connect_is_reported() {
        let config = SwarmConfig::default().with_connect_timeout(Duration::from_secs(1));
        let (mut manager, mut events) = SwarmManager::new(ShaHash::random_peer_id(), config);
        let info_hash = ShaHash::from([3; 20]);
        register(&mut manager, info_hash).unwrap();

        // a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        manager.add_peer(&info_hash, addr).await.unwrap();
        let event = time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SwarmEvent::PeerDropped {
                addr: dropped,
                error: Some(err),
                ..
            } => {
                assert_eq!(dropped, addr);
                assert!(!err.is_protocol());
            }
            other => panic!("unexpected event {:?}", other),
        }
        manager.shutdown().await;
    }
}
