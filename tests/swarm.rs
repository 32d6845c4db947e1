use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::Framed;

use bittorrent_swarm::disk::MemoryStorage;
use bittorrent_swarm::piece::PieceDescriptor;
use bittorrent_swarm::proto::{Handshake, HandshakeCodec, PeerMessage, PeerWireCodec, Piece};
use bittorrent_swarm::{BitField, ShaHash, SwarmConfig, SwarmEvent, SwarmManager};

const PIECE_LENGTH: u32 = 4096;
const TOTAL_LENGTH: usize = 10_000;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn content() -> Vec<u8> {
    (0..TOTAL_LENGTH).map(|i| (i % 251) as u8).collect()
}

fn descriptors(data: &[u8]) -> Vec<PieceDescriptor> {
    let hashes: Vec<_> = data
        .chunks(PIECE_LENGTH as usize)
        .map(ShaHash::from_bytes)
        .collect();
    PieceDescriptor::generate(data.len() as u64, PIECE_LENGTH, &hashes)
}

fn config() -> SwarmConfig {
    SwarmConfig::default()
        .with_block_size(1024)
        .with_schedule_interval(Duration::from_millis(50))
}

/// A remote peer holding `pieces` of `data`, serving a single connection.
async fn seeder(
    info_hash: ShaHash,
    data: Vec<u8>,
    pieces: Vec<u32>,
) -> (SocketAddr, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, HandshakeCodec);
        let theirs = framed.next().await.unwrap().unwrap();
        framed
            .send(Handshake::new(info_hash, ShaHash::random_peer_id()))
            .await
            .unwrap();
        if theirs.info_hash != info_hash {
            return 0;
        }
        let mut framed = framed.map_codec(|_| PeerWireCodec::default());

        let num_pieces = (data.len() + PIECE_LENGTH as usize - 1) / PIECE_LENGTH as usize;
        let mut bitfield = BitField::new(num_pieces);
        pieces.iter().for_each(|index| bitfield.set(*index as usize, true));
        framed.send(PeerMessage::bitfield(&bitfield)).await.unwrap();
        framed.send(PeerMessage::UnChoke).await.unwrap();

        let mut served = 0;
        while let Some(Ok(msg)) = framed.next().await {
            if let PeerMessage::Request { peer_request: req } = msg {
                assert!(pieces.contains(&req.index), "requested a missing piece");
                let start = (req.index * PIECE_LENGTH + req.begin) as usize;
                let block = data[start..start + req.length as usize].to_vec();
                let piece = Piece {
                    index: req.index,
                    begin: req.begin,
                    block: block.into(),
                };
                if framed.send(PeerMessage::Piece { piece }).await.is_err() {
                    break;
                }
                served += 1;
            }
        }
        served
    });
    (addr, task)
}

async fn wait_finished(events: &mut mpsc::Receiver<SwarmEvent>) -> BitField {
    loop {
        let event = time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("download stalled")
            .expect("event channel closed");
        match event {
            SwarmEvent::Finished { pieces, .. } => return pieces,
            SwarmEvent::PeerDropped { error: Some(err), .. } => panic!("peer dropped: {}", err),
            SwarmEvent::PieceFailed { index, .. } => panic!("piece {} failed", index),
            SwarmEvent::StorageFailed { error, .. } => panic!("storage failed: {}", error),
            _ => {}
        }
    }
}

#[tokio::test]
async fn download_from_single_seeder() {
    init();
    let data = content();
    let info_hash = ShaHash::from_bytes(b"single seeder");
    let (addr, seeder) = seeder(info_hash, data.clone(), vec![0, 1, 2]).await;

    let (mut manager, mut events) = SwarmManager::new(ShaHash::random_peer_id(), config());
    let storage = MemoryStorage::new(TOTAL_LENGTH);
    manager
        .register_torrent(info_hash, descriptors(&data), BitField::new(3), storage.clone())
        .unwrap();
    manager.start(&info_hash).await.unwrap();
    manager.add_peer(&info_hash, addr).await.unwrap();

    let pieces = wait_finished(&mut events).await;
    assert_eq!(pieces.count_ones(), 3);
    assert_eq!(storage.to_vec(), data);

    manager.remove_torrent(&info_hash).await.unwrap();
    // 4 + 4 + 2 blocks of 1024 bytes, a block may be requested twice
    assert!(seeder.await.unwrap() >= 10);
}

#[tokio::test]
async fn download_from_partial_seeders() {
    init();
    let data = content();
    let info_hash = ShaHash::from_bytes(b"partial seeders");
    let (first, first_seeder) = seeder(info_hash, data.clone(), vec![0]).await;
    let (second, second_seeder) = seeder(info_hash, data.clone(), vec![1, 2]).await;

    let (mut manager, mut events) = SwarmManager::new(ShaHash::random_peer_id(), config());
    let storage = MemoryStorage::new(TOTAL_LENGTH);
    manager
        .register_torrent(info_hash, descriptors(&data), BitField::new(3), storage.clone())
        .unwrap();
    manager.start(&info_hash).await.unwrap();
    manager.add_peer(&info_hash, first).await.unwrap();
    manager.add_peer(&info_hash, second).await.unwrap();

    wait_finished(&mut events).await;
    assert_eq!(storage.to_vec(), data);

    manager.shutdown().await;
    assert!(first_seeder.await.unwrap() >= 4);
    assert!(second_seeder.await.unwrap() >= 6);
}

#[tokio::test]
async fn resumed_download_fetches_only_missing_pieces() {
    init();
    let data = content();
    let info_hash = ShaHash::from_bytes(b"resume");
    // panics if asked for the piece we already have
    let (addr, seeder) = seeder(info_hash, data.clone(), vec![1, 2]).await;

    // the first piece is already stored
    let mut existing = vec![0u8; TOTAL_LENGTH];
    existing[..PIECE_LENGTH as usize].copy_from_slice(&data[..PIECE_LENGTH as usize]);
    let storage = MemoryStorage::from_bytes(existing);
    let pieces = descriptors(&data);
    let (storage, have) = bittorrent_swarm::checker::check_torrent(storage, pieces.clone())
        .await
        .unwrap();
    assert_eq!(have.count_ones(), 1);

    let (mut manager, mut events) = SwarmManager::new(ShaHash::random_peer_id(), config());
    manager
        .register_torrent(info_hash, pieces, have, storage.clone())
        .unwrap();
    manager.start(&info_hash).await.unwrap();
    manager.add_peer(&info_hash, addr).await.unwrap();

    wait_finished(&mut events).await;
    assert_eq!(storage.to_vec(), data);
    manager.shutdown().await;
    assert!(seeder.await.unwrap() >= 6);
}

#[tokio::test]
async fn wrong_torrent_is_rejected() {
    init();
    let data = content();
    let info_hash = ShaHash::from_bytes(b"ours");
    let (addr, _seeder) = seeder(ShaHash::from_bytes(b"theirs"), data.clone(), vec![0]).await;

    let (mut manager, mut events) = SwarmManager::new(ShaHash::random_peer_id(), config());
    manager
        .register_torrent(info_hash, descriptors(&data), BitField::new(3), MemoryStorage::new(TOTAL_LENGTH))
        .unwrap();
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
            assert!(err.is_protocol());
        }
        other => panic!("unexpected event {:?}", other),
    }
    manager.shutdown().await;
}
