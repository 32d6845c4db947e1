use std::env;
use std::path::PathBuf;
use tokio::sync::mpsc;

use bittorrent_swarm::checker::check_torrent;
use bittorrent_swarm::disk::FileStorage;
use bittorrent_swarm::tracker::{AnnounceResult, Announcer, PeerEvent, Tracker, TrackerRequest};
use bittorrent_swarm::{MetaInfo, ShaHash, SwarmConfig, SwarmEvent, SwarmManager};

const LISTEN_PORT: u16 = 6881;

#[tokio::main]
async fn main() {
    env_logger::init();

    let torrent = env::args().nth(1).expect("Usage: download <torrent> [target dir]");
    let target = env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let meta = MetaInfo::from_torrent_file(&torrent).expect("Failed to load torrent file");
    let info_hash = meta.info_hash;
    println!("{} ({} bytes, {} pieces)", meta.info.name, meta.total_length(), meta.num_pieces());

    // resume from whatever is already on disk
    let pieces = meta.piece_descriptors();
    let storage = FileStorage::new(&target, meta.file_layout());
    let (storage, have) = check_torrent(storage, pieces.clone())
        .await
        .expect("Failed to check existing data");
    let left: u64 = pieces
        .iter()
        .filter(|piece| !have.get(piece.index as usize))
        .map(|piece| u64::from(piece.length))
        .sum();
    println!("{} of {} pieces present", have.count_ones(), have.len());
    let piece_lengths: Vec<u32> = pieces.iter().map(|piece| piece.length).collect();

    let peer_id = ShaHash::random_peer_id();
    let (mut manager, mut events) = SwarmManager::new(peer_id, SwarmConfig::default());
    manager
        .register_torrent(info_hash, pieces, have, storage)
        .expect("Failed to register torrent");
    manager.start(&info_hash).await.expect("Swarm stopped");

    let trackers: Vec<_> = meta
        .trackers()
        .into_iter()
        .filter_map(|url| match Tracker::from_url(url) {
            Ok(tracker) => Some(tracker),
            Err(err) => {
                println!("Skipping tracker: {}", err);
                None
            }
        })
        .collect();
    if trackers.is_empty() {
        println!("No usable trackers");
        manager.shutdown().await;
        return;
    }
    let request = TrackerRequest::new(info_hash, peer_id, LISTEN_PORT, left).with_event(PeerEvent::Started);
    let (announces_tx, mut announces) = mpsc::channel(16);
    let announcer = Announcer::spawn(trackers, request, announces_tx);

    let mut downloaded = 0u64;
    loop {
        tokio::select! {
            Some(AnnounceResult { url, result }) = announces.recv() => match result {
                Ok(announce) => {
                    println!("{} returned {} peers", url, announce.peers.len());
                    for peer in announce.peers {
                        manager
                            .add_peer(&info_hash, peer.addr)
                            .await
                            .expect("Swarm stopped");
                    }
                }
                Err(err) => println!("Announce to {} failed: {}", url, err),
            },
            Some(event) = events.recv() => match event {
                SwarmEvent::PeerConnected { addr, peer_id, .. } => {
                    println!("connected to {} ({})", addr, peer_id)
                }
                SwarmEvent::PeerDropped { addr, error, .. } => match error {
                    Some(err) => println!("dropped {}: {}", addr, err),
                    None => println!("dropped {}", addr),
                },
                SwarmEvent::PieceCompleted { index, .. } => {
                    println!("piece {} done", index);
                    downloaded += u64::from(piece_lengths[index as usize]);
                    announcer.set_progress(0, downloaded, left.saturating_sub(downloaded));
                }
                SwarmEvent::PieceFailed { index, .. } => println!("piece {} failed its hash check", index),
                SwarmEvent::StorageFailed { index, error, .. } => {
                    println!("could not store piece {}: {}", index, error)
                }
                SwarmEvent::Finished { pieces, .. } => {
                    println!("finished, {} pieces", pieces.count_ones());
                    break;
                }
            },
            else => break,
        }
    }

    announcer.shutdown().await;
    manager.shutdown().await;
}
