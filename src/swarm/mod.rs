//! The coordinator of a single torrent.
//!
//! One task owns all swarm state: the local bitfield, the pieces being
//! assembled and the connected peers. Sessions talk to it only through bounded
//! queues. The coordinator never waits on a session's queue, a full queue just
//! skips that peer until the next scheduling pass.

use fnv::{FnvHashMap, FnvHashSet};
use futures::future;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bitfield::BitField;
use crate::config::SwarmConfig;
use crate::disk::{self, Storage, WriteRequest, WriteResult};
use crate::error::{Error, Result};
use crate::peer::session::{PeerSession, ReceivedBlock, SessionCommand, SessionEvent};
use crate::peer::{ChokeType, PeerConnection};
use crate::piece::PieceDescriptor;
use crate::util::{until_cancelled, InfoHash, PeerId};

pub mod manager;
pub mod state;

pub use manager::SwarmManager;
use state::{BlockOutcome, SwarmState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmStatus {
    /// No blocks are requested.
    Stopped,
    /// Downloading.
    Started,
}

impl Default for SwarmStatus {
    fn default() -> Self {
        SwarmStatus::Stopped
    }
}

/// Point in time view of a swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmSnapshot {
    pub status: SwarmStatus,
    /// copy of the local bitfield
    pub pieces: BitField,
    pub peers: usize,
    /// pieces with some but not all blocks received
    pub pending: usize,
    /// events the consumer was too slow for
    pub dropped_events: usize,
}

/// Notifications for the layer driving the swarms.
#[derive(Debug)]
pub enum SwarmEvent {
    PeerConnected {
        info_hash: InfoHash,
        addr: SocketAddr,
        peer_id: PeerId,
    },
    /// A peer is gone. `error` is the reason unless we closed the connection.
    PeerDropped {
        info_hash: InfoHash,
        addr: SocketAddr,
        error: Option<Error>,
    },
    PieceCompleted {
        info_hash: InfoHash,
        index: u32,
    },
    /// A piece failed its checksum and will be downloaded again.
    PieceFailed {
        info_hash: InfoHash,
        index: u32,
    },
    StorageFailed {
        info_hash: InfoHash,
        index: u32,
        error: Error,
    },
    /// Every piece is verified and written.
    Finished {
        info_hash: InfoHash,
        pieces: BitField,
    },
}

impl SwarmEvent {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            SwarmEvent::PeerConnected { info_hash, .. }
            | SwarmEvent::PeerDropped { info_hash, .. }
            | SwarmEvent::PieceCompleted { info_hash, .. }
            | SwarmEvent::PieceFailed { info_hash, .. }
            | SwarmEvent::StorageFailed { info_hash, .. }
            | SwarmEvent::Finished { info_hash, .. } => *info_hash,
        }
    }
}

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    Connect(SocketAddr),
    AddPeer(PeerConnection),
    /// Outcome of a `Connect`.
    Connected {
        addr: SocketAddr,
        result: Result<PeerConnection>,
    },
    Status(oneshot::Sender<SwarmSnapshot>),
}

/// Controls a running swarm.
#[derive(Debug)]
pub struct SwarmHandle {
    info_hash: InfoHash,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SwarmHandle {
    /// Spawns the coordinator and the storage writer of a torrent.
    ///
    /// `have` marks the pieces already present in `storage`.
    ///
    /// # Panics
    ///
    /// If `have` does not have one bit per piece.
    pub fn spawn<S: Storage>(
        info_hash: InfoHash,
        peer_id: PeerId,
        pieces: Vec<PieceDescriptor>,
        have: BitField,
        storage: S,
        config: SwarmConfig,
        events: mpsc::Sender<SwarmEvent>,
    ) -> Self {
        let config = config.with_num_pieces(pieces.len());
        let capacity = config.queue_capacity;
        let (commands_tx, commands) = mpsc::channel(capacity);
        let (session_events_tx, session_events) = mpsc::channel(capacity);
        let (blocks_tx, blocks) = mpsc::channel(capacity);
        let (writes_tx, writes) = mpsc::channel(capacity);
        let (written_tx, written) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(disk::write_loop(storage, writes, written_tx));
        let swarm = Swarm {
            info_hash,
            peer_id,
            state: SwarmState::new(pieces, have, config.block_size),
            config,
            status: SwarmStatus::Stopped,
            finished: false,
            peers: Default::default(),
            connecting: Default::default(),
            banned: Default::default(),
            commands: commands_tx.clone(),
            session_events: session_events_tx,
            blocks: blocks_tx,
            writes: writes_tx,
            write_backlog: VecDeque::new(),
            unwritten: 0,
            writer,
            events,
            event_backlog: VecDeque::new(),
            dropped_events: 0,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(swarm.run(commands, session_events, blocks, written));

        Self {
            info_hash,
            commands: commands_tx,
            shutdown,
            task,
        }
    }

    #[inline]
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| Error::SwarmStopped {
                hash: self.info_hash,
            })
    }

    /// Starts requesting blocks.
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    /// Stops requesting blocks. Peers stay connected.
    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    /// Connects to `addr` in the background. The outcome is reported as a
    /// [`SwarmEvent`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.send(Command::Connect(addr)).await
    }

    /// Hands an already handshaked connection to the swarm.
    pub async fn add_peer(&self, conn: PeerConnection) -> Result<()> {
        if let Err(SendError(Command::AddPeer(conn))) =
            self.commands.send(Command::AddPeer(conn)).await
        {
            conn.disconnect().await;
            return Err(Error::SwarmStopped {
                hash: self.info_hash,
            });
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<SwarmSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| Error::SwarmStopped {
            hash: self.info_hash,
        })
    }

    /// Disconnects every peer, flushes pending writes and waits until the
    /// coordinator is gone.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            error!("Swarm {} failed: {}", self.info_hash, err);
        }
    }
}

/// A running session as seen by the coordinator.
#[derive(Debug)]
struct PeerHandle {
    commands: mpsc::Sender<SessionCommand>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct Swarm {
    info_hash: InfoHash,
    peer_id: PeerId,
    config: SwarmConfig,
    state: SwarmState,
    status: SwarmStatus,
    finished: bool,
    peers: FnvHashMap<SocketAddr, PeerHandle>,
    /// connects in flight
    connecting: FnvHashSet<SocketAddr>,
    /// peers that violated the protocol
    banned: FnvHashSet<SocketAddr>,
    commands: mpsc::Sender<Command>,
    session_events: mpsc::Sender<SessionEvent>,
    blocks: mpsc::Sender<ReceivedBlock>,
    writes: mpsc::Sender<WriteRequest>,
    /// verified pieces the writer queue had no room for yet
    write_backlog: VecDeque<WriteRequest>,
    /// verified pieces not confirmed by the writer
    unwritten: usize,
    writer: JoinHandle<()>,
    events: mpsc::Sender<SwarmEvent>,
    /// events the consumer had no room for yet
    event_backlog: VecDeque<SwarmEvent>,
    dropped_events: usize,
    shutdown: CancellationToken,
}

impl Swarm {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut session_events: mpsc::Receiver<SessionEvent>,
        mut blocks: mpsc::Receiver<ReceivedBlock>,
        mut written: mpsc::Receiver<WriteResult>,
    ) {
        debug!(
            "Swarm {} has {} of {} pieces",
            self.info_hash,
            self.state.have().count_ones(),
            self.state.num_pieces()
        );
        let mut tick = time::interval(self.config.schedule_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(cmd) = commands.recv() => self.on_command(cmd).await,
                Some(event) = session_events.recv() => self.on_session_event(event).await,
                Some(block) = blocks.recv() => self.on_block(block).await,
                Some(result) = written.recv() => self.on_written(result).await,
                _ = tick.tick() => self.schedule(),
            }
            self.flush_writes();
            self.flush_events();
        }

        // pending connects and the writer must not wait on us anymore
        drop(commands);
        drop(written);
        self.teardown().await;
    }

    /// Queues an event without waiting on the consumer. Once the backlog is
    /// full the oldest event is dropped.
    fn emit(&mut self, event: SwarmEvent) {
        self.event_backlog.push_back(event);
        if self.event_backlog.len() > self.config.queue_capacity {
            if let Some(dropped) = self.event_backlog.pop_front() {
                self.dropped_events += 1;
                warn!(
                    "Event consumer of swarm {} is behind, dropping {:?}",
                    self.info_hash, dropped
                );
            }
        }
        self.flush_events();
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.event_backlog.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.event_backlog.push_front(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    trace!("Nobody listens to the events of swarm {}", self.info_hash);
                    self.event_backlog.clear();
                }
            }
        }
    }

    fn snapshot(&self) -> SwarmSnapshot {
        SwarmSnapshot {
            status: self.status,
            pieces: self.state.have().clone(),
            peers: self.state.num_peers(),
            pending: self.state.num_pending(),
            dropped_events: self.dropped_events,
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.start().await,
            Command::Stop => {
                if self.status == SwarmStatus::Started {
                    info!("Stopping swarm {}", self.info_hash);
                }
                self.status = SwarmStatus::Stopped;
            }
            Command::Connect(addr) => self.connect(addr).await,
            Command::AddPeer(conn) => self.add_peer(conn).await,
            Command::Connected { addr, result } => {
                self.connecting.remove(&addr);
                match result {
                    Ok(conn) => self.add_peer(conn).await,
                    Err(err) => {
                        warn!("Failed to connect to {}: {}", addr, err);
                        if err.is_protocol() {
                            self.banned.insert(addr);
                        }
                        self.emit(SwarmEvent::PeerDropped {
                            info_hash: self.info_hash,
                            addr,
                            error: Some(err),
                        });
                    }
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn start(&mut self) {
        if self.finished {
            debug!("Swarm {} is already finished", self.info_hash);
            return;
        }
        info!("Starting swarm {}", self.info_hash);
        self.status = SwarmStatus::Started;
        self.schedule();
        self.check_finished().await;
    }

    async fn connect(&mut self, addr: SocketAddr) {
        if self.banned.contains(&addr) {
            debug!("Not connecting to banned peer {}", addr);
            self.emit(SwarmEvent::PeerDropped {
                info_hash: self.info_hash,
                addr,
                error: Some(Error::PeerBanned { addr }),
            });
            return;
        }
        if self.peers.contains_key(&addr) || !self.connecting.insert(addr) {
            debug!("Already connected to {}", addr);
            return;
        }

        let commands = self.commands.clone();
        let shutdown = self.shutdown.clone();
        let config = self.config.clone();
        let (info_hash, peer_id) = (self.info_hash, self.peer_id);
        tokio::spawn(async move {
            let connect = PeerConnection::connect(addr, info_hash, peer_id, &config);
            let result = match until_cancelled(&shutdown, connect).await {
                Some(result) => result,
                None => return,
            };
            if let Err(SendError(Command::Connected {
                result: Ok(conn), ..
            })) = commands.send(Command::Connected { addr, result }).await
            {
                conn.disconnect().await;
            }
        });
    }

    /// Starts a session for the connection, advertises our pieces and signals
    /// interest.
    async fn add_peer(&mut self, conn: PeerConnection) {
        let addr = conn.addr();
        if self.banned.contains(&addr) || self.peers.contains_key(&addr) {
            debug!("Rejecting connection to {}", addr);
            tokio::spawn(conn.disconnect());
            return;
        }
        let peer_id = conn.peer_id();

        let (commands, rx) = mpsc::channel(self.config.queue_capacity);
        // the queue is empty, so this can't fail
        let _ = commands.try_send(SessionCommand::Advertise(self.state.have().clone()));
        let shutdown = self.shutdown.child_token();
        let session = PeerSession::new(conn, self.state.num_pieces(), &self.config);
        let task = tokio::spawn(session.run(
            rx,
            self.session_events.clone(),
            self.blocks.clone(),
            shutdown.clone(),
        ));

        self.peers.insert(
            addr,
            PeerHandle {
                commands,
                shutdown,
                task,
            },
        );
        self.state.add_peer(addr);
        debug!("Peer {} joined swarm {}", addr, self.info_hash);
        self.emit(SwarmEvent::PeerConnected {
            info_hash: self.info_hash,
            addr,
            peer_id,
        });
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Choked { addr } => self.state.set_choke(&addr, ChokeType::Choked),
            SessionEvent::UnChoked { addr } => {
                self.state.set_choke(&addr, ChokeType::UnChoked);
                self.schedule();
            }
            SessionEvent::Bitfield { addr, pieces } => self.state.set_pieces(&addr, pieces),
            SessionEvent::Have { addr, index } => self.state.set_have(&addr, index),
            SessionEvent::Closed { addr, error } => self.drop_peer(addr, error).await,
        }
    }

    async fn drop_peer(&mut self, addr: SocketAddr, error: Option<Error>) {
        if let Some(peer) = self.peers.remove(&addr) {
            peer.shutdown.cancel();
            if let Err(err) = peer.task.await {
                error!("Session with {} failed: {}", addr, err);
            }
        }
        self.state.remove_peer(&addr);
        match &error {
            Some(err) if err.is_protocol() => {
                warn!("Dropping {} for violating the protocol: {}", addr, err);
                self.banned.insert(addr);
            }
            Some(err) => warn!("Lost peer {}: {}", addr, err),
            None => debug!("Peer {} left swarm {}", addr, self.info_hash),
        }
        self.emit(SwarmEvent::PeerDropped {
            info_hash: self.info_hash,
            addr,
            error,
        });
    }

    async fn on_block(&mut self, block: ReceivedBlock) {
        let ReceivedBlock { addr, piece } = block;
        match self.state.on_block(piece) {
            Ok(BlockOutcome::Pending) | Ok(BlockOutcome::Duplicate) => {}
            Ok(BlockOutcome::Completed {
                index,
                offset,
                data,
            }) => {
                info!(
                    "Piece {} of {} verified ({}/{})",
                    index,
                    self.info_hash,
                    self.state.have().count_ones(),
                    self.state.num_pieces()
                );
                for (addr, peer) in &self.peers {
                    if peer.commands.try_send(SessionCommand::Have(index)).is_err() {
                        trace!("Could not announce piece {} to {}", index, addr);
                    }
                }
                self.write_backlog.push_back(WriteRequest {
                    index,
                    offset,
                    data,
                });
                self.unwritten += 1;
                self.emit(SwarmEvent::PieceCompleted {
                    info_hash: self.info_hash,
                    index,
                });
            }
            Ok(BlockOutcome::Corrupt { index, error }) => {
                warn!("Discarding piece {} last served by {}: {}", index, addr, error);
                self.emit(SwarmEvent::PieceFailed {
                    info_hash: self.info_hash,
                    index,
                });
            }
            Err(err) if err.is_protocol() && self.peers.contains_key(&addr) => {
                self.drop_peer(addr, Some(err)).await
            }
            Err(err) => warn!("Ignoring block from {}: {}", addr, err),
        }
    }

    async fn on_written(&mut self, written: WriteResult) {
        self.unwritten = self.unwritten.saturating_sub(1);
        match written.result {
            Ok(()) => self.check_finished().await,
            Err(error) => {
                warn!(
                    "Piece {} of {} could not be stored: {}",
                    written.index, self.info_hash, error
                );
                self.state.mark_missing(written.index);
                self.emit(SwarmEvent::StorageFailed {
                    info_hash: self.info_hash,
                    index: written.index,
                    error,
                });
            }
        }
    }

    /// Hands queued pieces to the writer while it has room.
    fn flush_writes(&mut self) {
        while let Some(request) = self.write_backlog.pop_front() {
            match self.writes.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(request)) => {
                    self.write_backlog.push_front(request);
                    break;
                }
                Err(TrySendError::Closed(request)) => {
                    error!("Storage writer is gone, piece {} is lost", request.index);
                    self.unwritten = self.unwritten.saturating_sub(1);
                    self.state.mark_missing(request.index);
                }
            }
        }
    }

    /// Requests missing blocks from every unchoked peer.
    fn schedule(&self) {
        if self.status != SwarmStatus::Started {
            return;
        }
        for (addr, requests) in self.state.schedule(self.config.max_requests_per_peer) {
            if let Some(peer) = self.peers.get(&addr) {
                match peer.commands.try_send(SessionCommand::RequestBlocks(requests)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!("Queue of {} is full, skipping this round", addr)
                    }
                    Err(TrySendError::Closed(_)) => trace!("Session with {} is closing", addr),
                }
            }
        }
    }

    async fn check_finished(&mut self) {
        if self.finished
            || self.status != SwarmStatus::Started
            || self.unwritten > 0
            || !self.state.is_complete()
        {
            return;
        }
        self.finished = true;
        self.status = SwarmStatus::Stopped;
        info!(
            "Swarm {} finished with bitfield {:?}",
            self.info_hash,
            self.state.have()
        );
        self.emit(SwarmEvent::Finished {
            info_hash: self.info_hash,
            pieces: self.state.have().clone(),
        });
    }

    /// Stops every session before the swarm state is released.
    async fn teardown(mut self) {
        debug!("Tearing down swarm {}", self.info_hash);
        let peers: Vec<_> = self.peers.drain().collect();
        for (_, peer) in &peers {
            peer.shutdown.cancel();
        }
        // sessions close their connections in parallel
        let joined = future::join_all(
            peers
                .into_iter()
                .map(|(addr, peer)| async move { (addr, peer.task.await) }),
        )
        .await;
        for (addr, result) in joined {
            if let Err(err) = result {
                error!("Session with {} failed: {}", addr, err);
            }
        }

        let Swarm {
            writes,
            write_backlog,
            writer,
            ..
        } = self;
        for request in write_backlog {
            if writes.send(request).await.is_err() {
                break;
            }
        }
        drop(writes);
        if let Err(err) = writer.await {
            error!("Storage writer failed: {}", err);
        }
    }
}
