//! Per peer protocol state layered over a [`PeerConnection`].

use fnv::FnvHashSet;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bitfield::BitField;
use crate::config::SwarmConfig;
use crate::error::{Error, Result};
use crate::peer::connection::PeerConnection;
use crate::peer::{ChokeType, InterestType};
use crate::proto::message::{PeerMessage, PeerRequest, Piece};
use crate::util::until_cancelled;

/// What the swarm asks a session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send our bitfield followed by `interested`.
    Advertise(BitField),
    /// Request blocks, skipping the ones already outstanding.
    RequestBlocks(Vec<PeerRequest>),
    /// Announce a piece we just verified.
    Have(u32),
}

/// Changes of a session the swarm has to know about.
#[derive(Debug)]
pub enum SessionEvent {
    Choked {
        addr: SocketAddr,
    },
    UnChoked {
        addr: SocketAddr,
    },
    /// The remote replaced its whole bitfield.
    Bitfield {
        addr: SocketAddr,
        pieces: BitField,
    },
    Have {
        addr: SocketAddr,
        index: u32,
    },
    /// The session ended. `error` is set unless it was shut down locally.
    Closed {
        addr: SocketAddr,
        error: Option<Error>,
    },
}

/// A `piece` message, forwarded to the swarm for assembly.
#[derive(Debug)]
pub struct ReceivedBlock {
    pub addr: SocketAddr,
    pub piece: Piece,
}

/// The result of applying one inbound message to a [`SessionState`].
#[derive(Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Nothing the swarm cares about changed.
    Unchanged,
    Choked,
    UnChoked,
    Bitfield,
    Have(u32),
    Block(Piece),
}

/// The state of one session, owned exclusively by its task.
#[derive(Debug)]
pub struct SessionState {
    /// whether the remote chokes us
    choke: ChokeType,
    /// whether the remote wants data from us
    interest: InterestType,
    /// pieces the remote advertised
    pieces: BitField,
    /// block requests we sent and that were not answered yet
    outbound_requests: FnvHashSet<PeerRequest>,
    /// block requests the remote sent us
    inbound_requests: FnvHashSet<PeerRequest>,
    max_outbound: usize,
}

impl SessionState {
    pub fn new(num_pieces: usize, max_outbound: usize) -> Self {
        Self {
            choke: ChokeType::default(),
            interest: InterestType::default(),
            pieces: BitField::new(num_pieces),
            outbound_requests: Default::default(),
            inbound_requests: Default::default(),
            max_outbound,
        }
    }

    #[inline]
    pub fn choke(&self) -> ChokeType {
        self.choke
    }

    #[inline]
    pub fn is_choked(&self) -> bool {
        self.choke == ChokeType::Choked
    }

    #[inline]
    pub fn interest(&self) -> InterestType {
        self.interest
    }

    #[inline]
    pub fn pieces(&self) -> &BitField {
        &self.pieces
    }

    pub fn is_outstanding(&self, request: &PeerRequest) -> bool {
        self.outbound_requests.contains(request)
    }

    pub fn num_outstanding(&self) -> usize {
        self.outbound_requests.len()
    }

    pub fn inbound_requests(&self) -> impl Iterator<Item = &PeerRequest> {
        self.inbound_requests.iter()
    }

    /// Records an outbound request.
    ///
    /// Returns `false` if an equal request is already outstanding or the
    /// pipeline is full.
    pub fn track_outbound(&mut self, request: PeerRequest) -> bool {
        if self.outbound_requests.len() >= self.max_outbound {
            return false;
        }
        self.outbound_requests.insert(request)
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if (index as usize) < self.pieces.len() {
            Ok(())
        } else {
            Err(Error::PieceOutOfRange {
                index,
                num_pieces: self.pieces.len(),
            })
        }
    }

    /// Applies an inbound message.
    ///
    /// Indices are checked against the number of pieces, a remote sending
    /// anything out of range is a protocol error.
    pub fn on_message(&mut self, msg: PeerMessage) -> Result<SessionUpdate> {
        let update = match msg {
            PeerMessage::Choke => {
                self.choke = ChokeType::Choked;
                // a choking peer is not obliged to answer anything still in flight
                self.outbound_requests.clear();
                SessionUpdate::Choked
            }
            PeerMessage::UnChoke => {
                self.choke = ChokeType::UnChoked;
                SessionUpdate::UnChoked
            }
            PeerMessage::Interested => {
                self.interest = InterestType::Interested;
                SessionUpdate::Unchanged
            }
            PeerMessage::NotInterested => {
                self.interest = InterestType::NotInterested;
                self.inbound_requests.clear();
                SessionUpdate::Unchanged
            }
            PeerMessage::Have { index } => {
                self.check_index(index)?;
                self.pieces.set(index as usize, true);
                SessionUpdate::Have(index)
            }
            PeerMessage::Bitfield { index_field } => {
                if index_field.len() != self.pieces.byte_len() {
                    return Err(Error::InvalidFrame {
                        reason: format!(
                            "bitfield of {} bytes for {} pieces",
                            index_field.len(),
                            self.pieces.len()
                        ),
                    });
                }
                self.pieces.set_bytes(&index_field);
                SessionUpdate::Bitfield
            }
            PeerMessage::Request { peer_request } => {
                self.check_index(peer_request.index)?;
                self.inbound_requests.insert(peer_request);
                SessionUpdate::Unchanged
            }
            PeerMessage::Cancel { peer_request } => {
                self.inbound_requests.remove(&peer_request);
                SessionUpdate::Unchanged
            }
            PeerMessage::Piece { piece } => {
                self.check_index(piece.index)?;
                self.outbound_requests.remove(&piece.request());
                SessionUpdate::Block(piece)
            }
            PeerMessage::KeepAlive | PeerMessage::Port { .. } | PeerMessage::Generic { .. } => {
                SessionUpdate::Unchanged
            }
        };
        Ok(update)
    }
}

/// A session with one remote peer, run as its own task.
#[derive(Debug)]
pub struct PeerSession {
    conn: PeerConnection,
    state: SessionState,
}

impl PeerSession {
    pub fn new(conn: PeerConnection, num_pieces: usize, config: &SwarmConfig) -> Self {
        Self {
            conn,
            state: SessionState::new(num_pieces, config.max_requests_per_peer),
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    #[inline]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Queues a `request` for the block unless an equal request is still
    /// outstanding.
    ///
    /// Returns whether a new request was queued.
    pub async fn send_block_request(&mut self, request: PeerRequest) -> Result<bool> {
        if !self.state.track_outbound(request) {
            return Ok(false);
        }
        self.conn
            .send(PeerMessage::Request {
                peer_request: request,
            })
            .await?;
        Ok(true)
    }

    #[inline]
    pub async fn send(&self, msg: PeerMessage) -> Result<()> {
        self.conn.send(msg).await
    }

    async fn on_command(&mut self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::Advertise(pieces) => {
                self.send(PeerMessage::bitfield(&pieces)).await?;
                self.send(PeerMessage::Interested).await?;
            }
            SessionCommand::RequestBlocks(requests) => {
                let mut queued = 0;
                for request in requests {
                    if self.send_block_request(request).await? {
                        queued += 1;
                    }
                }
                if queued > 0 {
                    trace!("Requested {} blocks from {}", queued, self.addr());
                }
            }
            SessionCommand::Have(index) => self.send(PeerMessage::Have { index }).await?,
        }
        Ok(())
    }

    /// Drives the session until the connection closes, the command queue is
    /// dropped or `shutdown` fires.
    ///
    /// Messages are demultiplexed: state changes go to `events`, received
    /// blocks to `blocks`. The connection is disconnected before the final
    /// [`SessionEvent::Closed`] is emitted, which is skipped on shutdown.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
        blocks: mpsc::Sender<ReceivedBlock>,
        shutdown: CancellationToken,
    ) {
        let addr = self.addr();
        let error = loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => break None,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => until_cancelled(&shutdown, self.on_command(cmd)).await,
                    None => break None,
                },
                msg = self.conn.recv() => match msg {
                    Some(msg) => until_cancelled(&shutdown, self.on_message(msg, &events, &blocks)).await,
                    None => break None,
                },
            };
            match step {
                None => break None,
                Some(Ok(())) => {}
                Some(Err(err)) => break Some(err),
            }
        };

        let reason = self.conn.disconnect().await;
        let error = error.or(reason);
        if let Some(err) = &error {
            debug!("Session with {} ended: {}", addr, err);
        }
        if !shutdown.is_cancelled() {
            let _ = until_cancelled(&shutdown, events.send(SessionEvent::Closed { addr, error }))
                .await;
        }
    }

    async fn on_message(
        &mut self,
        msg: PeerMessage,
        events: &mpsc::Sender<SessionEvent>,
        blocks: &mpsc::Sender<ReceivedBlock>,
    ) -> Result<()> {
        let addr = self.addr();
        let event = match self.state.on_message(msg)? {
            SessionUpdate::Unchanged => return Ok(()),
            SessionUpdate::Block(piece) => {
                return blocks
                    .send(ReceivedBlock { addr, piece })
                    .await
                    .map_err(|_| Error::ConnectionClosed { addr });
            }
            SessionUpdate::Choked => SessionEvent::Choked { addr },
            SessionUpdate::UnChoked => SessionEvent::UnChoked { addr },
            SessionUpdate::Have(index) => SessionEvent::Have { addr, index },
            SessionUpdate::Bitfield => SessionEvent::Bitfield {
                addr,
                pieces: self.state.pieces().clone(),
            },
        };
        events
            .send(event)
            .await
            .map_err(|_| Error::ConnectionClosed { addr })
    }
}
