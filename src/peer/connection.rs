//! A single transport connection to a remote peer.
//!
//! After the handshake the connection is driven by two tasks: a reader that
//! decodes frames into the inbound queue and a writer that encodes frames from
//! the outbound queue. Both queues are bounded.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::SwarmConfig;
use crate::error::{Error, Result};
use crate::proto::codec::{HandshakeCodec, PeerWireCodec};
use crate::proto::message::{Handshake, PeerMessage};
use crate::util::{InfoHash, PeerId};

type WireSink<S> = SplitSink<Framed<S, PeerWireCodec>, PeerMessage>;
type WireStream<S> = SplitStream<Framed<S, PeerWireCodec>>;

/// An established, handshaked connection to one remote peer.
#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    /// The handshake the remote answered with.
    remote: Handshake,
    outbound: mpsc::Sender<PeerMessage>,
    inbound: mpsc::Receiver<PeerMessage>,
    shutdown: CancellationToken,
    reader: JoinHandle<Option<Error>>,
    writer: JoinHandle<Option<Error>>,
}

impl PeerConnection {
    /// Opens a TCP connection to `addr` and performs the handshake.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        config: &SwarmConfig,
    ) -> Result<Self> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout {
                operation: "connecting",
                after: config.connect_timeout,
            })??;
        debug!("Connected to {}", addr);
        Self::handshake(stream, addr, info_hash, peer_id, config).await
    }

    /// Exchanges handshakes over an already open stream and starts the read
    /// and write loops.
    ///
    /// Fails if the remote does not answer within the read timeout or answers
    /// for a different torrent.
    pub async fn handshake<S>(
        stream: S,
        addr: SocketAddr,
        info_hash: InfoHash,
        peer_id: PeerId,
        config: &SwarmConfig,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, HandshakeCodec);
        let local = Handshake::with_protocol(config.protocol.clone(), info_hash, peer_id);

        timeout(config.read_timeout, framed.send(local))
            .await
            .map_err(|_| Error::Timeout {
                operation: "sending the handshake",
                after: config.read_timeout,
            })??;

        let remote = match timeout(config.read_timeout, framed.next()).await {
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "waiting for the handshake",
                    after: config.read_timeout,
                })
            }
            Ok(None) => return Err(Error::ConnectionClosed { addr }),
            Ok(Some(handshake)) => handshake?,
        };

        if remote.info_hash != info_hash {
            return Err(Error::InfoHashMismatch {
                expected: info_hash,
                got: remote.info_hash,
            });
        }
        debug!("Handshake with {} ({})", addr, remote.peer_id);

        let framed = framed.map_codec(|_| config.codec());
        Ok(Self::spawn(framed, addr, remote, config))
    }

    fn spawn<S>(
        framed: Framed<S, PeerWireCodec>,
        addr: SocketAddr,
        remote: Handshake,
        config: &SwarmConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = framed.split::<PeerMessage>();
        let (inbound_tx, inbound) = mpsc::channel(config.queue_capacity);
        let (outbound, outbound_rx) = mpsc::channel(config.queue_capacity);
        let shutdown = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            addr,
            stream,
            inbound_tx,
            shutdown.clone(),
            config.read_timeout,
        ));
        let writer = tokio::spawn(write_loop(
            addr,
            sink,
            outbound_rx,
            shutdown.clone(),
            config.read_timeout,
        ));

        Self {
            addr,
            remote,
            outbound,
            inbound,
            shutdown,
            reader,
            writer,
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The peer id the remote presented in its handshake.
    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.remote.peer_id
    }

    #[inline]
    pub fn remote_handshake(&self) -> &Handshake {
        &self.remote
    }

    /// Whether either loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queues a message, waiting while the outbound queue is full.
    pub async fn send(&self, msg: PeerMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::ConnectionClosed { addr: self.addr })
    }

    /// The next received message. `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<PeerMessage> {
        self.inbound.recv().await
    }

    /// Closes the connection: signals both loops to stop and waits until they
    /// did.
    ///
    /// Returns the error that ended the connection, if it was not closed by us.
    pub async fn disconnect(self) -> Option<Error> {
        let PeerConnection {
            addr,
            shutdown,
            reader,
            writer,
            ..
        } = self;
        shutdown.cancel();
        let read_err = reader.await.ok().flatten();
        let write_err = writer.await.ok().flatten();
        debug!("Disconnected from {}", addr);
        read_err.or(write_err)
    }
}

async fn read_loop<S>(
    addr: SocketAddr,
    mut stream: WireStream<S>,
    inbound: mpsc::Sender<PeerMessage>,
    shutdown: CancellationToken,
    read_timeout: Duration,
) -> Option<Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break None,
            _ = inbound.closed() => break None,
            next = timeout(read_timeout, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                trace!("No frame from {} within {:?}", addr, read_timeout);
                continue;
            }
            Ok(None) => {
                debug!("{} closed the connection", addr);
                break Some(Error::ConnectionClosed { addr });
            }
            Ok(Some(Err(err))) => {
                warn!("Failed to read from {}: {}", addr, err);
                break Some(err);
            }
            Ok(Some(Ok(msg))) => msg,
        };
        trace!("Received message {:?} from {}", msg.id(), addr);
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            sent = inbound.send(msg) => {
                if sent.is_err() {
                    break None;
                }
            }
        }
    };
    shutdown.cancel();
    reason
}

async fn write_loop<S>(
    addr: SocketAddr,
    mut sink: WireSink<S>,
    mut outbound: mpsc::Receiver<PeerMessage>,
    shutdown: CancellationToken,
    io_timeout: Duration,
) -> Option<Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break None,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break None,
            },
        };
        trace!("Sending message {:?} to {}", msg.id(), addr);
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            sent = sink.send(msg) => {
                if let Err(err) = sent {
                    warn!("Failed to write to {}: {}", addr, err);
                    break Some(err);
                }
            }
        }
    };
    shutdown.cancel();
    let _ = timeout(io_timeout, sink.close()).await;
    reason
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::ShaHash;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;

    pub(crate) fn test_addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    /// Answers the handshake like a remote peer would and returns the framed
    /// stream for talking peer wire messages.
    pub(crate) async fn remote_peer(
        stream: DuplexStream,
        info_hash: InfoHash,
    ) -> Framed<DuplexStream, PeerWireCodec> {
        let mut framed = Framed::new(stream, HandshakeCodec);
        let theirs = framed.next().await.unwrap().unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        framed
            .send(Handshake::new(info_hash, ShaHash::from([0xAB; 20])))
            .await
            .unwrap();
        framed.map_codec(|_| PeerWireCodec::default())
    }

    /// A local connection paired with the remote end of it.
    pub(crate) async fn connected_pair(
        config: &SwarmConfig,
    ) -> (PeerConnection, Framed<DuplexStream, PeerWireCodec>) {
        connected_pair_at(config, test_addr(), 1 << 16).await
    }

    /// Like [`connected_pair`], with the given remote address and a transport
    /// that buffers at most `capacity` bytes.
    pub(crate) async fn connected_pair_at(
        config: &SwarmConfig,
        addr: SocketAddr,
        capacity: usize,
    ) -> (PeerConnection, Framed<DuplexStream, PeerWireCodec>) {
        let (local, remote) = tokio::io::duplex(capacity);
        let info_hash = ShaHash::from([1; 20]);
        let remote = tokio::spawn(remote_peer(remote, info_hash));
        let conn = PeerConnection::handshake(
            local,
            addr,
            info_hash,
            ShaHash::random_peer_id(),
            config,
        )
        .await
        .unwrap();
        (conn, remote.await.unwrap())
    }

    #[tokio::test]
    async fn exchange_messages() {
        let (mut conn, mut remote) = connected_pair(&SwarmConfig::default()).await;
        assert_eq!(conn.peer_id(), ShaHash::from([0xAB; 20]));

        remote.send(PeerMessage::Have { index: 3 }).await.unwrap();
        assert_eq!(conn.recv().await, Some(PeerMessage::Have { index: 3 }));

        conn.send(PeerMessage::Interested).await.unwrap();
        assert_eq!(
            remote.next().await.unwrap().unwrap(),
            PeerMessage::Interested
        );

        assert!(conn.disconnect().await.is_none());
        // both loops are gone, so the remote sees the end of the stream
        assert!(remote.next().await.is_none());
    }

    #[tokio::test]
    async fn info_hash_mismatch() {
        let (local, remote) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let mut framed = Framed::new(remote, HandshakeCodec);
            let _ = framed.next().await;
            let _ = framed
                .send(Handshake::new(ShaHash::from([2; 20]), ShaHash::random()))
                .await;
        });
        let err = PeerConnection::handshake(
            local,
            test_addr(),
            ShaHash::from([1; 20]),
            ShaHash::random_peer_id(),
            &SwarmConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InfoHashMismatch { .. }));
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let (local, _remote) = tokio::io::duplex(1 << 16);
        let config = SwarmConfig::default().with_read_timeout(Duration::from_millis(50));
        let err = PeerConnection::handshake(
            local,
            test_addr(),
            ShaHash::from([1; 20]),
            ShaHash::random_peer_id(),
            &config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn read_timeout_is_not_fatal() {
        let config = SwarmConfig::default().with_read_timeout(Duration::from_millis(20));
        let (mut conn, mut remote) = connected_pair(&config).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        remote.send(PeerMessage::UnChoke).await.unwrap();
        assert_eq!(conn.recv().await, Some(PeerMessage::UnChoke));
        assert!(!conn.is_closed());
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn remote_close_is_observable() {
        let (mut conn, remote) = connected_pair(&SwarmConfig::default()).await;
        drop(remote);
        assert_eq!(conn.recv().await, None);
        let reason = conn.disconnect().await;
        assert!(matches!(reason, Some(Error::ConnectionClosed { .. })));
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let (mut conn, remote) = connected_pair(&SwarmConfig::default()).await;
        let mut raw = remote.into_inner();
        // a `have` without its piece index
        tokio::io::AsyncWriteExt::write_all(&mut raw, &[0, 0, 0, 1, 4])
            .await
            .unwrap();
        assert_eq!(conn.recv().await, None);
        let reason = conn.disconnect().await.unwrap();
        assert!(reason.is_protocol());
    }

    #[tokio::test]
    async fn unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = PeerConnection::connect(
            addr,
            ShaHash::random(),
            ShaHash::random_peer_id(),
            &SwarmConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
