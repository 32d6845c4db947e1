//! Announces over the UDP tracker protocol (BEP 15).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use super::{compact_peers_v4, Announce, PeerEvent, TrackerRequest};
use crate::error::{Error, Result};

/// Magic connection id of every connect request.
const PROTOCOL_ID: u64 = 0x417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_RESPONSE_LEN: usize = 20;
const ANNOUNCE_REQUEST_LEN: usize = 98;

/// Announces to a single `udp://host:port` tracker.
#[derive(Debug, Clone)]
pub struct UdpTracker {
    url: String,
    /// wait for the first answer, doubled on every retransmission
    timeout: Duration,
    retries: u32,
}

impl UdpTracker {
    pub const TIMEOUT: Duration = Duration::from_secs(15);
    pub const RETRIES: u32 = 3;

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Self::TIMEOUT,
            retries: Self::RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<Announce> {
        debug!(
            "Announcing {} to {} ({:?})",
            request.info_hash, self.url, request.event
        );
        let host = udp_host(&self.url)?;
        let addr = lookup_host(host)
            .await?
            .next()
            .ok_or_else(|| Error::TrackerFailure {
                reason: format!("{} does not resolve", host),
            })?;
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        let transaction_id = rand::random();
        let response = self
            .round_trip(&socket, &connect_request(transaction_id))
            .await?;
        let connection_id = parse_connect_response(&response, transaction_id)?;
        trace!("Tracker {} assigned connection id {}", self.url, connection_id);

        let transaction_id = rand::random();
        let packet = announce_request(connection_id, transaction_id, rand::random(), request);
        let response = self.round_trip(&socket, &packet).await?;
        let announce = parse_announce_response(&response, transaction_id)?;
        debug!(
            "Tracker {} returned {} peers",
            self.url,
            announce.peers.len()
        );
        Ok(announce)
    }

    /// Sends `packet` until an answer arrives, waiting twice as long after
    /// every attempt.
    async fn round_trip(&self, socket: &UdpSocket, packet: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        let mut wait = self.timeout;
        for attempt in 0..=self.retries {
            socket.send(packet).await?;
            match timeout(wait, socket.recv(&mut buf)).await {
                Ok(received) => {
                    buf.truncate(received?);
                    return Ok(buf);
                }
                Err(_) => {
                    debug!(
                        "No answer from {} within {:?} (attempt {})",
                        self.url,
                        wait,
                        attempt + 1
                    );
                    wait *= 2;
                }
            }
        }
        Err(Error::Timeout {
            operation: "waiting for the tracker",
            after: wait / 2,
        })
    }
}

/// The `host:port` part of a `udp://host:port/path` url.
fn udp_host(url: &str) -> Result<&str> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| Error::TrackerFailure {
            reason: format!("not a udp tracker: {}", url),
        })?;
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        return Err(Error::TrackerFailure {
            reason: format!("missing host in {}", url),
        });
    }
    Ok(host)
}

fn event_id(event: Option<PeerEvent>) -> u32 {
    match event {
        None => 0,
        Some(PeerEvent::Completed) => 1,
        Some(PeerEvent::Started) => 2,
        Some(PeerEvent::Stopped) => 3,
    }
}

fn connect_request(transaction_id: u32) -> BytesMut {
    let mut packet = BytesMut::with_capacity(16);
    packet.put_u64(PROTOCOL_ID);
    packet.put_u32(ACTION_CONNECT);
    packet.put_u32(transaction_id);
    packet
}

fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &TrackerRequest,
) -> BytesMut {
    let mut packet = BytesMut::with_capacity(ANNOUNCE_REQUEST_LEN);
    packet.put_u64(connection_id);
    packet.put_u32(ACTION_ANNOUNCE);
    packet.put_u32(transaction_id);
    packet.put_slice(request.info_hash.as_ref());
    packet.put_slice(request.peer_id.as_ref());
    packet.put_u64(request.downloaded);
    packet.put_u64(request.left);
    packet.put_u64(request.uploaded);
    packet.put_u32(event_id(request.event));
    // let the tracker use the source address
    packet.put_u32(0);
    packet.put_u32(key);
    packet.put_i32(request.numwant.map_or(-1, |n| n.min(i32::MAX as u32) as i32));
    packet.put_u16(request.port);
    packet
}

/// Checks action and transaction id of a response, turning error responses
/// into [`Error::TrackerFailure`].
fn check_header(data: &[u8], action: u32, transaction_id: u32, min_len: usize) -> Result<()> {
    if data.len() >= 8 && BigEndian::read_u32(&data[..4]) == ACTION_ERROR {
        return Err(Error::TrackerFailure {
            reason: String::from_utf8_lossy(&data[8..]).into_owned(),
        });
    }
    if data.len() < min_len {
        return Err(Error::TrackerFailure {
            reason: format!("response of {} bytes is too short", data.len()),
        });
    }
    if BigEndian::read_u32(&data[..4]) != action {
        return Err(Error::TrackerFailure {
            reason: format!("unexpected action {}", BigEndian::read_u32(&data[..4])),
        });
    }
    if BigEndian::read_u32(&data[4..8]) != transaction_id {
        return Err(Error::TrackerFailure {
            reason: "transaction id mismatch".to_string(),
        });
    }
    Ok(())
}

fn parse_connect_response(data: &[u8], transaction_id: u32) -> Result<u64> {
    check_header(data, ACTION_CONNECT, transaction_id, CONNECT_RESPONSE_LEN)?;
    Ok(BigEndian::read_u64(&data[8..16]))
}

fn parse_announce_response(data: &[u8], transaction_id: u32) -> Result<Announce> {
    check_header(data, ACTION_ANNOUNCE, transaction_id, ANNOUNCE_RESPONSE_LEN)?;
    let interval = BigEndian::read_u32(&data[8..12]);
    let leechers = BigEndian::read_u32(&data[12..16]);
    let seeders = BigEndian::read_u32(&data[16..20]);
    trace!("{} seeders, {} leechers", seeders, leechers);

    let peers = &data[ANNOUNCE_RESPONSE_LEN..];
    // a trailing partial entry is ignored
    let peers = &peers[..peers.len() - peers.len() % 6];
    Ok(Announce {
        interval: Duration::from_secs(u64::from(interval)),
        peers: compact_peers_v4(peers)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::peer::PeerAddress;
    use crate::util::ShaHash;
    use tokio::task::JoinHandle;

    /// A tracker answering every connect and announce on one socket. Returns
    /// the url and the event id and `left` of every announce received.
    pub(crate) async fn udp_tracker(
        interval: u32,
        peers: Vec<u8>,
        announces: usize,
    ) -> (String, JoinHandle<Vec<(u32, u64)>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", socket.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let mut events = Vec::new();
            let mut buf = [0u8; 2048];
            while events.len() < announces {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let packet = &buf[..n];
                let action = BigEndian::read_u32(&packet[8..12]);
                let transaction_id = BigEndian::read_u32(&packet[12..16]);
                let mut reply = BytesMut::new();
                if action == ACTION_CONNECT {
                    assert_eq!(n, 16);
                    assert_eq!(BigEndian::read_u64(&packet[..8]), PROTOCOL_ID);
                    reply.put_u32(ACTION_CONNECT);
                    reply.put_u32(transaction_id);
                    reply.put_u64(0xC0FFEE);
                } else {
                    assert_eq!(n, ANNOUNCE_REQUEST_LEN);
                    assert_eq!(BigEndian::read_u64(&packet[..8]), 0xC0FFEE);
                    events.push((
                        BigEndian::read_u32(&packet[80..84]),
                        BigEndian::read_u64(&packet[64..72]),
                    ));
                    reply.put_u32(ACTION_ANNOUNCE);
                    reply.put_u32(transaction_id);
                    reply.put_u32(interval);
                    reply.put_u32(2);
                    reply.put_u32(1);
                    reply.put_slice(&peers);
                }
                socket.send_to(&reply, from).await.unwrap();
            }
            events
        });
        (url, task)
    }

    fn request() -> TrackerRequest {
        TrackerRequest::new(ShaHash::from([1; 20]), ShaHash::from([2; 20]), 6881, 1000)
    }

    #[test]
    fn announce_packet_layout() {
        let packet = announce_request(7, 9, 11, &request().with_event(PeerEvent::Started));
        assert_eq!(packet.len(), ANNOUNCE_REQUEST_LEN);
        assert_eq!(BigEndian::read_u64(&packet[..8]), 7);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), ACTION_ANNOUNCE);
        assert_eq!(BigEndian::read_u32(&packet[12..16]), 9);
        assert_eq!(&packet[16..36], &[1; 20]);
        assert_eq!(&packet[36..56], &[2; 20]);
        assert_eq!(BigEndian::read_u64(&packet[64..72]), 1000);
        assert_eq!(BigEndian::read_u32(&packet[80..84]), 2);
        assert_eq!(BigEndian::read_u32(&packet[88..92]), 11);
        assert_eq!(BigEndian::read_i32(&packet[92..96]), -1);
        assert_eq!(BigEndian::read_u16(&packet[96..98]), 6881);
    }

    #[test]
    fn rejects_bad_responses() {
        let mut error = BytesMut::new();
        error.put_u32(ACTION_ERROR);
        error.put_u32(5);
        error.put_slice(b"torrent not registered");
        let err = parse_announce_response(&error, 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tracker);
        assert!(err.to_string().contains("torrent not registered"));

        let mut connect = BytesMut::new();
        connect.put_u32(ACTION_CONNECT);
        connect.put_u32(5);
        connect.put_u64(42);
        assert_eq!(parse_connect_response(&connect, 5).unwrap(), 42);
        assert!(parse_connect_response(&connect, 6).is_err());
        assert!(parse_connect_response(&connect[..12], 5).is_err());
        assert!(parse_announce_response(&connect, 5).is_err());

        assert!(udp_host("http://t.example/announce").is_err());
        assert!(udp_host("udp:///announce").is_err());
        assert_eq!(udp_host("udp://t.example:80/announce").unwrap(), "t.example:80");
    }

    #[tokio::test]
    async fn announce_over_udp() {
        // two peers and a truncated third entry
        let peers = vec![127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2, 1, 2];
        let (url, server) = udp_tracker(900, peers, 1).await;

        let tracker = UdpTracker::new(url).with_timeout(Duration::from_secs(1));
        let announce = tracker
            .announce(&request().with_event(PeerEvent::Started))
            .await
            .unwrap();
        assert_eq!(announce.interval, Duration::from_secs(900));
        assert_eq!(
            announce.peers,
            vec![
                PeerAddress::new("127.0.0.1:6881".parse().unwrap()),
                PeerAddress::new("10.0.0.2:6882".parse().unwrap()),
            ]
        );
        assert_eq!(server.await.unwrap(), vec![(2, 1000)]);
    }

    #[tokio::test]
    async fn silent_tracker_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}", socket.local_addr().unwrap());
        let tracker = UdpTracker::new(url)
            .with_timeout(Duration::from_millis(20))
            .with_retries(1);
        let err = tracker.announce(&request()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        drop(socket);
    }
}
