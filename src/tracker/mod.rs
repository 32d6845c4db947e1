//! Tracker announces over HTTP and UDP.

use std::convert::TryInto;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bendy::decoding::{Error as DecodingError, FromBencode, Object, ResultExt};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use crate::error::{Error, Result};
use crate::peer::PeerAddress;
use crate::util::{InfoHash, PeerId, ShaHash};

pub mod announcer;
pub mod udp;

pub use announcer::{AnnounceResult, Announcer};
pub use udp::UdpTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Started,
    Completed,
    Stopped,
}

impl PeerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerEvent::Started => "started",
            PeerEvent::Completed => "completed",
            PeerEvent::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerRequest {
    /// The 20 byte sha1 hash of the bencoded form of the info value from the
    /// metainfo file.
    pub info_hash: InfoHash,
    /// A string of length 20 which this downloader uses as its id.
    pub peer_id: PeerId,
    /// The port this peer is listening on.
    pub port: u16,
    /// The total amount uploaded so far.
    pub uploaded: u64,
    /// The total amount downloaded so far.
    pub downloaded: u64,
    /// The number of bytes this peer still has to download
    pub left: u64,
    /// An announcement using started is sent when a download first begins, and
    /// one using completed is sent when the download is complete. No completed
    /// is sent if the file was complete when started. Downloaders send an
    /// announcement using stopped when they cease downloading.
    pub event: Option<PeerEvent>,
    /// Number of peers wanted, the tracker's default if unset.
    pub numwant: Option<u32>,
}

impl TrackerRequest {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: None,
            numwant: None,
        }
    }

    pub fn with_event(mut self, event: PeerEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_progress(mut self, uploaded: u64, downloaded: u64, left: u64) -> Self {
        self.uploaded = uploaded;
        self.downloaded = downloaded;
        self.left = left;
        self
    }

    /// The announce url with all parameters appended. Compact peer lists are
    /// always requested.
    pub fn to_url(&self, announce: &str) -> String {
        let separator = if announce.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            announce,
            separator,
            percent_encode(self.info_hash.as_ref(), NON_ALPHANUMERIC),
            percent_encode(self.peer_id.as_ref(), NON_ALPHANUMERIC),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(event) = self.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        if let Some(numwant) = self.numwant {
            url.push_str(&format!("&numwant={}", numwant));
        }
        url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerResponse {
    Success {
        /// Number of seconds the downloader should wait between regular
        /// rerequests.
        interval: Duration,
        /// number of seeders
        complete: Option<u32>,
        /// number of leechers
        incomplete: Option<u32>,
        /// The known peers for torrent, from either peer encoding.
        peers: Vec<PeerAddress>,
    },
    Failure {
        /// Why the query failed.
        reason: String,
    },
}

/// A successful announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub interval: Duration,
    pub peers: Vec<PeerAddress>,
}

impl TrackerResponse {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self::from_bencode(data)?)
    }

    /// Turns a failure response into an error.
    pub fn into_announce(self) -> Result<Announce> {
        match self {
            TrackerResponse::Success {
                interval, peers, ..
            } => Ok(Announce { interval, peers }),
            TrackerResponse::Failure { reason } => Err(Error::TrackerFailure { reason }),
        }
    }
}

impl FromBencode for TrackerResponse {
    const EXPECTED_RECURSION_DEPTH: usize = 4;

    fn decode_bencode_object(object: Object) -> Result<Self, DecodingError>
    where
        Self: Sized,
    {
        let mut failure = None;
        let mut interval = None;
        let mut complete = None;
        let mut incomplete = None;
        let mut peers = Vec::new();

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"failure reason", value) => {
                    failure = String::decode_bencode_object(value)
                        .context("failure reason")
                        .map(Some)?
                }
                (b"interval", value) => {
                    interval = u64::decode_bencode_object(value)
                        .context("interval")
                        .map(Some)?
                }
                (b"complete", value) => {
                    complete = u32::decode_bencode_object(value)
                        .context("complete")
                        .map(Some)?
                }
                (b"incomplete", value) => {
                    incomplete = u32::decode_bencode_object(value)
                        .context("incomplete")
                        .map(Some)?
                }
                (b"peers", Object::Bytes(compact)) => peers.extend(compact_peers_v4(compact)?),
                (b"peers", Object::List(mut list)) => {
                    while let Some(peer) = list.next_object()? {
                        if let Some(peer) = dict_peer(peer)? {
                            peers.push(peer);
                        }
                    }
                }
                (b"peers", _) => return Err(DecodingError::unexpected_field("peers")),
                (b"peers6", value) => peers.extend(compact_peers_v6(value.try_into_bytes()?)?),
                (unknown_field, _) => {
                    trace!(
                        "skipping unknown field {:?}",
                        String::from_utf8_lossy(unknown_field)
                    );
                }
            }
        }

        if let Some(reason) = failure {
            return Ok(TrackerResponse::Failure { reason });
        }
        Ok(TrackerResponse::Success {
            interval: Duration::from_secs(
                interval.ok_or_else(|| DecodingError::missing_field("interval"))?,
            ),
            complete,
            incomplete,
            peers,
        })
    }
}

/// 6 bytes per peer: the IPv4 address and the port, both big endian.
fn compact_peers_v4(data: &[u8]) -> Result<Vec<PeerAddress>, DecodingError> {
    if data.len() % 6 != 0 {
        return Err(DecodingError::unexpected_field("malformed compact peers"));
    }
    Ok(data
        .chunks(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerAddress::new(SocketAddr::new(IpAddr::V4(ip), port))
        })
        .collect())
}

/// 18 bytes per peer: the IPv6 address and the port.
fn compact_peers_v6(data: &[u8]) -> Result<Vec<PeerAddress>, DecodingError> {
    if data.len() % 18 != 0 {
        return Err(DecodingError::unexpected_field("malformed compact peers6"));
    }
    Ok(data
        .chunks(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            PeerAddress::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        })
        .collect())
}

/// A `{ip, port, peer id}` dictionary. Entries with a host name instead of an
/// address are skipped.
fn dict_peer(object: Object) -> Result<Option<PeerAddress>, DecodingError> {
    let mut ip = None;
    let mut port = None;
    let mut peer_id = None;

    let mut dict = object.try_into_dictionary()?;
    while let Some(pair) = dict.next_pair()? {
        match pair {
            (b"ip", value) => {
                ip = String::decode_bencode_object(value)
                    .context("ip")
                    .map(Some)?
            }
            (b"port", value) => {
                port = u16::decode_bencode_object(value)
                    .context("port")
                    .map(Some)?
            }
            (b"peer id", value) => {
                let id: ShaHash = value
                    .try_into_bytes()?
                    .try_into()
                    .map_err(|_| DecodingError::unexpected_field("malformed peer id"))?;
                peer_id = Some(id);
            }
            _ => {}
        }
    }

    let ip = ip.ok_or_else(|| DecodingError::missing_field("ip"))?;
    let port = port.ok_or_else(|| DecodingError::missing_field("port"))?;
    let ip: IpAddr = match ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            debug!("skipping peer with unresolved host {}", ip);
            return Ok(None);
        }
    };
    let addr = SocketAddr::new(ip, port);
    Ok(Some(match peer_id {
        Some(id) => PeerAddress::with_peer_id(addr, id),
        None => PeerAddress::new(addr),
    }))
}

/// Announces to a single HTTP(S) tracker.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
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
        let response = self
            .client
            .get(request.to_url(&self.url))
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        let announce = TrackerResponse::from_bytes(&body)?.into_announce()?;
        debug!(
            "Tracker {} returned {} peers",
            self.url,
            announce.peers.len()
        );
        Ok(announce)
    }
}

/// A tracker of any supported kind, picked by the scheme of its url.
#[derive(Debug, Clone)]
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("udp://") {
            Ok(Tracker::Udp(UdpTracker::new(url)))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Tracker::Http(HttpTracker::new(url)))
        } else {
            Err(Error::TrackerFailure {
                reason: format!("unsupported tracker {}", url),
            })
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(tracker) => tracker.url(),
            Tracker::Udp(tracker) => tracker.url(),
        }
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<Announce> {
        match self {
            Tracker::Http(tracker) => tracker.announce(request).await,
            Tracker::Udp(tracker) => tracker.announce(request).await,
        }
    }
}
