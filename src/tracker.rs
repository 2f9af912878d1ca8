use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::bencode::{self, BencodeValue};
use crate::config::DEFAULT_PORT;

const COMPACT_PEER_LEN: usize = 6;
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// in seconds
    pub interval: u64,
    pub peers: Vec<Peer>,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("invalid tracker URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported tracker scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("tracker returned a failure reason: {0}")]
    Failure(String),
    #[error("could not decode bencoded response: {0}")]
    Bencode(#[from] bencode::BencodeError),
    #[error("tracker response is missing {0:?}")]
    MissingField(&'static str),
    #[error("peer list length {0} is not a multiple of 6")]
    InvalidPeerData(usize),
    #[error("no tracker returned any peers")]
    NoPeers,
}

/// Builds the announce URL. `info_hash` and `peer_id` are raw bytes and are
/// percent-encoded byte by byte.
pub fn announce_url(
    tracker_url: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    left: u64,
) -> Result<String, TrackerError> {
    let url = Url::parse(tracker_url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TrackerError::UnsupportedScheme(url.scheme().to_string()));
    }

    let separator = if url.query().is_some() { '&' } else { '?' };
    Ok(format!(
        "{url}{separator}info_hash={}&peer_id={}&port={DEFAULT_PORT}&uploaded=0&downloaded=0&left={left}&compact=1",
        urlencoding::encode_binary(info_hash),
        urlencoding::encode_binary(peer_id),
    ))
}

pub async fn announce(
    tracker_url: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    left: u64,
) -> Result<TrackerResponse, TrackerError> {
    let request_url = announce_url(tracker_url, info_hash, peer_id, left)?;
    debug!(url = %request_url, "announcing to tracker");

    let client = reqwest::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .build()?;
    let body = client
        .get(request_url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    parse_response(&body)
}

/// Tries each tracker in turn and returns the first non-empty peer list.
pub async fn find_peers(
    trackers: &[String],
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    left: u64,
) -> Result<TrackerResponse, TrackerError> {
    for tracker in trackers {
        match announce(tracker, info_hash, peer_id, left).await {
            Ok(response) if !response.peers.is_empty() => return Ok(response),
            Ok(_) => warn!(tracker = %tracker, "tracker returned no peers"),
            Err(err) => warn!(tracker = %tracker, %err, "announce failed"),
        }
    }
    Err(TrackerError::NoPeers)
}

pub fn parse_response(body: &[u8]) -> Result<TrackerResponse, TrackerError> {
    let (response, _) = bencode::decode(body)?;

    if let Some(reason) = response.get(b"failure reason").and_then(BencodeValue::as_bytes) {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let interval = response
        .get(b"interval")
        .and_then(|v| v.as_integer())
        .and_then(|i| i.as_u64())
        .ok_or(TrackerError::MissingField("interval"))?;
    let peers = response
        .get(b"peers")
        .and_then(BencodeValue::as_bytes)
        .ok_or(TrackerError::MissingField("peers"))?;

    Ok(TrackerResponse {
        interval,
        peers: parse_peers(peers)?,
    })
}

/// Decodes the compact peer list: 4 bytes of IPv4 address then a
/// big-endian port, per peer.
pub fn parse_peers(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(TrackerError::InvalidPeerData(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| Peer {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: BigEndian::read_u16(&chunk[4..6]),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        let bytes = [165, 232, 33, 77, 0xC8, 0xD5, 127, 0, 0, 1, 0x1A, 0xE1];
        let peers = parse_peers(&bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "165.232.33.77:51413");
        assert_eq!(
            peers[1].socket_addr(),
            "127.0.0.1:6881".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_peers_rejects_partial_entry() {
        assert!(matches!(
            parse_peers(&[1, 2, 3, 4, 5]),
            Err(TrackerError::InvalidPeerData(5))
        ));
    }

    #[test]
    fn test_parse_response() {
        let mut body = b"d8:intervali60e5:peers6:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE1]);
        body.push(b'e');
        let response = parse_response(&body).unwrap();
        assert_eq!(response.interval, 60);
        assert_eq!(response.peers[0].to_string(), "10.0.0.2:6881");
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = b"d14:failure reason12:unregisterede";
        match parse_response(body) {
            Err(TrackerError::Failure(reason)) => assert_eq!(reason, "unregistered"),
            other => panic!("expected a failure reason, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_missing_peers() {
        assert!(matches!(
            parse_response(b"d8:intervali60ee"),
            Err(TrackerError::MissingField("peers"))
        ));
    }

    #[test]
    fn test_announce_url_encodes_raw_bytes() {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xD6;
        info_hash[1] = b'a';
        let url = announce_url("http://tracker.test/announce", &info_hash, b"00112233445566778899", 2994120)
            .unwrap();
        assert!(url.starts_with("http://tracker.test/announce?info_hash=%D6a%00"));
        assert!(url.contains("&peer_id=00112233445566778899&port=6881"));
        assert!(url.ends_with("&left=2994120&compact=1"));
    }

    #[test]
    fn test_announce_url_rejects_udp() {
        assert!(matches!(
            announce_url("udp://tracker.test:6969", &[0; 20], &[0; 20], 0),
            Err(TrackerError::UnsupportedScheme(s)) if s == "udp"
        ));
    }
}
