use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::ErrorKind;
use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::metadata::file::TorrentFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: Option<u64>,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url {0}")]
    InvalidAnnounceUrl(String),
    #[error("could not build tracker client: {0}")]
    ClientBuild(reqwest::Error),
    #[error("no response received from tracker: {0}")]
    NoTrackerResponse(reqwest::Error),
    #[error("tracker returned an error status: {0}")]
    ErrorStatus(reqwest::Error),
    #[error("tracker response contains no body: {0}")]
    NoTrackerResponseBody(reqwest::Error),
    #[error("tracker response is invalid bencode data: {0}")]
    NonBencodedTrackerResponse(BencodeError),
    #[error("tracker response is not a bencoded dictionary")]
    TrackerResponseNotADictionary,
    #[error("tracker reported failure: {0}")]
    TrackerFailure(String),
    #[error("tracker response missing peers key")]
    MissingPeers,
    #[error("tracker response peers list is not a byte string")]
    MalformedPeersList,
    #[error("peers list byte length ({0}) is not a multiple of 6")]
    IllegalPeersLength(usize),
    #[error("tracker response interval malformed")]
    MalformedInterval,
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::InvalidAnnounceUrl(_) => ErrorKind::Type,
            TrackerError::ClientBuild(_)
            | TrackerError::NoTrackerResponse(_)
            | TrackerError::ErrorStatus(_)
            | TrackerError::NoTrackerResponseBody(_) => ErrorKind::Network,
            _ => ErrorKind::Protocol,
        }
    }
}

type Result<T> = std::result::Result<T, TrackerError>;

const INTERVAL: &[u8] = b"interval";
const PEERS: &[u8] = b"peers";
const FAILURE_REASON: &[u8] = b"failure reason";

/// Splits a compact peer list into addresses, six bytes per peer.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::IllegalPeersLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

impl TryFrom<&BencodeValue> for TrackerResponse {
    type Error = TrackerError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dict().ok_or(TrackerError::TrackerResponseNotADictionary)?;
        if let Some(reason) = items.get(FAILURE_REASON) {
            return Err(TrackerError::TrackerFailure(reason.to_string()));
        }
        let interval = TorrentFile::extract_uint(items.get(INTERVAL), "interval")
            .map_err(|_| TrackerError::MalformedInterval)?;
        let peers = match items.get(PEERS) {
            Some(BencodeValue::ByteString(bytes)) => parse_compact_peers(bytes)?,
            Some(_) => return Err(TrackerError::MalformedPeersList),
            None => return Err(TrackerError::MissingPeers),
        };
        Ok(TrackerResponse { interval, peers })
    }
}

impl TryFrom<&[u8]> for TrackerResponse {
    type Error = TrackerError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let value = BencodeValue::try_from(bytes).map_err(TrackerError::NonBencodedTrackerResponse)?;
        TrackerResponse::try_from(&value)
    }
}

impl fmt::Display for TrackerResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for socket in &self.peers {
            writeln!(f, "{socket}")?;
        }
        Ok(())
    }
}

/// Builds the announce GET url. The raw 20-byte values are percent-encoded by
/// hand since `Url` would re-encode them as UTF-8.
pub fn announce_url(announce: &str, info_hash: &[u8; 20], peer_id: &[u8; 20], port: u16, left: u64) -> Result<Url> {
    let mut url = Url::parse(announce).map_err(|_| TrackerError::InvalidAnnounceUrl(announce.to_string()))?;

    url.query_pairs_mut()
        .append_pair("port", &port.to_string())
        .append_pair("uploaded", "0")
        .append_pair("downloaded", "0")
        .append_pair("left", &left.to_string())
        .append_pair("compact", "1");

    let encoded_hash = percent_encode(info_hash, NON_ALPHANUMERIC).to_string();
    let encoded_id = percent_encode(peer_id, NON_ALPHANUMERIC).to_string();
    let new_url_str = format!("{}&info_hash={}&peer_id={}", url, encoded_hash, encoded_id);
    Url::parse(&new_url_str).map_err(|_| TrackerError::InvalidAnnounceUrl(new_url_str))
}

/// HTTP tracker client.
#[derive(Debug, Clone)]
pub struct Tracker {
    client: Client,
    peer_id: [u8; 20],
    port: u16,
}

impl Tracker {
    pub fn new(peer_id: [u8; 20], port: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(TrackerError::ClientBuild)?;
        Ok(Tracker { client, peer_id, port })
    }

    #[instrument(level = "debug", skip(self, info_hash), fields(info_hash = %hex::encode(info_hash)))]
    pub async fn discover_peers(&self, info_hash: &[u8; 20], announce: &str, left: u64) -> Result<TrackerResponse> {
        let url = announce_url(announce, info_hash, &self.peer_id, self.port, left)?;
        debug!(%url, "announcing");

        let response = self.client.get(url).send().await.map_err(TrackerError::NoTrackerResponse)?;
        let response = response.error_for_status().map_err(TrackerError::ErrorStatus)?;
        let body = response.bytes().await.map_err(TrackerError::NoTrackerResponseBody)?;

        let tracker_response = TrackerResponse::try_from(body.as_ref())?;
        debug!(peers = tracker_response.peers.len(), "tracker responded");
        Ok(tracker_response)
    }
}
