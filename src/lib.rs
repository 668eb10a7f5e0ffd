use std::time::Duration;

use rand::Rng as _;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod cmd;
pub mod metadata;
pub mod peer;
mod util;

pub use metadata::bencode::{BencodeError, BencodeValue, decode, encode};
pub use metadata::file::{TorrentError, TorrentFile};
pub use metadata::tracker::{Tracker, TrackerError, TrackerResponse};
pub use peer::message::Message;
pub use peer::piece::{BLOCK_SIZE, Block, PieceAssembly, block_plan};
pub use peer::registry::{PieceClaim, PieceRegistry, RegistryError};
pub use peer::session::{PeerSession, PieceRequest, SessionState, fetch_piece};
pub use peer::{Bitfield, PeerError};

const PEER_ID_PREFIX: &[u8; 8] = b"-BP0001-";

/// Broad category of a failure, shared by every module's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bencode grammar.
    Syntax,
    /// A well-formed value in the wrong place, or a missing field.
    Type,
    /// Connection failure, timeout, unexpected close or short read.
    Network,
    /// The remote side broke the tracker or peer wire protocol.
    Protocol,
    /// A downloaded piece did not hash to its expected digest.
    Integrity,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error(transparent)]
    Torrent(#[from] TorrentError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker returned no peers")]
    NoPeers,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Bencode(e) => e.kind(),
            Error::Torrent(e) => e.kind(),
            Error::Tracker(e) => e.kind(),
            Error::Peer(e) => e.kind(),
            Error::Registry(e) => e.kind(),
            Error::Io(_) | Error::NoPeers => ErrorKind::Network,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Settings shared by the tracker client and peer sessions.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_id: [u8; 20],
    /// Advertised to the tracker; nothing listens on it.
    pub port: u16,
    /// Bound on connects, tracker requests and every peer read or write.
    pub timeout: Duration,
    pub block_size: u32,
    /// Cancelling this aborts every session started with the config.
    pub cancel: CancellationToken,
}

impl ClientConfig {
    pub fn generate_peer_id() -> [u8; 20] {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        rand::rng().fill(&mut id[8..]);
        id
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            peer_id: Self::generate_peer_id(),
            port: 6881,
            timeout: Duration::from_secs(5),
            block_size: BLOCK_SIZE,
            cancel: CancellationToken::new(),
        }
    }
}
