pub mod handshake;
pub mod message;
pub mod piece;
pub mod registry;
pub mod session;

use std::future::Future;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ErrorKind;
use crate::peer::session::SessionState;
use crate::util;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("could not connect to {addr}: {source}")]
    Connect { addr: SocketAddrV4, source: io::Error },
    #[error("no progress within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("session cancelled")]
    Cancelled,
    #[error("i/o error: {0}")]
    Io(io::Error),
    #[error("handshake has an unexpected protocol string")]
    InvalidProtocolId,
    #[error("info hash mismatch: expected {}, peer sent {}", util::to_string(.expected), util::to_string(.received))]
    MismatchedHash { expected: [u8; 20], received: [u8; 20] },
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u32),
    #[error("message {id} has {received} payload bytes, expected {expected}")]
    UnexpectedNumBytes { id: u8, expected: usize, received: usize },
    #[error("peer does not have piece {0}")]
    PieceNotAvailable(u32),
    #[error("peer announced piece {index}, torrent has {num_pieces}")]
    InvalidPieceIndex { index: u32, num_pieces: u32 },
    #[error("unrequested block at offset {begin} ({length} bytes)")]
    UnexpectedBlock { begin: u32, length: usize },
    #[error("piece {0} is not fully assembled")]
    IncompletePiece(u32),
    #[error("piece length {0} cannot be requested")]
    InvalidPieceLength(u64),
    #[error("session is {0:?}, cannot {1}")]
    InvalidState(SessionState, &'static str),
    #[error("piece {index} failed hash verification")]
    PieceHashMismatch { index: u32 },
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Connect { .. }
            | PeerError::Timeout(_)
            | PeerError::ConnectionClosed
            | PeerError::Cancelled
            | PeerError::Io(_) => ErrorKind::Network,
            PeerError::InvalidPieceLength(_) => ErrorKind::Type,
            PeerError::PieceHashMismatch { .. } => ErrorKind::Integrity,
            _ => ErrorKind::Protocol,
        }
    }
}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => PeerError::ConnectionClosed,
            _ => PeerError::Io(e),
        }
    }
}

/// Bounds a peer operation; an elapsed deadline becomes `PeerError::Timeout`.
pub(crate) async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, PeerError>
where
    F: Future<Output = Result<T, PeerError>>,
{
    tokio::time::timeout(duration, fut).await.map_err(|_| PeerError::Timeout(duration))?
}

/// Races a peer operation against `cancel`; cancellation wins ties and
/// becomes `PeerError::Cancelled`.
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, PeerError>
where
    F: Future<Output = Result<T, PeerError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PeerError::Cancelled),
        result = fut => result,
    }
}

/// Big-endian bit set, as carried by the `bitfield` message: bit 0 is the
/// high bit of the first byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    masks: Vec<u8>,
    num: usize,
}

impl From<Vec<u8>> for Bitfield {
    fn from(v: Vec<u8>) -> Self {
        let num = v.len() * 8;
        Bitfield { masks: v, num }
    }
}

impl Bitfield {
    pub fn new(num: usize, set: bool) -> Self {
        let mut bf = Bitfield { masks: vec![0; num.div_ceil(8)], num };
        if set {
            for index in 0..num {
                bf.set(index);
            }
        }
        bf
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    fn locate(index: usize) -> (usize, u8) {
        (index / 8, 1 << (7 - index % 8))
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num {
            return false;
        }
        let (element, mask) = Self::locate(index);
        self.masks[element] & mask == mask
    }

    /// Sets bit `index`. The field never grows; returns `false` if `index`
    /// is out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.num {
            return false;
        }
        let (element, mask) = Self::locate(index);
        self.masks[element] |= mask;
        true
    }

    pub fn count_ones(&self) -> usize {
        self.masks.iter().map(|mask| mask.count_ones() as usize).sum()
    }

    pub fn all(&self) -> bool {
        self.count_ones() == self.num
    }
}
