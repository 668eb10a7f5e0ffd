use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::metadata::file::{TorrentError, TorrentFile};
use crate::peer::handshake::handshake;
use crate::peer::message::Message;
use crate::peer::piece::PieceAssembly;
use crate::peer::registry::PieceRegistry;
use crate::peer::{Bitfield, PeerError, until_cancelled, with_timeout};
use crate::{ClientConfig, util};

/// Where a session stands. `Verified` and `Failed` end a piece download;
/// a verified session may still be driven for another piece, a failed one
/// may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    AwaitingUnchoke,
    Requesting,
    AwaitingBlocks,
    Verified,
    Failed,
}

/// The piece a session should fetch: its index, exact length and digest,
/// plus the torrent's piece count to bound what the peer may announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceRequest {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
    pub num_pieces: u32,
}

impl PieceRequest {
    pub fn from_torrent(torrent: &TorrentFile, index: usize) -> crate::Result<Self> {
        let length = torrent.piece_len(index)?;
        let hash = torrent.piece_hash(index)?;
        let length = u32::try_from(length).map_err(|_| PeerError::InvalidPieceLength(length))?;
        let out_of_range = || TorrentError::PieceOutOfRange { index, num_pieces: torrent.num_pieces() };
        let num_pieces = u32::try_from(torrent.num_pieces()).map_err(|_| out_of_range())?;
        let index = u32::try_from(index).map_err(|_| out_of_range())?;
        Ok(PieceRequest { index, length, hash, num_pieces })
    }
}

enum BlockOutcome {
    Complete,
    Choked,
}

/// One connection to one peer, downloading pieces sequentially.
#[derive(Debug)]
pub struct PeerSession<S = TcpStream> {
    stream: S,
    state: SessionState,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    remote_peer_id: Option<[u8; 20]>,
    available: Option<Bitfield>,
    choked: bool,
    outstanding: usize,
    timeout: Duration,
    block_size: u32,
    cancel: CancellationToken,
}

impl PeerSession<TcpStream> {
    /// Connects to `addr` and performs the handshake.
    #[instrument(level = "debug", skip(info_hash, config))]
    pub async fn connect(addr: SocketAddrV4, info_hash: [u8; 20], config: &ClientConfig) -> Result<Self, PeerError> {
        trace!(state = ?SessionState::Connecting);
        let connect = with_timeout(config.timeout, async {
            TcpStream::connect(SocketAddr::V4(addr))
                .await
                .map_err(|source| PeerError::Connect { addr, source })
        });
        let stream = until_cancelled(&config.cancel, connect).await?;
        let mut session = PeerSession::new(stream, info_hash, config);
        session.handshake().await?;
        Ok(session)
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already connected stream; the session starts in `Handshaking`.
    pub fn new(stream: S, info_hash: [u8; 20], config: &ClientConfig) -> Self {
        PeerSession {
            stream,
            state: SessionState::Handshaking,
            info_hash,
            peer_id: config.peer_id,
            remote_peer_id: None,
            available: None,
            choked: true,
            outstanding: 0,
            timeout: config.timeout,
            block_size: config.block_size,
            cancel: config.cancel.child_token(),
        }
    }

    /// Token that aborts this session alone. Cancelling it fails any pending
    /// read or write with `PeerError::Cancelled` and closes the connection.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_peer_id.as_ref()
    }

    /// Pieces the peer advertised through `bitfield` and `have`, if any.
    pub fn available(&self) -> Option<&Bitfield> {
        self.available.as_ref()
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn outstanding_requests(&self) -> usize {
        self.outstanding
    }

    fn transition(&mut self, next: SessionState) {
        trace!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    fn fail(&mut self, e: PeerError) -> PeerError {
        warn!(error = %e, state = ?self.state, "session failed");
        self.transition(SessionState::Failed);
        e
    }

    /// Exchanges handshakes, declares interest and returns the remote peer id.
    pub async fn handshake(&mut self) -> Result<[u8; 20], PeerError> {
        if self.state != SessionState::Handshaking {
            return Err(PeerError::InvalidState(self.state, "handshake"));
        }
        let (stream, timeout) = (&mut self.stream, self.timeout);
        let (info_hash, peer_id) = (self.info_hash, self.peer_id);
        let exchange = async move {
            let theirs = handshake(&mut *stream, info_hash, peer_id, timeout).await?;
            Message::Interested.send(stream, timeout).await?;
            Ok::<_, PeerError>(theirs)
        };
        let result = until_cancelled(&self.cancel, exchange).await;
        match result {
            Ok(theirs) => {
                debug!(peer_id = %util::to_string(&theirs.peer_id), "handshake complete");
                self.remote_peer_id = Some(theirs.peer_id);
                self.transition(SessionState::AwaitingUnchoke);
                Ok(theirs.peer_id)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Downloads and verifies one piece. Any error leaves the session
    /// `Failed`; the caller decides whether to try another peer.
    #[instrument(level = "debug", skip(self, request), fields(index = request.index, length = request.length))]
    pub async fn download_piece(&mut self, request: &PieceRequest) -> Result<Vec<u8>, PeerError> {
        match self.state {
            SessionState::AwaitingUnchoke | SessionState::Verified => (),
            other => return Err(PeerError::InvalidState(other, "download a piece")),
        }
        match self.drive(request).await {
            Ok(data) => {
                self.transition(SessionState::Verified);
                info!("piece verified");
                Ok(data)
            }
            Err(PeerError::Cancelled) => {
                if let Err(e) = self.close().await {
                    debug!(error = %e, "closing cancelled session");
                }
                Err(self.fail(PeerError::Cancelled))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn drive(&mut self, request: &PieceRequest) -> Result<Vec<u8>, PeerError> {
        let mut assembly = PieceAssembly::new(request.index, request.length, request.hash, self.block_size)?;
        loop {
            if self.choked {
                self.await_unchoke(request.num_pieces).await?;
            }
            if let Some(available) = &self.available {
                if !available.has(request.index as usize) {
                    return Err(PeerError::PieceNotAvailable(request.index));
                }
            }
            self.request_missing(&assembly).await?;
            match self.await_blocks(&mut assembly, request.num_pieces).await? {
                BlockOutcome::Complete => break,
                BlockOutcome::Choked => continue,
            }
        }
        assembly.verify()
    }

    async fn send(&mut self, msg: &Message) -> Result<(), PeerError> {
        until_cancelled(&self.cancel, msg.send(&mut self.stream, self.timeout)).await
    }

    async fn recv(&mut self) -> Result<Message, PeerError> {
        until_cancelled(&self.cancel, Message::read_message(&mut self.stream, self.timeout)).await
    }

    /// Bookkeeping shared by every state that reads frames. Availability is
    /// sized to the torrent, so announced indexes past the end are rejected.
    fn record(&mut self, msg: &Message, num_pieces: u32) -> Result<(), PeerError> {
        match msg {
            Message::Bitfield { bitmap } => {
                let advertised = Bitfield::from(bitmap.clone());
                let mut available = Bitfield::new(num_pieces as usize, false);
                for index in (0..num_pieces as usize).filter(|&index| advertised.has(index)) {
                    available.set(index);
                }
                self.available = Some(available);
            }
            Message::Have { index } => {
                if *index >= num_pieces {
                    return Err(PeerError::InvalidPieceIndex { index: *index, num_pieces });
                }
                self.available
                    .get_or_insert_with(|| Bitfield::new(num_pieces as usize, false))
                    .set(*index as usize);
            }
            Message::Choke => self.choked = true,
            Message::Unchoke => self.choked = false,
            _ => (),
        }
        Ok(())
    }

    async fn await_unchoke(&mut self, num_pieces: u32) -> Result<(), PeerError> {
        self.transition(SessionState::AwaitingUnchoke);
        self.outstanding = 0;
        while self.choked {
            let msg = self.recv().await?;
            trace!(?msg, "awaiting unchoke");
            self.record(&msg, num_pieces)?;
        }
        debug!("unchoked");
        Ok(())
    }

    async fn request_missing(&mut self, assembly: &PieceAssembly) -> Result<(), PeerError> {
        self.transition(SessionState::Requesting);
        let index = assembly.index();
        let missing: Vec<_> = assembly.missing_blocks().collect();
        for block in &missing {
            self.send(&Message::Request { index, begin: block.begin, length: block.length }).await?;
        }
        self.outstanding = missing.len();
        debug!(requests = self.outstanding, "blocks requested");
        Ok(())
    }

    async fn await_blocks(&mut self, assembly: &mut PieceAssembly, num_pieces: u32) -> Result<BlockOutcome, PeerError> {
        self.transition(SessionState::AwaitingBlocks);
        loop {
            match self.recv().await? {
                Message::Piece { index, begin, bytes } if index == assembly.index() => {
                    if assembly.add_block(begin, &bytes)? {
                        self.outstanding = self.outstanding.saturating_sub(1);
                        trace!(begin, length = bytes.len(), outstanding = self.outstanding, "block received");
                    }
                    if assembly.is_complete() {
                        return Ok(BlockOutcome::Complete);
                    }
                }
                Message::Piece { index, begin, .. } => {
                    debug!(index, begin, "discarding block for another piece");
                }
                Message::Choke => {
                    debug!("choked while awaiting blocks");
                    self.choked = true;
                    return Ok(BlockOutcome::Choked);
                }
                msg => self.record(&msg, num_pieces)?,
            }
        }
    }

    /// Shuts down our side of the connection.
    pub async fn close(&mut self) -> Result<(), PeerError> {
        with_timeout(self.timeout, async { Ok(self.stream.shutdown().await?) }).await
    }
}

/// Claims `request.index` in `registry`, then connects to `addr` and fetches
/// the piece. The claim is released if anything fails.
pub async fn fetch_piece(
    addr: SocketAddrV4,
    info_hash: [u8; 20],
    request: &PieceRequest,
    registry: &Arc<PieceRegistry>,
    config: &ClientConfig,
) -> crate::Result<Vec<u8>> {
    let claim = registry.claim(request.index)?;
    let mut session = PeerSession::connect(addr, info_hash, config).await?;
    let data = session.download_piece(request).await?;
    claim.complete();
    if let Err(e) = session.close().await {
        debug!(error = %e, "closing session");
    }
    Ok(data)
}
