use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::{PeerError, with_timeout};

const P_STR: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentHandshake {
    pub flags: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl TorrentHandshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        TorrentHandshake { flags: [0; 8], info_hash, peer_id }
    }
}

impl TryFrom<&[u8; HANDSHAKE_LEN]> for TorrentHandshake {
    type Error = PeerError;

    fn try_from(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, PeerError> {
        if bytes[0] as usize != P_STR.len() || bytes[1..20] != P_STR[..] {
            return Err(PeerError::InvalidProtocolId);
        }
        let mut handshake = TorrentHandshake::new([0; 20], [0; 20]);
        handshake.flags.copy_from_slice(&bytes[20..28]);
        handshake.info_hash.copy_from_slice(&bytes[28..48]);
        handshake.peer_id.copy_from_slice(&bytes[48..68]);
        Ok(handshake)
    }
}

impl From<&TorrentHandshake> for [u8; HANDSHAKE_LEN] {
    fn from(handshake: &TorrentHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = P_STR.len() as u8;
        bytes[1..20].copy_from_slice(P_STR);
        bytes[20..28].copy_from_slice(&handshake.flags);
        bytes[28..48].copy_from_slice(&handshake.info_hash);
        bytes[48..68].copy_from_slice(&handshake.peer_id);
        bytes
    }
}

/// Sends our handshake, reads the peer's and checks it names the same
/// torrent. Returns the peer's handshake.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    timeout: Duration,
) -> Result<TorrentHandshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mine = TorrentHandshake::new(info_hash, peer_id);
    let my_bytes = <[u8; HANDSHAKE_LEN]>::from(&mine);
    with_timeout(timeout, async { Ok(stream.write_all(&my_bytes).await?) }).await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    with_timeout(timeout, async { Ok(stream.read_exact(&mut buf).await?) }).await?;
    let theirs = TorrentHandshake::try_from(&buf)?;
    if theirs.info_hash != mine.info_hash {
        return Err(PeerError::MismatchedHash { expected: mine.info_hash, received: theirs.info_hash });
    }
    Ok(theirs)
}
