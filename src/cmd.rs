use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Subcommand;
use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::metadata::bencode::BencodeValue;
use crate::metadata::file::TorrentFile;
use crate::metadata::tracker::Tracker;
use crate::peer::registry::PieceRegistry;
use crate::peer::session::{PeerSession, PieceRequest, fetch_piece};
use crate::{ClientConfig, Error, util};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode { value: String },
    /// Print a summary of a torrent file
    Info { path: PathBuf },
    /// Ask the tracker for peers
    Peers { path: PathBuf },
    /// Handshake with a peer and print its id
    Handshake { path: PathBuf, addr: SocketAddrV4 },
    /// Download and verify a single piece
    #[command(name = "download_piece")]
    DownloadPiece {
        #[arg(short)]
        output: PathBuf,
        path: PathBuf,
        piece: usize,
    },
}

impl Command {
    /// Runs the command, returning what it prints on success.
    pub async fn execute(&self, config: &ClientConfig) -> crate::Result<String> {
        match self {
            Command::Decode { value } => {
                let value = BencodeValue::try_from(value.as_bytes())?;
                Ok(value.to_json().to_string())
            }
            Command::Info { path } => {
                let torrent = TorrentFile::read(path)?;
                Ok(torrent.to_string().trim_end().to_string())
            }
            Command::Peers { path } => {
                let torrent = TorrentFile::read(path)?;
                let peers = discover(&torrent, config).await?;
                Ok(peers.iter().map(SocketAddrV4::to_string).collect::<Vec<_>>().join("\n"))
            }
            Command::Handshake { path, addr } => {
                let torrent = TorrentFile::read(path)?;
                let mut session = PeerSession::connect(*addr, torrent.info_hash, config).await?;
                let peer_id = session.remote_peer_id().map(|id| util::to_string(id)).unwrap_or_default();
                if let Err(e) = session.close().await {
                    warn!(error = %e, "closing session");
                }
                Ok(format!("Peer ID: {peer_id}"))
            }
            Command::DownloadPiece { output, path, piece } => download_piece(output, path, *piece, config).await,
        }
    }
}

async fn discover(torrent: &TorrentFile, config: &ClientConfig) -> crate::Result<Vec<SocketAddrV4>> {
    let tracker = Tracker::new(config.peer_id, config.port, config.timeout)?;
    let response = tracker.discover_peers(&torrent.info_hash, &torrent.announce, torrent.total_num_bytes).await?;
    Ok(response.peers)
}

/// Tries each peer the tracker offers, in order, until one of them delivers
/// a verified copy of the piece.
async fn download_piece(output: &Path, path: &Path, piece: usize, config: &ClientConfig) -> crate::Result<String> {
    let torrent = TorrentFile::read(path)?;
    let request = PieceRequest::from_torrent(&torrent, piece)?;
    let peers = discover(&torrent, config).await?;
    let registry = PieceRegistry::new();

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut last_error = Error::NoPeers;
    for addr in peers {
        spinner.set_message(format!("piece {piece} from {addr}"));
        match fetch_piece(addr, torrent.info_hash, &request, &registry, config).await {
            Ok(data) => {
                spinner.finish_and_clear();
                tokio::fs::write(output, &data).await?;
                info!(piece, %addr, "piece written to {}", output.display());
                return Ok(format!("Piece {piece} downloaded to {}.", output.display()));
            }
            Err(e) => {
                warn!(piece, %addr, error = %e, "peer failed, trying next");
                last_error = e;
            }
        }
        if config.cancel.is_cancelled() {
            break;
        }
    }
    spinner.finish_and_clear();
    Err(last_error)
}
