#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::time::Duration;

use bitpiece::peer::handshake::{HANDSHAKE_LEN, TorrentHandshake};
use bitpiece::{BencodeValue, ClientConfig, Message};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const SEEDER_ID: &[u8; 20] = b"-SD0001-seederpeer01";

pub fn config() -> ClientConfig {
    ClientConfig { timeout: Duration::from_secs(2), ..ClientConfig::default() }
}

fn bytes(s: &str) -> BencodeValue {
    BencodeValue::ByteString(s.as_bytes().to_vec())
}

/// Deterministic content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Encodes a single-file descriptor for `content` split into `piece_len` pieces.
pub fn descriptor(announce: &str, content: &[u8], piece_len: usize) -> Vec<u8> {
    let pieces: Vec<u8> = content.chunks(piece_len).flat_map(|chunk| Sha1::digest(chunk).to_vec()).collect();
    let mut info = BTreeMap::new();
    info.insert(b"length".to_vec(), BencodeValue::Integer(content.len() as i64));
    info.insert(b"name".to_vec(), bytes("content.bin"));
    info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_len as i64));
    info.insert(b"pieces".to_vec(), BencodeValue::ByteString(pieces));
    let mut root = BTreeMap::new();
    root.insert(b"announce".to_vec(), bytes(announce));
    root.insert(b"info".to_vec(), BencodeValue::Dictionary(info));
    BencodeValue::Dictionary(root).encode()
}

pub fn compact_peers(peers: &[SocketAddrV4]) -> Vec<u8> {
    let mut out = Vec::new();
    for peer in peers {
        out.extend_from_slice(&peer.ip().octets());
        out.extend_from_slice(&peer.port().to_be_bytes());
    }
    out
}

pub fn tracker_body(peers: &[SocketAddrV4]) -> Vec<u8> {
    let mut root = BTreeMap::new();
    root.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
    root.insert(b"peers".to_vec(), BencodeValue::ByteString(compact_peers(peers)));
    BencodeValue::Dictionary(root).encode()
}

async fn local_listener() -> (TcpListener, SocketAddrV4) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {other}"),
    };
    (listener, addr)
}

/// Answers one HTTP request with `status` and `body`; the join handle yields
/// the request head that was received.
pub async fn fake_tracker(status: &'static str, body: Vec<u8>) -> (String, JoinHandle<String>) {
    let (listener, addr) = local_listener().await;
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_request_head(&mut stream).await;
        let mut response =
            format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(&body);
        stream.write_all(&response).await.unwrap();
        stream.shutdown().await.unwrap();
        head
    });
    (format!("http://{addr}/announce"), handle)
}

/// Accepts one connection and never answers it.
pub async fn silent_tracker() -> (String, JoinHandle<()>) {
    let (listener, addr) = local_listener().await;
    let handle = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    (format!("http://{addr}/announce"), handle)
}

async fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    /// Serves every block with its bytes inverted.
    Corrupt,
    /// Closes the connection on the first request.
    HangUp,
}

/// A seeder holding every piece of `content`, serving any number of
/// connections.
pub async fn fake_seeder(info_hash: [u8; 20], content: Vec<u8>, piece_len: usize, behavior: Behavior) -> SocketAddrV4 {
    let (listener, addr) = local_listener().await;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_peer(stream, info_hash, content.clone(), piece_len, behavior));
        }
    });
    addr
}

async fn serve_peer(mut stream: TcpStream, info_hash: [u8; 20], content: Vec<u8>, piece_len: usize, behavior: Behavior) {
    let timeout = Duration::from_secs(5);
    let mut theirs = [0u8; HANDSHAKE_LEN];
    if stream.read_exact(&mut theirs).await.is_err() {
        return;
    }
    let reply = <[u8; HANDSHAKE_LEN]>::from(&TorrentHandshake::new(info_hash, *SEEDER_ID));
    if stream.write_all(&reply).await.is_err() {
        return;
    }
    let num_pieces = content.len().div_ceil(piece_len);
    let mut raw = vec![0u8; num_pieces.div_ceil(8)];
    for index in 0..num_pieces {
        raw[index / 8] |= 1 << (7 - index % 8);
    }
    if (Message::Bitfield { bitmap: raw }).send(&mut stream, timeout).await.is_err() {
        return;
    }

    while let Ok(msg) = Message::read_message(&mut stream, timeout).await {
        let reply = match msg {
            Message::Interested => Message::Unchoke,
            Message::Request { index, begin, length } => {
                if behavior == Behavior::HangUp {
                    return;
                }
                let start = index as usize * piece_len + begin as usize;
                let mut bytes = content[start..start + length as usize].to_vec();
                if behavior == Behavior::Corrupt {
                    bytes.iter_mut().for_each(|b| *b = !*b);
                }
                Message::Piece { index, begin, bytes }
            }
            _ => continue,
        };
        if reply.send(&mut stream, timeout).await.is_err() {
            return;
        }
    }
}
