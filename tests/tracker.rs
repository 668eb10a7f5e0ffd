mod common;

use std::net::SocketAddrV4;
use std::time::Duration;

use bitpiece::{ErrorKind, Tracker, TrackerError};

use common::{fake_tracker, silent_tracker, tracker_body};

const INFO_HASH: [u8; 20] = [0xAB; 20];
const PEER_ID: &[u8; 20] = b"-BP0001-012345678901";

#[tokio::test]
async fn discovers_compact_peers() {
    let peers: Vec<SocketAddrV4> = vec!["10.0.0.1:6881".parse().unwrap(), "10.0.0.2:51413".parse().unwrap()];
    let (url, handle) = fake_tracker("200 OK", tracker_body(&peers)).await;

    let tracker = Tracker::new(*PEER_ID, 6881, Duration::from_secs(2)).unwrap();
    let response = tracker.discover_peers(&INFO_HASH, &url, 32000).await.unwrap();
    assert_eq!(response.peers, peers);
    assert_eq!(response.interval, Some(1800));

    let head = handle.await.unwrap();
    let request_line = head.lines().next().unwrap();
    assert!(request_line.starts_with("GET /announce?"));
    assert!(request_line.contains(&format!("info_hash={}", "%AB".repeat(20))));
    assert!(request_line.contains("peer_id=%2DBP0001%2D012345678901"));
    assert!(request_line.contains("compact=1"));
    assert!(request_line.contains("left=32000"));
    assert!(request_line.contains("port=6881"));
}

#[tokio::test]
async fn failure_reason_is_protocol_error() {
    let (url, _handle) = fake_tracker("200 OK", b"d14:failure reason15:torrent unknowne".to_vec()).await;
    let tracker = Tracker::new(*PEER_ID, 6881, Duration::from_secs(2)).unwrap();
    let err = tracker.discover_peers(&INFO_HASH, &url, 0).await.unwrap_err();
    assert!(matches!(&err, TrackerError::TrackerFailure(reason) if reason == "torrent unknown"));
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn garbage_body_is_protocol_error() {
    let (url, _handle) = fake_tracker("200 OK", b"<html>nope</html>".to_vec()).await;
    let tracker = Tracker::new(*PEER_ID, 6881, Duration::from_secs(2)).unwrap();
    let err = tracker.discover_peers(&INFO_HASH, &url, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn error_status_is_network_error() {
    let (url, _handle) = fake_tracker("500 Internal Server Error", Vec::new()).await;
    let tracker = Tracker::new(*PEER_ID, 6881, Duration::from_secs(2)).unwrap();
    let err = tracker.discover_peers(&INFO_HASH, &url, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}

#[tokio::test]
async fn unresponsive_tracker_times_out() {
    let (url, _handle) = silent_tracker().await;
    let tracker = Tracker::new(*PEER_ID, 6881, Duration::from_millis(200)).unwrap();
    let err = tracker.discover_peers(&INFO_HASH, &url, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}

#[tokio::test]
async fn unparseable_announce_is_type_error() {
    let tracker = Tracker::new(*PEER_ID, 6881, Duration::from_secs(1)).unwrap();
    let err = tracker.discover_peers(&INFO_HASH, "not a url", 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
}
