use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use thiserror::Error;
use url::Url;

use crate::ErrorKind;
use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::metadata::tracker::{self, TrackerError};
use crate::util::{self, sha1_hash};

/// A parsed single-file metainfo descriptor.
///
/// `info_hash` is the SHA-1 of the canonical re-encoding of the `info`
/// dictionary and identifies the swarm both to the tracker and to peers.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<u64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,

    pub name: Option<String>,
    pub total_num_bytes: u64,
    pub num_bytes_per_piece: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub info_hash: [u8; 20],
    pub md5sum: Option<[u8; 16]>,
    pub private: bool,
}

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("descriptor is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("descriptor is not a dictionary")]
    FileIsNotDictionary,
    #[error("missing required key `{0}`")]
    MissingRequiredKey(&'static str),
    #[error("`{0}` is not a string")]
    KeyDoesNotMapToString(&'static str),
    #[error("`{0}` is not an integer")]
    KeyDoesNotMapToInteger(&'static str),
    #[error("`{0}` is not a dictionary")]
    KeyDoesNotMapToDictionary(&'static str),
    #[error("`{0}` is not a list")]
    KeyDoesNotMapToList(&'static str),
    #[error("`{0}` is negative ({1})")]
    NegativeInteger(&'static str, i64),
    #[error("`piece length` must be positive")]
    ZeroPieceLength,
    #[error("md5sum must be 16 bytes, found {0}")]
    InvalidMd5Length(usize),
    #[error("`private` must be 0 or 1, found {0}")]
    InvalidPrivateValue(u64),
    #[error("`pieces` length {0} is not a multiple of 20")]
    InvalidPiecesLength(usize),
    #[error("announce-list entries must be strings or lists of strings")]
    InvalidAnnounceListElement,
    #[error("expected {expected} piece hashes for the stated length, found {found}")]
    PieceCountMismatch { expected: usize, found: usize },
    #[error("piece {index} out of range ({num_pieces} pieces)")]
    PieceOutOfRange { index: usize, num_pieces: usize },
}

impl TorrentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::Bencode(e) => e.kind(),
            _ => ErrorKind::Type,
        }
    }
}

type Result<T> = std::result::Result<T, TorrentError>;

impl fmt::Display for TorrentFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Tracker URL: {}", self.announce)?;
        writeln!(f, "Length: {}", self.total_num_bytes)?;
        writeln!(f, "Info Hash: {}", util::to_string(&self.info_hash))?;
        writeln!(f, "Piece Length: {}", self.num_bytes_per_piece)?;
        writeln!(f, "Piece Hashes:")?;
        for hash in &self.piece_hashes {
            writeln!(f, "{}", util::to_string(hash))?;
        }
        Ok(())
    }
}

const ANNOUNCE: &[u8] = b"announce";
const ANNOUNCE_LIST: &[u8] = b"announce-list";
const CREATION_DATE: &[u8] = b"creation date";
const COMMENT: &[u8] = b"comment";
const CREATED_BY: &[u8] = b"created by";
const ENCODING: &[u8] = b"encoding";
const INFO: &[u8] = b"info";
const PIECE_LENGTH: &[u8] = b"piece length";
const PIECES: &[u8] = b"pieces";
const PRIVATE: &[u8] = b"private";
const NAME: &[u8] = b"name";
const LENGTH: &[u8] = b"length";
const MD5SUM: &[u8] = b"md5sum";

type Dictionary = BTreeMap<Vec<u8>, BencodeValue>;

impl TryFrom<&BencodeValue> for TorrentFile {
    type Error = TorrentError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dict().ok_or(TorrentError::FileIsNotDictionary)?;
        let announce = Self::extract_string(items.get(ANNOUNCE), "announce")?
            .ok_or(TorrentError::MissingRequiredKey("announce"))?;
        let info = items.get(INFO).ok_or(TorrentError::MissingRequiredKey("info"))?;
        let info_items = info.as_dict().ok_or(TorrentError::KeyDoesNotMapToDictionary("info"))?;

        let total_num_bytes = Self::require_uint(info_items, LENGTH, "length")?;
        let num_bytes_per_piece = Self::require_uint(info_items, PIECE_LENGTH, "piece length")?;
        if num_bytes_per_piece == 0 {
            return Err(TorrentError::ZeroPieceLength);
        }
        let piece_hashes = Self::extract_pieces(info_items.get(PIECES))?;
        let expected = total_num_bytes.div_ceil(num_bytes_per_piece) as usize;
        if piece_hashes.len() != expected {
            return Err(TorrentError::PieceCountMismatch { expected, found: piece_hashes.len() });
        }

        let private = match Self::extract_uint(info_items.get(PRIVATE), "private")? {
            None | Some(0) => false,
            Some(1) => true,
            Some(v) => return Err(TorrentError::InvalidPrivateValue(v)),
        };

        Ok(TorrentFile {
            announce,
            announce_list: Self::extract_announce_list(items.get(ANNOUNCE_LIST))?,
            creation_date: Self::extract_uint(items.get(CREATION_DATE), "creation date")?,
            comment: Self::extract_string(items.get(COMMENT), "comment")?,
            created_by: Self::extract_string(items.get(CREATED_BY), "created by")?,
            encoding: Self::extract_string(items.get(ENCODING), "encoding")?,
            name: Self::extract_string(info_items.get(NAME), "name")?,
            total_num_bytes,
            num_bytes_per_piece,
            piece_hashes,
            info_hash: sha1_hash(&info.encode()),
            md5sum: Self::extract_md5sum(info_items.get(MD5SUM))?,
            private,
        })
    }
}

impl TorrentFile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = BencodeValue::try_from(bytes)?;
        TorrentFile::try_from(&value)
    }

    /// Loads a descriptor from disk.
    pub fn read<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(TorrentFile::from_bytes(&bytes)?)
    }

    /// Tracker GET url announcing a fresh download of the whole content.
    pub fn announce_url(&self, peer_id: &[u8; 20], port: u16) -> std::result::Result<Url, TrackerError> {
        tracker::announce_url(&self.announce, &self.info_hash, peer_id, port, self.total_num_bytes)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`: `piece length` for all but the final piece,
    /// which holds whatever remains.
    pub fn piece_len(&self, index: usize) -> Result<u64> {
        let num_pieces = self.num_pieces();
        if index >= num_pieces {
            return Err(TorrentError::PieceOutOfRange { index, num_pieces });
        }
        if index + 1 < num_pieces {
            return Ok(self.num_bytes_per_piece);
        }
        match self.total_num_bytes % self.num_bytes_per_piece {
            0 => Ok(self.num_bytes_per_piece),
            rest => Ok(rest),
        }
    }

    pub fn piece_hash(&self, index: usize) -> Result<[u8; 20]> {
        self.piece_hashes
            .get(index)
            .copied()
            .ok_or(TorrentError::PieceOutOfRange { index, num_pieces: self.num_pieces() })
    }

    fn convert_string(value: &BencodeValue) -> Option<String> {
        value.as_str().map(str::to_owned)
    }

    fn extract_string(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<String>> {
        match value {
            Some(v) => Self::convert_string(v).map(Some).ok_or(TorrentError::KeyDoesNotMapToString(name)),
            None => Ok(None),
        }
    }

    pub(crate) fn extract_uint(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<u64>> {
        match value {
            Some(BencodeValue::Integer(num)) if *num < 0 => Err(TorrentError::NegativeInteger(name, *num)),
            Some(BencodeValue::Integer(num)) => Ok(Some(*num as u64)),
            Some(_) => Err(TorrentError::KeyDoesNotMapToInteger(name)),
            None => Ok(None),
        }
    }

    fn require_uint(items: &Dictionary, key: &[u8], name: &'static str) -> Result<u64> {
        Self::extract_uint(items.get(key), name)?.ok_or(TorrentError::MissingRequiredKey(name))
    }

    fn extract_list_of_string(value: &BencodeValue, name: &'static str) -> Result<Vec<String>> {
        let elements = value.as_list().ok_or(TorrentError::KeyDoesNotMapToList(name))?;
        elements
            .iter()
            .map(|element| Self::convert_string(element).ok_or(TorrentError::KeyDoesNotMapToString(name)))
            .collect()
    }

    fn extract_md5sum(value: Option<&BencodeValue>) -> Result<Option<[u8; 16]>> {
        match value {
            None => Ok(None),
            Some(BencodeValue::ByteString(bytes)) => bytes
                .as_slice()
                .try_into()
                .map(Some)
                .map_err(|_| TorrentError::InvalidMd5Length(bytes.len())),
            Some(_) => Err(TorrentError::KeyDoesNotMapToString("md5sum")),
        }
    }

    fn extract_announce_list(value: Option<&BencodeValue>) -> Result<Vec<Vec<String>>> {
        let Some(v) = value else {
            return Ok(Vec::new());
        };
        let elements = v.as_list().ok_or(TorrentError::KeyDoesNotMapToList("announce-list"))?;
        elements
            .iter()
            .map(|element| match element {
                BencodeValue::List(_) => Self::extract_list_of_string(element, "announce-list"),
                BencodeValue::ByteString(_) => Self::convert_string(element)
                    .map(|s| vec![s])
                    .ok_or(TorrentError::InvalidAnnounceListElement),
                _ => Err(TorrentError::InvalidAnnounceListElement),
            })
            .collect()
    }

    fn extract_pieces(value: Option<&BencodeValue>) -> Result<Vec<[u8; 20]>> {
        match value {
            Some(BencodeValue::ByteString(s)) => {
                if s.len() % 20 != 0 {
                    return Err(TorrentError::InvalidPiecesLength(s.len()));
                }
                Ok(s.chunks_exact(20)
                    .map(|chunk| {
                        let mut hash = [0u8; 20];
                        hash.copy_from_slice(chunk);
                        hash
                    })
                    .collect())
            }
            Some(_) => Err(TorrentError::KeyDoesNotMapToString("pieces")),
            None => Err(TorrentError::MissingRequiredKey("pieces")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const ANNOUNCE_URL: &str = "http://tracker.example/announce";

    pub(crate) fn descriptor(info: &[u8]) -> Vec<u8> {
        let mut bytes = format!("d8:announce{}:{}4:info", ANNOUNCE_URL.len(), ANNOUNCE_URL).into_bytes();
        bytes.extend_from_slice(info);
        bytes.push(b'e');
        bytes
    }

    fn two_piece_info() -> Vec<u8> {
        let mut info = b"d6:lengthi32000e4:name8:test.bin12:piece lengthi16384e6:pieces40:".to_vec();
        info.extend_from_slice(&[b'A'; 20]);
        info.extend_from_slice(&[b'B'; 20]);
        info.push(b'e');
        info
    }

    #[test]
    fn parses_required_fields() {
        let torrent = TorrentFile::from_bytes(&descriptor(&two_piece_info())).unwrap();
        assert_eq!(torrent.announce, ANNOUNCE_URL);
        assert_eq!(torrent.total_num_bytes, 32000);
        assert_eq!(torrent.num_bytes_per_piece, 16384);
        assert_eq!(torrent.piece_hashes, vec![[b'A'; 20], [b'B'; 20]]);
        assert_eq!(torrent.name.as_deref(), Some("test.bin"));
        assert!(!torrent.private);
    }

    #[test]
    fn info_hash_matches_reference_vector() {
        let torrent = TorrentFile::from_bytes(&descriptor(&two_piece_info())).unwrap();
        assert_eq!(util::to_string(&torrent.info_hash), "2b151770e1605a7a3337d88ac2231cdf8fa02c00");
    }

    #[test]
    fn info_hash_uses_canonical_key_order() {
        // same info dictionary with keys shuffled on disk
        let mut info = b"d12:piece lengthi16384e4:name8:test.bin6:pieces40:".to_vec();
        info.extend_from_slice(&[b'A'; 20]);
        info.extend_from_slice(&[b'B'; 20]);
        info.extend_from_slice(b"6:lengthi32000ee");
        let torrent = TorrentFile::from_bytes(&descriptor(&info)).unwrap();
        assert_eq!(util::to_string(&torrent.info_hash), "2b151770e1605a7a3337d88ac2231cdf8fa02c00");
    }

    #[test]
    fn computes_piece_lengths() {
        let torrent = TorrentFile::from_bytes(&descriptor(&two_piece_info())).unwrap();
        assert_eq!(torrent.piece_len(0).unwrap(), 16384);
        assert_eq!(torrent.piece_len(1).unwrap(), 32000 - 16384);
        assert!(matches!(
            torrent.piece_len(2),
            Err(TorrentError::PieceOutOfRange { index: 2, num_pieces: 2 })
        ));
        assert_eq!(torrent.piece_hash(1).unwrap(), [b'B'; 20]);
    }

    #[test]
    fn final_piece_is_full_when_length_divides_evenly() {
        let mut info = b"d6:lengthi32768e12:piece lengthi16384e6:pieces40:".to_vec();
        info.extend_from_slice(&[0u8; 40]);
        info.push(b'e');
        let torrent = TorrentFile::from_bytes(&descriptor(&info)).unwrap();
        assert_eq!(torrent.piece_len(1).unwrap(), 16384);
        assert_eq!(torrent.name, None);
    }

    #[test]
    fn rejects_missing_or_mistyped_fields() {
        let err = TorrentFile::from_bytes(b"d4:infod6:lengthi1eee").unwrap_err();
        assert!(matches!(err, TorrentError::MissingRequiredKey("announce")));
        assert_eq!(err.kind(), ErrorKind::Type);

        let err = TorrentFile::from_bytes(b"d8:announcei1e4:infodee").unwrap_err();
        assert!(matches!(err, TorrentError::KeyDoesNotMapToString("announce")));

        let err = TorrentFile::from_bytes(&descriptor(b"le")).unwrap_err();
        assert!(matches!(err, TorrentError::KeyDoesNotMapToDictionary("info")));

        let err = TorrentFile::from_bytes(&descriptor(b"d12:piece lengthi1e6:pieces0:e")).unwrap_err();
        assert!(matches!(err, TorrentError::MissingRequiredKey("length")));

        let err = TorrentFile::from_bytes(&descriptor(b"d6:lengthi0e12:piece lengthi0e6:pieces0:e")).unwrap_err();
        assert!(matches!(err, TorrentError::ZeroPieceLength));

        let err = TorrentFile::from_bytes(&descriptor(b"d6:lengthi1e12:piece lengthi1e6:pieces3:abce")).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidPiecesLength(3)));

        let err = TorrentFile::from_bytes(b"le").unwrap_err();
        assert!(matches!(err, TorrentError::FileIsNotDictionary));
    }

    #[test]
    fn rejects_inconsistent_piece_count() {
        let mut info = b"d6:lengthi40000e12:piece lengthi16384e6:pieces40:".to_vec();
        info.extend_from_slice(&[0u8; 40]);
        info.push(b'e');
        let err = TorrentFile::from_bytes(&descriptor(&info)).unwrap_err();
        assert!(matches!(err, TorrentError::PieceCountMismatch { expected: 3, found: 2 }));
    }

    #[test]
    fn syntax_errors_keep_their_kind() {
        let err = TorrentFile::from_bytes(b"d8:announce").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn parses_optional_fields() {
        let mut bytes = format!("d8:announce{}:{}", ANNOUNCE_URL.len(), ANNOUNCE_URL).into_bytes();
        bytes.extend_from_slice(b"13:announce-listl4:udp1l4:udp24:udp3ee7:comment2:hi13:creation datei1700000000e");
        bytes.extend_from_slice(b"4:infod6:lengthi1e6:md5sum16:0123456789abcdef12:piece lengthi1e6:pieces20:");
        bytes.extend_from_slice(&[7u8; 20]);
        bytes.extend_from_slice(b"7:privatei1eee");
        let torrent = TorrentFile::from_bytes(&bytes).unwrap();
        assert_eq!(torrent.announce_list, vec![vec!["udp1".to_string()], vec!["udp2".into(), "udp3".into()]]);
        assert_eq!(torrent.comment.as_deref(), Some("hi"));
        assert_eq!(torrent.creation_date, Some(1700000000));
        assert_eq!(torrent.md5sum, Some(*b"0123456789abcdef"));
        assert!(torrent.private);
    }

    #[test]
    fn display_lists_summary_fields() {
        let torrent = TorrentFile::from_bytes(&descriptor(&two_piece_info())).unwrap();
        let text = torrent.to_string();
        assert!(text.starts_with(&format!("Tracker URL: {}\nLength: 32000\n", ANNOUNCE_URL)));
        assert!(text.contains("Info Hash: 2b151770e1605a7a3337d88ac2231cdf8fa02c00\n"));
        assert!(text.contains(&format!("Piece Hashes:\n{}\n{}\n", "41".repeat(20), "42".repeat(20))));
    }
    #[test]
    fn reads_descriptor_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &descriptor(&two_piece_info())).unwrap();
        let torrent = TorrentFile::read(file.path()).unwrap();
        assert_eq!(torrent.num_pieces(), 2);

        let err = TorrentFile::read(file.path().with_extension("missing")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn announce_url_carries_raw_info_hash() {
        let torrent = TorrentFile::from_bytes(&descriptor(&two_piece_info())).unwrap();
        let url = torrent.announce_url(b"-BP0001-abcdefghijkl", 6881).unwrap();
        let url = url.as_str();
        assert!(url.starts_with(ANNOUNCE_URL));
        assert!(url.contains("left=32000"));
        assert!(url.contains("&info_hash=%2B%15%17p%E1%60Zz37%D8%8A%C2%23%1C%DF%8F%A0%2C%00"));
    }
}
