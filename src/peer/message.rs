use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::{PeerError, with_timeout};

/// Upper bound on a frame's length prefix: 16 MiB of payload plus headroom
/// for the id and piece header.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024 + 16;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            other => Err(other),
        }
    }
}

/// A post-handshake peer wire message. Frames are
/// `<u32 length><u8 id><payload>`; a zero length is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bitmap: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, bytes: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any id outside the core set, e.g. extension messages.
    Unknown { id: u8, payload: Vec<u8> },
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn expect_len(id: u8, payload: &[u8], expected: usize) -> Result<(), PeerError> {
    if payload.len() != expected {
        return Err(PeerError::UnexpectedNumBytes { id, expected, received: payload.len() });
    }
    Ok(())
}

impl Message {
    fn id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Unknown { id, .. } => return Some(*id),
        };
        Some(id as u8)
    }

    /// Parses the payload that followed id byte `id`.
    pub fn decode(id: u8, mut payload: Vec<u8>) -> Result<Self, PeerError> {
        let Ok(kind) = MessageId::try_from(id) else {
            return Ok(Message::Unknown { id, payload });
        };
        let msg = match kind {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => {
                expect_len(id, &payload, 0)?;
                match kind {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MessageId::Have => {
                expect_len(id, &payload, 4)?;
                Message::Have { index: be_u32(&payload) }
            }
            MessageId::Bitfield => Message::Bitfield { bitmap: payload },
            MessageId::Request | MessageId::Cancel => {
                expect_len(id, &payload, 12)?;
                let index = be_u32(&payload[0..4]);
                let begin = be_u32(&payload[4..8]);
                let length = be_u32(&payload[8..12]);
                if kind == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(PeerError::UnexpectedNumBytes { id, expected: 8, received: payload.len() });
                }
                let index = be_u32(&payload[0..4]);
                let begin = be_u32(&payload[4..8]);
                payload.drain(0..8);
                Message::Piece { index, begin, bytes: payload }
            }
        };
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return vec![0; 4];
        };
        let mut payload: Vec<u8> = Vec::new();
        match self {
            Message::Have { index } => payload.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield { bitmap } => payload.extend_from_slice(bitmap),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, bytes } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(bytes);
            }
            Message::Unknown { payload: raw, .. } => payload.extend_from_slice(raw),
            _ => (),
        }
        let mut buf = Vec::with_capacity(4 + 1 + payload.len());
        buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        buf.push(id);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Reads exactly one frame. A stream that ends mid-frame is
    /// `ConnectionClosed`; the whole frame must arrive within `timeout`.
    pub async fn read_message<S>(stream: &mut S, timeout: Duration) -> Result<Self, PeerError>
    where
        S: AsyncRead + Unpin,
    {
        with_timeout(timeout, Self::read_frame(stream)).await
    }

    async fn read_frame<S>(stream: &mut S) -> Result<Self, PeerError>
    where
        S: AsyncRead + Unpin,
    {
        let total_length = stream.read_u32().await?;
        if total_length == 0 {
            return Ok(Message::KeepAlive);
        }
        if total_length > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(total_length));
        }
        let id = stream.read_u8().await?;
        let mut payload = vec![0u8; total_length as usize - 1];
        stream.read_exact(&mut payload).await?;
        Message::decode(id, payload)
    }

    pub async fn send<S>(&self, stream: &mut S, timeout: Duration) -> Result<(), PeerError>
    where
        S: AsyncWrite + Unpin,
    {
        let bytes = self.encode();
        with_timeout(timeout, async {
            stream.write_all(&bytes).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }
}
