//! Tagged, length-prefixed framing for the three unit kinds that share a
//! connection.
//!
//! ```text
//! +--------+-----------------+----------------------+
//! | tag u8 | payload_len u32 | payload              |
//! +--------+-----------------+----------------------+
//! 0x01 SyncRequest  empty payload
//! 0x02 SyncReply    f64 seconds since the Unix epoch, big-endian
//! 0x03 ChatLine     JSON object {"alias": ..., "text": ...}
//! ```
//!
//! Classification is driven by the tag alone, so a chat line whose text
//! looks like a timestamp is still a chat line.

use std::{borrow::Cow, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const TAG_SYNC_REQUEST: u8 = 0x01;
pub const TAG_SYNC_REPLY: u8 = 0x02;
pub const TAG_CHAT_LINE: u8 = 0x03;

/// Tag byte plus the big-endian payload length.
pub const HEADER_LEN: usize = 5;
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const SYNC_REPLY_LEN: usize = 8;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum WireUnit {
    SyncRequest,
    SyncReply { server_time: f64 },
    ChatLine { alias: String, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown unit tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("unit 0x{tag:02x} expects {expected} payload bytes, got {actual}")]
    PayloadLength {
        tag: u8,
        expected: usize,
        actual: usize,
    },

    #[error("payload of {0} bytes exceeds the {max} byte limit", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),

    #[error("chat payload is not valid: {0}")]
    InvalidChatPayload(String),

    #[error("sync reply carries a non-finite time")]
    NonFiniteTime,

    #[error("unit 0x{0:02x} is not valid in this direction")]
    UnexpectedUnit(u8),
}

impl WireError {
    /// A fatal error leaves the decoder unable to find the next frame boundary;
    /// the connection has to be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::PayloadTooLarge(_))
    }
}

impl WireUnit {
    pub fn chat(alias: impl Into<String>, text: impl Into<String>) -> Self {
        WireUnit::ChatLine {
            alias: alias.into(),
            text: text.into(),
        }
    }

    pub fn sync_reply(server_time: f64) -> Self {
        WireUnit::SyncReply { server_time }
    }

    pub fn tag(&self) -> u8 {
        match self {
            WireUnit::SyncRequest => TAG_SYNC_REQUEST,
            WireUnit::SyncReply { .. } => TAG_SYNC_REPLY,
            WireUnit::ChatLine { .. } => TAG_CHAT_LINE,
        }
    }

    /// Encodes the unit into one complete frame.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = match self {
            WireUnit::SyncRequest => Vec::new(),
            WireUnit::SyncReply { server_time } => {
                if !server_time.is_finite() {
                    return Err(WireError::NonFiniteTime);
                }
                server_time.to_be_bytes().to_vec()
            }
            WireUnit::ChatLine { alias, text } => {
                let payload = ChatPayload {
                    alias: Cow::Borrowed(alias.as_str()),
                    text: Cow::Borrowed(text.as_str()),
                };
                serde_json::to_vec(&payload).map_err(invalid_chat_payload)?
            }
        };

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(self.tag());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn decode_payload(tag: u8, payload: &[u8]) -> Result<Self, WireError> {
        match tag {
            TAG_SYNC_REQUEST if payload.is_empty() => Ok(WireUnit::SyncRequest),
            TAG_SYNC_REQUEST => Err(WireError::PayloadLength {
                tag,
                expected: 0,
                actual: payload.len(),
            }),
            TAG_SYNC_REPLY => {
                let bytes: [u8; SYNC_REPLY_LEN] =
                    payload.try_into().map_err(|_| WireError::PayloadLength {
                        tag,
                        expected: SYNC_REPLY_LEN,
                        actual: payload.len(),
                    })?;
                let server_time = f64::from_be_bytes(bytes);
                if !server_time.is_finite() {
                    return Err(WireError::NonFiniteTime);
                }
                Ok(WireUnit::SyncReply { server_time })
            }
            TAG_CHAT_LINE => decode_chat_line(payload),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// Body of a `ChatLine` unit.
#[derive(Debug, Serialize, Deserialize)]
struct ChatPayload<'a> {
    #[serde(borrow)]
    alias: Cow<'a, str>,
    #[serde(borrow)]
    text: Cow<'a, str>,
}

fn decode_chat_line(payload: &[u8]) -> Result<WireUnit, WireError> {
    let ChatPayload { alias, text } =
        serde_json::from_slice(payload).map_err(invalid_chat_payload)?;
    Ok(WireUnit::chat(alias, text))
}

fn invalid_chat_payload(err: serde_json::Error) -> WireError {
    WireError::InvalidChatPayload(err.to_string())
}

/// Incremental decoder that turns an arbitrary split of the byte stream back
/// into units.
///
/// A recoverable [`WireError`] consumes the offending frame so the next call
/// starts on a frame boundary. A fatal error leaves the buffer untouched.
#[derive(Debug, Default)]
pub struct UnitDecoder {
    buf: Vec<u8>,
}

impl UnitDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns `None` while fewer bytes than one complete frame are buffered.
    pub fn decode_next(&mut self) -> Option<Result<WireUnit, WireError>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let tag = self.buf[0];
        let payload_len =
            u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Some(Err(WireError::PayloadTooLarge(payload_len)));
        }

        let frame_len = HEADER_LEN + payload_len;
        if self.buf.len() < frame_len {
            return None;
        }

        let decoded = WireUnit::decode_payload(tag, &self.buf[HEADER_LEN..frame_len]);
        self.buf.drain(..frame_len);
        Some(decoded)
    }
}

/// Reads until one unit (or one malformed frame) is available.
///
/// Returns `Ok(None)` on end-of-stream; a partially received unit is
/// discarded and the close is reported as a clean disconnect. Buffered bytes
/// live in `decoder`, so dropping this future between reads loses nothing.
pub async fn read_unit<R>(
    reader: &mut R,
    decoder: &mut UnitDecoder,
) -> io::Result<Option<Result<WireUnit, WireError>>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(decoded) = decoder.decode_next() {
            return Ok(Some(decoded));
        }

        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            if decoder.buffered_len() > 0 {
                debug!(discarded = decoder.buffered_len(), "stream closed mid-unit");
                decoder.clear();
            }
            return Ok(None);
        }
        decoder.extend(&chunk[..read]);
    }
}

pub async fn write_unit<W>(writer: &mut W, unit: &WireUnit) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = unit.encode().map_err(to_io_error)?;
    write_frame(writer, &frame).await
}

/// Writes an already encoded frame and flushes so peers see it promptly.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

fn to_io_error(err: WireError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}
