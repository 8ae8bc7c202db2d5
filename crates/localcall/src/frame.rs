//! Control-channel framing.
//!
//! Every frame on the Unix socket is a 4-byte big-endian body length
//! followed by the body. Body byte 0 is the tag; the rest is tag-specific,
//! with integer fields little-endian:
//!
//! | tag          | body                                      |
//! |--------------|-------------------------------------------|
//! | 0x01 REQUEST | `u16 name_len`, name bytes, `u64 capacity`|
//! | 0x02 READY   | empty                                     |
//! | 0x03 DONE    | `u16 name_len`, name bytes, `u64 capacity`|
//! | 0x7F ERROR   | `u16 msg_len`, UTF-8 message bytes        |
//!
//! Frames are atomic: a stream that closes mid-frame surfaces as
//! [`FrameError::PeerClosed`]. Control frames carry names and sizes, never
//! payloads, so bodies above 64 KiB are rejected outright.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body, tag byte included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const TAG_REQUEST: u8 = 0x01;
const TAG_READY: u8 = 0x02;
const TAG_DONE: u8 = 0x03;
const TAG_ERROR: u8 = 0x7f;

/// One control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Caller to server: the request payload awaits in `shm_name`.
    Request { shm_name: String, capacity: u64 },
    /// Server to caller: request copied out, the handler is running.
    Ready,
    /// Server to caller: the reply awaits in `shm_name` (possibly the
    /// request segment, reused).
    Done { shm_name: String, capacity: u64 },
    /// Server to caller: the call failed; `message` is user-facing.
    Error { message: String },
}

/// Frame-level failures, converted to [`crate::Error`] at the call
/// boundary.
#[derive(Debug)]
pub enum FrameError {
    /// The peer closed the stream before or inside a frame.
    PeerClosed,
    /// Tag, field structure, or body length is wrong.
    Malformed(String),
    /// Socket-level failure.
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PeerClosed => write!(f, "peer closed the control channel"),
            FrameError::Malformed(msg) => write!(f, "malformed frame: {msg}"),
            FrameError::Io(err) => write!(f, "control channel i/o: {err}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Frame {
    /// Wire name of the frame's tag, for diagnostics.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "REQUEST",
            Frame::Ready => "READY",
            Frame::Done { .. } => "DONE",
            Frame::Error { .. } => "ERROR",
        }
    }

    /// Encode the body: tag byte included, length prefix excluded.
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Frame::Request { shm_name, capacity } => encode_named(TAG_REQUEST, shm_name, *capacity),
            Frame::Ready => vec![TAG_READY],
            Frame::Done { shm_name, capacity } => encode_named(TAG_DONE, shm_name, *capacity),
            Frame::Error { message } => {
                // Overlong messages lose their tail rather than the whole
                // frame: the body must stay within MAX_FRAME_LEN.
                let bytes = truncate_utf8(message, MAX_FRAME_LEN - 3);
                let mut body = Vec::with_capacity(3 + bytes.len());
                body.push(TAG_ERROR);
                body.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                body.extend_from_slice(bytes);
                body
            }
        }
    }

    /// Decode a body previously produced by [`Frame::encode_body`].
    pub fn decode_body(body: &[u8]) -> Result<Self, FrameError> {
        let (&tag, rest) = body
            .split_first()
            .ok_or_else(|| FrameError::Malformed("empty frame body".into()))?;
        match tag {
            TAG_REQUEST => {
                let (shm_name, capacity) = decode_named(rest)?;
                Ok(Frame::Request { shm_name, capacity })
            }
            TAG_READY => {
                if !rest.is_empty() {
                    return Err(FrameError::Malformed(format!(
                        "READY carries no body, got {} extra bytes",
                        rest.len()
                    )));
                }
                Ok(Frame::Ready)
            }
            TAG_DONE => {
                let (shm_name, capacity) = decode_named(rest)?;
                Ok(Frame::Done { shm_name, capacity })
            }
            TAG_ERROR => {
                if rest.len() < 2 {
                    return Err(FrameError::Malformed("ERROR body shorter than its length field".into()));
                }
                let msg_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
                let msg = &rest[2..];
                if msg.len() != msg_len {
                    return Err(FrameError::Malformed(format!(
                        "ERROR claims {msg_len} message bytes, body carries {}",
                        msg.len()
                    )));
                }
                // The message is display-only; tolerate bad UTF-8 instead
                // of failing the whole error report.
                Ok(Frame::Error {
                    message: String::from_utf8_lossy(msg).into_owned(),
                })
            }
            other => Err(FrameError::Malformed(format!("unknown frame tag {other:#04x}"))),
        }
    }
}

fn encode_named(tag: u8, name: &str, capacity: u64) -> Vec<u8> {
    let bytes = name.as_bytes();
    debug_assert!(bytes.len() <= u16::MAX as usize);
    let mut body = Vec::with_capacity(11 + bytes.len());
    body.push(tag);
    body.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(&capacity.to_le_bytes());
    body
}

fn decode_named(rest: &[u8]) -> Result<(String, u64), FrameError> {
    if rest.len() < 2 {
        return Err(FrameError::Malformed("body shorter than its length field".into()));
    }
    let name_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2..];
    if rest.len() != name_len + 8 {
        return Err(FrameError::Malformed(format!(
            "expected {} field bytes, body carries {}",
            name_len + 8,
            rest.len()
        )));
    }
    // Segment names go straight into shm_open; reject anything that is
    // not clean UTF-8.
    let name = std::str::from_utf8(&rest[..name_len])
        .map_err(|_| FrameError::Malformed("shm name is not UTF-8".into()))?
        .to_owned();
    let mut capacity = [0u8; 8];
    capacity.copy_from_slice(&rest[name_len..]);
    Ok((name, u64::from_le_bytes(capacity)))
}

/// Longest prefix of `s` within `max` bytes that is still valid UTF-8.
fn truncate_utf8(s: &str, max: usize) -> &[u8] {
    if s.len() <= max {
        return s.as_bytes();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

/// Read one frame. A close before or inside a frame is
/// [`FrameError::PeerClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await.map_err(map_read_err)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(FrameError::Malformed(format!(
            "frame body of {len} bytes out of range"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(map_read_err)?;
    Frame::decode_body(&body)
}

/// Write one frame, flushing all of it before returning.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let body = frame.encode_body();
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await.map_err(FrameError::Io)?;
    writer.flush().await.map_err(FrameError::Io)?;
    Ok(())
}

fn map_read_err(err: io::Error) -> FrameError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::PeerClosed
    } else {
        FrameError::Io(err)
    }
}
