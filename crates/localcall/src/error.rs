//! Public error type for callers and hosts.
//!
//! The lower layers keep their own error enums ([`SegmentError`],
//! [`FrameError`]) and convert here at the call boundary, so users see one
//! flat set of failure kinds.

use std::io;

use thiserror::Error;

use crate::frame::FrameError;
use crate::segment::SegmentError;

/// Errors surfaced to library users.
#[derive(Debug, Error)]
pub enum Error {
    /// The service socket does not exist, or nobody answered within the
    /// connect timeout.
    #[error("service '{0}' not found")]
    NotFound(String),

    /// I/O failure on the control channel or while mapping shared memory.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    /// Malformed frame, unexpected tag, or a corrupt segment header.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Payload does not fit the allocated segment.
    #[error("payload of {len} bytes exceeds segment capacity of {capacity} bytes")]
    TooLarge { len: u64, capacity: u64 },

    /// The remote handler failed; the message is user-facing.
    #[error("remote error: {0}")]
    Remote(String),

    /// Another server already owns the service name.
    #[error("service '{0}' is already registered")]
    AddressInUse(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<SegmentError> for Error {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::AlreadyExists => Error::Transport(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "shared memory name already taken",
            )),
            SegmentError::NotFound => Error::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                "shared memory segment does not exist",
            )),
            SegmentError::NoSpace => Error::Transport(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "no space for shared memory segment",
            )),
            SegmentError::TooLarge { len, capacity } => Error::TooLarge {
                len: len as u64,
                capacity: capacity as u64,
            },
            SegmentError::Corrupt { claimed, capacity } => Error::Protocol(format!(
                "segment header claims {claimed} payload bytes but the segment holds {capacity}"
            )),
            SegmentError::Os(err) => Error::Transport(err),
        }
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::PeerClosed => Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the control channel mid-call",
            )),
            FrameError::Malformed(msg) => Error::Protocol(msg),
            FrameError::Io(err) => Error::Transport(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_too_large_keeps_sizes() {
        let err = Error::from(SegmentError::TooLarge {
            len: 100,
            capacity: 64,
        });
        match err {
            Error::TooLarge { len: 100, capacity: 64 } => {}
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn peer_closed_maps_to_transport() {
        match Error::from(FrameError::PeerClosed) {
            Error::Transport(err) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
