//! Errors on a worker pipe.

use std::fmt;
use std::io;

/// Which half of the pipe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer closed the pipe on a frame boundary. This is how a worker's
    /// stdout ends when the process exits.
    Closed,

    /// The stream ended inside a frame.
    Truncated { read: usize, expected: usize },

    /// A frame above the 1 MiB limit, outgoing or announced by a prefix.
    FrameTooLarge { len: usize },

    /// A zero length prefix.
    EmptyFrame,

    Encode(String),

    /// The payload did not decode, usually a protocol mismatch with the
    /// worker binary. The stream itself is still aligned.
    Decode { reason: String, len: usize },

    Io {
        direction: Direction,
        kind: io::ErrorKind,
    },
}

impl TransportError {
    pub(crate) fn io(direction: Direction, err: &io::Error) -> Self {
        Self::Io {
            direction,
            kind: err.kind(),
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the next `recv` can still succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("pipe closed by peer"),
            Self::Truncated { read, expected } => {
                write!(f, "stream ended mid-frame after {read} of {expected} bytes")
            }
            Self::FrameTooLarge { len } => write!(
                f,
                "frame of {len} bytes exceeds the {} byte limit",
                crate::MAX_PAYLOAD_SIZE
            ),
            Self::EmptyFrame => f.write_str("zero-length frame"),
            Self::Encode(reason) => write!(f, "cannot encode message: {reason}"),
            Self::Decode { reason, len } => {
                write!(f, "cannot decode {len}-byte payload: {reason}")
            }
            Self::Io { direction, kind } => write!(f, "pipe {direction} failed: {kind}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_limit() {
        let msg = TransportError::FrameTooLarge { len: 2_000_000 }.to_string();
        assert_eq!(msg, "frame of 2000000 bytes exceeds the 1048576 byte limit");
    }

    #[test]
    fn test_only_decode_failures_are_recoverable() {
        let decode = TransportError::Decode {
            reason: "unexpected variant".to_string(),
            len: 12,
        };
        assert!(decode.is_recoverable());
        assert!(!TransportError::Closed.is_recoverable());
        assert!(!TransportError::Truncated { read: 4, expected: 10 }.is_recoverable());
    }

    #[test]
    fn test_io_error_keeps_direction() {
        let err = TransportError::io(
            Direction::Write,
            &io::Error::from(io::ErrorKind::BrokenPipe),
        );
        assert_eq!(err.to_string(), "pipe write failed: broken pipe");
        assert!(!err.is_closed());
    }
}
