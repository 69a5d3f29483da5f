// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for channel operations.

use std::fmt;
use std::io;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors reported by channels, connectors, and queued operations.
///
/// The enum is cloneable so one failure can be fanned out to the send
/// pipeline, the recv pipeline, and any registered connection waiters.
/// I/O errors are carried as kind plus message for that reason.
#[derive(Clone, Debug)]
pub enum ChannelError {
    /// Transport failure on the underlying socket.
    Io {
        kind: io::ErrorKind,
        msg: String,
    },

    /// The channel was closed or cancelled; dropped operations complete
    /// with this error.
    Closed,

    /// Connection establishment was cancelled by the user, or the peer
    /// failed the greeting exchange.
    Cancelled,

    /// Terminal connect failure reported by `wait_for_connection`.
    ConnectFailed(String),

    /// The peer's handshake was malformed or did not match this session.
    HandshakeRejected(String),

    /// An incoming message announced a size above the configured limit.
    Oversize { size: usize, limit: usize },
}

impl ChannelError {
    /// Check whether this error is a cancellation (user cancel or close).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChannelError::Cancelled | ChannelError::Closed)
            || matches!(
                self,
                ChannelError::Io {
                    kind: io::ErrorKind::ConnectionAborted,
                    ..
                }
            )
    }

    /// The io error kind, if this wraps an I/O failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ChannelError::Io { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Io { msg, .. } => write!(f, "{}", msg),
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::Cancelled => write!(f, "operation cancelled"),
            ChannelError::ConnectFailed(msg) => write!(f, "failed to connect: {}", msg),
            ChannelError::HandshakeRejected(msg) => write!(f, "handshake rejected: {}", msg),
            ChannelError::Oversize { size, limit } => {
                write!(f, "message size {} exceeds limit {}", size, limit)
            }
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io {
            kind: e.kind(),
            msg: e.to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ChannelError::Closed.to_string(), "channel closed");
        assert_eq!(ChannelError::Cancelled.to_string(), "operation cancelled");
        assert_eq!(
            ChannelError::ConnectFailed("refused".into()).to_string(),
            "failed to connect: refused"
        );
        assert_eq!(
            ChannelError::Oversize {
                size: 100,
                limit: 10
            }
            .to_string(),
            "message size 100 exceeds limit 10"
        );
    }

    #[test]
    fn test_from_io_error() {
        let err: ChannelError = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe").into();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_is_cancelled() {
        assert!(ChannelError::Cancelled.is_cancelled());
        assert!(ChannelError::Closed.is_cancelled());

        let aborted: ChannelError =
            io::Error::new(io::ErrorKind::ConnectionAborted, "aborted").into();
        assert!(aborted.is_cancelled());

        let reset: ChannelError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(!reset.is_cancelled());
    }

    #[test]
    fn test_clone() {
        let err: ChannelError = io::Error::new(io::ErrorKind::TimedOut, "timed out").into();
        let cloned = err.clone();
        assert_eq!(cloned.io_kind(), Some(io::ErrorKind::TimedOut));
    }
}
