//! # Error Taxonomy
//!
//! Purpose: Give every failure in the pipelining engine one of a small set of
//! categories so callers can tell a retryable capacity condition from a dead
//! connection or a plain server-side error reply.
//!
//! ## Design Principles
//! 1. **Category First**: `ErrorKind` is what callers branch on; variants carry
//!    the detail.
//! 2. **Cloneable**: One connection failure fans out to every in-flight work
//!    item, so the error must be `Clone` (I/O errors sit behind `Arc`).
//! 3. **Blast Radius Is Explicit**: `is_fatal_to_connection` tells the pipeline
//!    whether to tear itself down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Result type used across PipeKV crates.
pub type PkvResult<T> = Result<T, PkvError>;

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Buffer pool exhausted within the wait window.
    Capacity,
    /// The server answered with an error reply.
    Protocol,
    /// The reply stream could not be interpreted.
    Corruption,
    /// Socket/stream failure.
    Transport,
    /// Connecting or authenticating a new connection failed.
    Connect,
    /// Misuse or lifecycle condition (bad config, disposed pool, odd reply shape).
    Usage,
}

/// Errors surfaced by the buffer pool, codec, pipelines and pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PkvError {
    /// No chunk became available before the checkout deadline.
    #[error("buffer pool exhausted: no chunk available after {waited:?}")]
    CapacityTimeout { waited: Duration },

    /// Server returned an error reply (`-...`). `message` excludes the prefix and CRLF.
    #[error("server error: {message}")]
    Protocol { message: String },

    /// The decoder hit bytes it cannot interpret as a frame.
    #[error("protocol corruption: {reason}")]
    Corruption { reason: String },

    /// Socket failure, peer close, or I/O timeout.
    #[error("transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Connection establishment (dial or handshake) failed.
    #[error("failed to establish connection to {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: Arc<PkvError>,
    },

    /// Reply shape did not match the command primitive that was used.
    #[error("unexpected reply: expected {expected}")]
    UnexpectedReply { expected: &'static str },

    /// A command needs more buffer chunks than the pool can ever hold.
    #[error("command of {size} bytes exceeds the buffer pool limit of {limit} bytes")]
    CommandTooLarge { size: usize, limit: usize },

    /// The pipeline or pool was shut down while the request was queued.
    #[error("pipeline disposed")]
    Disposed,

    /// A work item was dropped without ever being resolved.
    #[error("request abandoned before completion")]
    Abandoned,

    /// Configuration values are unusable.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl PkvError {
    /// Builds a transport error from an I/O error and a short context label.
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        PkvError::Transport {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Builds a corruption error.
    pub fn corruption(reason: impl Into<String>) -> Self {
        PkvError::Corruption {
            reason: reason.into(),
        }
    }

    /// Wraps `cause` with the endpoint it was raised for.
    pub fn connect(endpoint: impl Into<String>, cause: PkvError) -> Self {
        PkvError::Connect {
            endpoint: endpoint.into(),
            source: Arc::new(cause),
        }
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PkvError::CapacityTimeout { .. } => ErrorKind::Capacity,
            PkvError::Protocol { .. } => ErrorKind::Protocol,
            PkvError::Corruption { .. } => ErrorKind::Corruption,
            PkvError::Transport { .. } => ErrorKind::Transport,
            PkvError::Connect { .. } => ErrorKind::Connect,
            PkvError::UnexpectedReply { .. }
            | PkvError::CommandTooLarge { .. }
            | PkvError::Disposed
            | PkvError::Abandoned
            | PkvError::Config { .. } => ErrorKind::Usage,
        }
    }

    /// True only for capacity timeouts; nothing else is safe to blindly retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Capacity
    }

    /// True when the connection that raised this error can no longer be trusted.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corruption | ErrorKind::Transport)
    }

    /// Server error text for `Protocol` errors.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            PkvError::Protocol { message } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn categories_drive_policy() {
        let timeout = PkvError::CapacityTimeout {
            waited: Duration::from_millis(5),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_fatal_to_connection());

        let server = PkvError::Protocol {
            message: "ERR Oh no.".to_string(),
        };
        assert_eq!(server.kind(), ErrorKind::Protocol);
        assert!(!server.is_fatal_to_connection());
        assert_eq!(server.server_message(), Some("ERR Oh no."));

        let oversized = PkvError::CommandTooLarge { size: 64, limit: 32 };
        assert_eq!(oversized.kind(), ErrorKind::Usage);
        assert!(!oversized.is_retryable());
        assert!(!oversized.is_fatal_to_connection());

        assert!(PkvError::corruption("bad prefix").is_fatal_to_connection());
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(PkvError::transport("read", io).is_fatal_to_connection());
    }

    #[test]
    fn connect_error_keeps_cause() {
        let cause = PkvError::transport(
            "dial",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        let err = PkvError::connect("127.0.0.1:1", cause);
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert!(err.to_string().contains("127.0.0.1:1"));
        let source = err.source().expect("source");
        assert!(source.to_string().contains("dial"));
    }

    #[test]
    fn clones_share_io_source() {
        let err = PkvError::transport("write", io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let copy = err.clone();
        match (err, copy) {
            (
                PkvError::Transport { source: a, .. },
                PkvError::Transport { source: b, .. },
            ) => assert!(Arc::ptr_eq(&a, &b)),
            _ => unreachable!(),
        }
    }
}
