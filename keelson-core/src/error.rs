/// Keelson Error Types
///
/// One error enum shared by the loop, the buffers and the transports.
use std::io;
use thiserror::Error;

/// Main error type for Keelson operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during socket or buffer operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A zero-copy read reservation is already outstanding
    #[error("buffer busy reading")]
    Reading,

    /// A zero-copy write reservation is already outstanding
    #[error("buffer busy writing")]
    Writing,

    /// A reservation was committed without a matching begin, or past its end
    #[error("buffer reservation misuse")]
    Reservation,

    /// Session is not running
    #[error("session disconnected")]
    Disconnected,

    /// Outbound queue is full
    #[error("session busy")]
    Busy,

    /// The loop has been cancelled
    #[error("loop cancelled")]
    Cancelled,

    /// A channel closed while a coroutine was parked on it
    #[error("channel closed")]
    ChannelClosed,

    /// An executor or blocking call panicked
    #[error("panicked: {0}")]
    Panicked(String),

    /// Protocol violation on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed configuration
    #[error("config error: {0}")]
    Config(String),

    /// Several listener failures collected by one event emit
    #[error("{}", joined(.0))]
    Aggregate(Vec<Error>),

    /// Application-level error surfaced through a callback
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

fn joined(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type alias for Keelson operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an application error
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(msg)
    }

    /// Check if this error is a transient IO condition worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// Check if this error came from the socket layer
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let interrupted = Error::from(io::Error::new(io::ErrorKind::Interrupted, "eintr"));
        assert!(interrupted.is_transient());

        let reset = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(!reset.is_transient());
        assert!(reset.is_io());
        assert!(!Error::Busy.is_io());
    }

    #[test]
    fn panic_payload_message() {
        let err = Error::panicked(Box::new("boom"));
        assert!(matches!(err, Error::Panicked(ref m) if m == "boom"));
        let err = Error::panicked(Box::new(String::from("bang")));
        assert!(matches!(err, Error::Panicked(ref m) if m == "bang"));
    }
}
