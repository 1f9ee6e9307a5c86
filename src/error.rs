//! Error types for flowgate

use std::io;

use thiserror::Error;

/// Main error type for flowgate
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DNS error: {0}")]
    Dns(String),

    /// An error annotated with what was being done when it happened
    #[error("{context}: {source}")]
    Cause {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("empty outbound config")]
    EmptyOutbound,

    #[error("unknown outbound type: {0}")]
    UnknownOutboundType(String),

    #[error("outbound not found: {0}")]
    OutboundNotFound(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl Error {
    /// Wrap this error with a description of the failed step
    pub fn cause(self, context: impl Into<String>) -> Self {
        Error::Cause {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error only means the peer or the local side went away.
    ///
    /// Closed errors are the normal end of a flow and are logged at debug level.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(e) => is_closed_io(e),
            Error::Cause { source, .. } => source.is_closed(),
            _ => false,
        }
    }

    /// Whether this error is a deadline or timeout expiry
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock),
            Error::Cause { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Classify an IO error as a closed-connection condition
pub fn is_closed_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

impl From<hickory_proto::error::ProtoError> for Error {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        Error::Dns(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Result type alias for flowgate
pub type Result<T> = std::result::Result<T, Error>;
