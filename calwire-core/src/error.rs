//! Error taxonomy shared by every layer of the engine.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All failures the engine reports to its caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// Orderly close by the peer.
    #[error("peer disconnected")]
    Disconnected,
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A required field was missing or not of the expected shape.
    #[error("missing or malformed field: {0}")]
    JsonParse(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("write failed: {0}")]
    WriteFile(#[source] io::Error),
}

/// Fieldless view of [`Error`], for matching and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Socket,
    ConnectFailed,
    Disconnected,
    Timeout,
    Cancelled,
    Protocol,
    JsonParse,
    OutOfMemory,
    WriteFile,
}

impl ErrorKind {
    /// Short status string shown to the user.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::Socket => "Socket error",
            ErrorKind::ConnectFailed => "Connection failed",
            ErrorKind::Disconnected => "Disconnected",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Protocol => "Protocol error",
            ErrorKind::JsonParse => "JSON parse error",
            ErrorKind::OutOfMemory => "Out of memory",
            ErrorKind::WriteFile => "File write error",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Socket(_) => ErrorKind::Socket,
            Error::ConnectFailed(_) => ErrorKind::ConnectFailed,
            Error::Disconnected => ErrorKind::Disconnected,
            Error::Timeout => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::JsonParse(_) => ErrorKind::JsonParse,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::WriteFile(_) => ErrorKind::WriteFile,
        }
    }

    /// Map a socket-level I/O error. Timeouts and resets keep their meaning.
    pub(crate) fn from_socket(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::Disconnected,
            _ => Error::Socket(err),
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn field(name: &str) -> Self {
        Error::JsonParse(name.to_string())
    }
}

/// True for conditions that are retried locally and never surfaced.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Error::Disconnected.kind(), ErrorKind::Disconnected);
        assert_eq!(Error::protocol("bad").kind(), ErrorKind::Protocol);
        assert_eq!(Error::field("lpath").kind(), ErrorKind::JsonParse);
    }

    #[test]
    fn socket_errors_map_to_kinds() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(Error::from_socket(reset), Error::Disconnected));
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(Error::from_socket(timed_out), Error::Timeout));
        let other = io::Error::new(io::ErrorKind::AddrInUse, "busy");
        assert!(matches!(Error::from_socket(other), Error::Socket(_)));
    }

    #[test]
    fn transient_conditions() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn status_strings_are_short() {
        assert_eq!(ErrorKind::Cancelled.as_str(), "Cancelled");
        assert_eq!(Error::Timeout.kind().as_str(), "Timeout");
    }
}
