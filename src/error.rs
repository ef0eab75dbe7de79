//! Error types for the engine.
//!
//! Only conditions that are fatal to a connection surface here. Peer-visible
//! request outcomes (unknown role, overload, refused multiplexing) are not
//! errors; they travel back to the web server as a `protocol_status` inside
//! an `END_REQUEST` record. Application faults never escape the request
//! boundary either, they become a non-zero app status.

use thiserror::Error;

/// A malformed or unsupported byte sequence on the wire.
///
/// Any of these tears down the connection it arrived on. Other connections
/// and their requests are unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a complete record header.
    #[error("truncated record header")]
    Truncated,

    /// The version field of a record header was not 1.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
}

/// Main error type for connection handling.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Hard socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
