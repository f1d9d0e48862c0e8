//! Error types for every component boundary in the engine.
//!
//! Each component that can fail gets its own small enum; [`Error`] composes
//! them at the crate boundary so that callers of the public API only have to
//! deal with one error type, while internal code matches on the precise
//! variant it can act on.

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top-level error type, wrapping every component's error kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Metainfo(#[from] MetainfoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from parsing a `.torrent` metainfo file.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("malformed bencoding: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("info dictionary is missing the single-file `length` field (multi-file torrents are not supported)")]
    MissingLength,
    #[error("piece hashes length {0} is not a multiple of 20")]
    InvalidPieceHashesLength(usize),
}

/// Errors from the content-addressed storage layer.
///
/// All of these are fatal to the engine: a storage failure propagates and
/// shuts the engine down cleanly rather than being
/// swallowed like a peer- or tracker-level error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open backing file {path:?}: {source}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "backing file {path:?} has size {actual}, expected {expected}"
    )]
    SizeMismatch {
        path: std::path::PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("piece index {0} is out of bounds")]
    InvalidPieceIndex(crate::PieceIndex),
    #[error("block read/write at piece {index} offset {offset} length {length} is out of bounds")]
    InvalidBlockRange {
        index: crate::PieceIndex,
        offset: u32,
        length: u32,
    },
    #[error("attempted to write piece {0} that failed validation")]
    UnvalidatedWrite(crate::PieceIndex),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the tracker HTTP client. These are always non-fatal: the
/// engine logs and swallows them, continuing to serve inbound peers.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http request to tracker failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed tracker response: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("tracker returned a non-compact peer list, which is not supported")]
    NonCompactPeerList,
    #[error("tracker rejected the announce: {0}")]
    Failure(String),
    #[error("tracker announce url is not a valid url")]
    InvalidAnnounceUrl,
    #[error("tracker response `peers` byte string length {0} is not a multiple of 6")]
    InvalidPeerListLength(usize),
}

/// Errors from a single peer session / the wire protocol codec.
///
/// These never surface above the session task: the session is closed and
/// any claimed pieces are released, but the engine continues running.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer sent invalid handshake protocol string")]
    InvalidProtocolString,
    #[error("peer's info hash does not match ours")]
    InvalidInfoHash,
    #[error("peer sent a message with an invalid length prefix")]
    InvalidMessageLength,
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
