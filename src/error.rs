//! The crate-wide error type and the narrower per-layer error types that
//! convert into it at the storage and transport boundaries.

use crate::PieceIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the dispatcher and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned from `AddPeer` when the peer id is already registered.
    #[error("peer already dispatched")]
    PeerAlreadyDispatched,

    /// A piece index referenced by a message is outside `[0, NumPieces)`.
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),

    /// A `PIECE_REQUEST` or `PIECE_PAYLOAD` used a non-zero offset or a
    /// length other than the full piece length (chunked transfer is a
    /// non-goal of this crate).
    #[error("chunked transfer is not supported")]
    ChunkedTransferUnsupported,

    /// A `BITFIELD` message arrived outside of the transport's initial
    /// availability exchange.
    #[error("unexpected bitfield message")]
    UnexpectedBitfield,

    /// `dispatch` was handed a message type it doesn't know how to route.
    #[error("unknown message type")]
    UnknownMessage,

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    NewTorrent(#[from] NewTorrentError),

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors specific to writing a piece to disk.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("invalid piece index")]
    InvalidPieceIndex,

    /// Benign: the piece was already written by a previous call. The
    /// dispatcher treats this as a successful no-op rather than a failure.
    #[error("piece already complete")]
    PieceAlreadyComplete,

    #[error("piece data does not match its expected hash")]
    HashMismatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors specific to reading a piece from disk.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error("piece not yet available")]
    PieceNotAvailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur when allocating a new torrent's on-disk layout.
#[derive(Debug, thiserror::Error)]
pub enum NewTorrentError {
    #[error("download path already exists")]
    AlreadyExists,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
