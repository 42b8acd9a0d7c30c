//! The disk-backed piece store the dispatcher reads from and writes to.

mod disk;
mod watcher;

pub use disk::DiskStorage;
pub use watcher::TorrentAccessWatcher;

use async_trait::async_trait;

use crate::{
    error::{ReadError, WriteError},
    Bitfield, PieceIndex, Sha1Hash,
};

/// Disk IO statistics, exposed via [`Storage::stat`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub read_count: u64,
    pub write_count: u64,
    pub write_failure_count: u64,
}

/// The outcome of a successful [`Storage::write_piece`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The piece was validated and committed to disk.
    Written,
    /// The piece had already been written by a previous call; this call was
    /// a benign no-op. This is the race-resolution mechanism the dispatcher
    /// relies on during endgame.
    AlreadyComplete,
}

/// The storage contract the dispatcher is built against. A disk-backed
/// implementation, [`DiskStorage`], is provided so the crate is runnable and
/// testable standalone, but the dispatcher only ever depends on this trait.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;
    fn info_hash(&self) -> Sha1Hash;
    fn len(&self) -> u64;
    fn piece_count(&self) -> usize;
    fn piece_len(&self, index: PieceIndex) -> Result<u32, ReadError>;
    fn max_piece_len(&self) -> u32;

    /// Returns a read snapshot of the local bitfield.
    async fn bitfield(&self) -> Bitfield;

    /// Whether every piece has been downloaded and verified.
    async fn is_complete(&self) -> bool;

    fn stat(&self) -> Stats;

    /// Reads the whole piece at `index`, serving from the read cache when
    /// possible.
    async fn read_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Vec<u8>, ReadError>;

    /// Validates and writes a whole piece. Returns
    /// [`WriteOutcome::AlreadyComplete`], not an error, if the piece had
    /// already been committed.
    async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<WriteOutcome, WriteError>;
}
