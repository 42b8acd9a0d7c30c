//! A thin decorator around a [`Storage`] handle that stamps last-access
//! times, for callers (e.g. a seed/idle sweep) that need to know when a
//! torrent was last touched without the dispatcher itself tracking it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::{Stats, Storage, WriteOutcome};
use crate::{
    error::{ReadError, WriteError},
    Bitfield, PieceIndex, Sha1Hash,
};

fn now_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Wraps a `Storage` implementation, recording the wall-clock time of the
/// last successful read and write. Every other call is a direct delegate.
pub struct TorrentAccessWatcher {
    inner: Arc<dyn Storage>,
    last_read_time: AtomicU64,
    last_write_time: AtomicU64,
    created_at: Instant,
}

impl TorrentAccessWatcher {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            last_read_time: AtomicU64::new(0),
            last_write_time: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Seconds since the Unix epoch of the last successful `read_piece`, or
    /// `None` if no read has completed yet.
    pub fn last_read_time(&self) -> Option<Duration> {
        let secs = self.last_read_time.load(Ordering::Relaxed);
        (secs != 0).then(|| Duration::from_secs(secs))
    }

    /// Seconds since the Unix epoch of the last successful `write_piece`, or
    /// `None` if no write has completed yet.
    pub fn last_write_time(&self) -> Option<Duration> {
        let secs = self.last_write_time.load(Ordering::Relaxed);
        (secs != 0).then(|| Duration::from_secs(secs))
    }

    /// How long since this watcher was constructed, as a cheap idle-age
    /// signal independent of the system clock.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[async_trait]
impl Storage for TorrentAccessWatcher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn info_hash(&self) -> Sha1Hash {
        self.inner.info_hash()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn piece_count(&self) -> usize {
        self.inner.piece_count()
    }

    fn piece_len(&self, index: PieceIndex) -> Result<u32, ReadError> {
        self.inner.piece_len(index)
    }

    fn max_piece_len(&self) -> u32 {
        self.inner.max_piece_len()
    }

    async fn bitfield(&self) -> Bitfield {
        self.inner.bitfield().await
    }

    async fn is_complete(&self) -> bool {
        self.inner.is_complete().await
    }

    fn stat(&self) -> Stats {
        self.inner.stat()
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>, ReadError> {
        let data = self.inner.read_piece(index).await?;
        self.last_read_time
            .store(now_since_epoch().as_secs(), Ordering::Relaxed);
        Ok(data)
    }

    async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<WriteOutcome, WriteError> {
        let outcome = self.inner.write_piece(index, data).await?;
        self.last_write_time
            .store(now_since_epoch().as_secs(), Ordering::Relaxed);
        Ok(outcome)
    }
}
