//! This module defines types used to configure the dispatcher and its
//! ambient storage/transport implementations.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default client id this crate announces to peers.
pub const CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration handed to a [`crate::Dispatcher`] and the
/// storage it is paired with.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub dispatch: DispatchConf,
    pub storage: StorageConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// Uses the default client id, [`CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CLIENT_ID,
            },
            dispatch: DispatchConf::default(),
            storage: StorageConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to peers.
    pub client_id: PeerId,
}

/// Configuration for a single torrent's [`crate::Dispatcher`].
#[derive(Clone)]
pub struct DispatchConf {
    /// Max concurrent `Pending` ledger entries per peer.
    pub pipeline_limit: usize,

    /// Remaining-pieces count at or below which endgame mode enables.
    pub endgame_threshold: usize,

    /// Force-disable endgame mode regardless of `endgame_threshold`.
    pub disable_endgame: bool,

    /// Function of a torrent's max piece length giving the per-request
    /// timeout, applied once at dispatcher construction.
    pub piece_request_timeout: fn(u32) -> Duration,
}

impl std::fmt::Debug for DispatchConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchConf")
            .field("pipeline_limit", &self.pipeline_limit)
            .field("endgame_threshold", &self.endgame_threshold)
            .field("disable_endgame", &self.disable_endgame)
            .field("piece_request_timeout", &"<fn>")
            .finish()
    }
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self {
            // Picked to saturate a typical peer connection without building
            // up an unbounded queue of outstanding requests.
            pipeline_limit: 4,
            // A handful of missing pieces is "nearly done"; duplicate
            // requests become worth their bandwidth cost at that point.
            endgame_threshold: 20,
            disable_endgame: false,
            piece_request_timeout: default_piece_request_timeout,
        }
    }
}

/// The default piece-request timeout policy: scales with the piece size so
/// that larger pieces, which naturally take longer to transfer, aren't
/// spuriously timed out.
///
/// Assumes a conservative minimum throughput of 10 KiB/s per peer, with a
/// floor of 10 seconds so that small pieces over a fast link still leave
/// enough headroom for a round trip.
pub fn default_piece_request_timeout(max_piece_len: u32) -> Duration {
    const MIN_THROUGHPUT_BYTES_PER_SEC: u32 = 10 * 1024;
    let estimated_secs = max_piece_len / MIN_THROUGHPUT_BYTES_PER_SEC;
    Duration::from_secs(estimated_secs.max(10) as u64)
}

/// Configuration for the reference disk-backed [`crate::storage::Storage`]
/// implementation.
#[derive(Clone, Debug)]
pub struct StorageConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The number of whole pieces kept in the read cache.
    pub read_cache_capacity: usize,
}

impl StorageConf {
    /// Returns a storage configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            read_cache_capacity: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_grows_with_piece_length() {
        let small = default_piece_request_timeout(16 * 1024);
        let large = default_piece_request_timeout(16 * 1024 * 1024);
        assert!(large > small);
    }

    #[test]
    fn timeout_has_a_floor() {
        assert_eq!(default_piece_request_timeout(1), Duration::from_secs(10));
    }
}
