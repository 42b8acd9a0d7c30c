//! Process-wide counters the dispatcher maintains. Export is out of scope;
//! this is the in-memory counter surface an exporter would read from.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    /// Raw count of ledger entries reclassified as failed by a sweep.
    piece_request_failures: AtomicU64,
    /// Count of failed entries actually placed with a new peer.
    piece_request_redispatches: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failures(&self, count: u64) {
        self.piece_request_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_redispatch(&self) {
        self.piece_request_redispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn piece_request_failures(&self) -> u64 {
        self.piece_request_failures.load(Ordering::Relaxed)
    }

    pub fn piece_request_redispatches(&self) -> u64 {
        self.piece_request_redispatches.load(Ordering::Relaxed)
    }
}
