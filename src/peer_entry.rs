//! Per-peer state the dispatcher keeps in its registry.

use std::{
    sync::Mutex,
    time::Instant,
};

use tokio::sync::RwLock;

use crate::{transport::Transport, Bitfield, PeerId};

/// A registered peer: its claimed bitfield, a handle to send it messages,
/// and a couple of activity timestamps used only for observability.
///
/// The bitfield's sole writer is the peer's own feed loop; other feeds only
/// ever take a read snapshot (a clone) before intersecting against it.
pub struct PeerEntry {
    pub id: PeerId,
    bitfield: RwLock<Bitfield>,
    transport: std::sync::Arc<dyn Transport>,
    activity: Mutex<Activity>,
}

#[derive(Default)]
struct Activity {
    last_good_piece_received: Option<Instant>,
    last_piece_sent: Option<Instant>,
}

impl PeerEntry {
    pub fn new(
        id: PeerId,
        bitfield: Bitfield,
        transport: std::sync::Arc<dyn Transport>,
    ) -> Self {
        Self {
            id,
            bitfield: RwLock::new(bitfield),
            transport,
            activity: Mutex::new(Activity::default()),
        }
    }

    pub fn transport(&self) -> &std::sync::Arc<dyn Transport> {
        &self.transport
    }

    /// A read snapshot of the peer's claimed bitfield.
    pub async fn bitfield(&self) -> Bitfield {
        self.bitfield.read().await.clone()
    }

    pub async fn set_piece(&self, index: usize) {
        self.bitfield.write().await.set(index, true);
    }

    pub async fn set_all(&self, value: bool) {
        let mut bitfield = self.bitfield.write().await;
        bitfield.fill(value);
    }

    pub async fn has_piece(&self, index: usize) -> bool {
        self.bitfield.read().await[index]
    }

    pub async fn is_complete(&self) -> bool {
        self.bitfield.read().await.all()
    }

    pub fn stamp_good_piece_received(&self) {
        self.activity.lock().unwrap().last_good_piece_received =
            Some(Instant::now());
    }

    pub fn stamp_piece_sent(&self) {
        self.activity.lock().unwrap().last_piece_sent = Some(Instant::now());
    }

    pub fn last_good_piece_received(&self) -> Option<Instant> {
        self.activity.lock().unwrap().last_good_piece_received
    }

    pub fn last_piece_sent(&self) -> Option<Instant> {
        self.activity.lock().unwrap().last_piece_sent
    }
}
