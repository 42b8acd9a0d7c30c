//! A one-shot, idempotent "close exactly once, observable by many waiters"
//! signal, used for `pendingPiecesDone` and `completeNotified`.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub struct Latch {
    closed: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Closes the latch. Returns `true` if this call was the one that closed
    /// it, `false` if it was already closed.
    pub fn close(&self) -> bool {
        let was_open = self
            .closed
            .compare_exchange(
                false,
                true,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if was_open {
            self.notify.notify_waiters();
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits until the latch is closed. Returns immediately if it already
    /// is.
    pub async fn wait(&self) {
        if self.is_closed() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
