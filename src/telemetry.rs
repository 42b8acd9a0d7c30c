//! Fire-and-forget event sink. The dispatcher never waits on a send, and a
//! full or dropped receiver is not a dispatcher-level error.

use tokio::sync::mpsc;

use crate::{PeerId, PieceIndex, Sha1Hash};

#[derive(Clone, Debug)]
pub enum Event {
    ReceivePiece {
        info_hash: Sha1Hash,
        local_peer: PeerId,
        remote_peer: PeerId,
        index: PieceIndex,
    },
}

/// A handle to an unbounded channel of telemetry events. Cloning is cheap;
/// every clone shares the same receiver.
#[derive(Clone)]
pub struct Telemetry {
    sender: mpsc::UnboundedSender<Event>,
}

impl Telemetry {
    /// Returns a telemetry handle and the paired receiver end.
    pub fn new_pair() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Emits an event. Never blocks; drops the event silently if nothing is
    /// listening anymore.
    pub fn produce(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_after_receiver_dropped_does_not_panic() {
        let (telemetry, receiver) = Telemetry::new_pair();
        drop(receiver);
        telemetry.produce(Event::ReceivePiece {
            info_hash: [0; 20],
            local_peer: [1; 20],
            remote_peer: [2; 20],
            index: 0,
        });
    }

    #[tokio::test]
    async fn produce_is_observed_by_receiver() {
        let (telemetry, mut receiver) = Telemetry::new_pair();
        telemetry.produce(Event::ReceivePiece {
            info_hash: [0; 20],
            local_peer: [1; 20],
            remote_peer: [2; 20],
            index: 3,
        });
        match receiver.recv().await.unwrap() {
            Event::ReceivePiece { index, .. } => assert_eq!(index, 3),
        }
    }
}
