//! The per-torrent coordination core: piece-request issuing, the timeout
//! sweeper, message dispatch, and completion.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Instant,
};

use tokio::sync::RwLock;

use crate::{
    conf::DispatchConf,
    error::Error,
    latch::Latch,
    metrics::Metrics,
    peer_entry::PeerEntry,
    piece_request_manager::{PieceRequestManager, RequestStatus},
    storage::Storage,
    telemetry::{Event, Telemetry},
    transport::{ErrorCode, Message, MessageStream, Transport},
    Bitfield, Observer, PeerId, PieceIndex,
};

/// Owns the peer registry and piece-request ledger for a single torrent,
/// and runs the feed loops and timeout sweeper that drive it.
pub struct Dispatcher {
    self_weak: Weak<Dispatcher>,
    local_peer_id: PeerId,
    torrent: Arc<dyn Storage>,
    conf: DispatchConf,
    created_at: Instant,
    piece_request_timeout: std::time::Duration,
    ledger: PieceRequestManager,
    registry: RwLock<HashMap<PeerId, Arc<PeerEntry>>>,
    pending_pieces_done: Latch,
    complete_notified: Latch,
    observer: Arc<dyn Observer>,
    telemetry: Telemetry,
    metrics: Metrics,
}

impl Dispatcher {
    /// Constructs the dispatcher, starts its timeout sweeper, and — if the
    /// torrent is already complete on entry — runs the completion routine
    /// immediately.
    pub async fn new(
        conf: DispatchConf,
        local_peer_id: PeerId,
        torrent: Arc<dyn Storage>,
        observer: Arc<dyn Observer>,
        telemetry: Telemetry,
    ) -> Arc<Self> {
        let piece_request_timeout =
            (conf.piece_request_timeout)(torrent.max_piece_len());

        let dispatcher = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            local_peer_id,
            piece_request_timeout,
            ledger: PieceRequestManager::new(
                piece_request_timeout,
                conf.pipeline_limit,
            ),
            torrent,
            conf,
            created_at: Instant::now(),
            registry: RwLock::new(HashMap::new()),
            pending_pieces_done: Latch::new(),
            complete_notified: Latch::new(),
            observer,
            telemetry,
            metrics: Metrics::new(),
        });

        {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run_sweeper().await });
        }

        if dispatcher.torrent.is_complete().await {
            dispatcher.complete().await;
        }

        dispatcher
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("dispatcher outlives its own Arc")
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Registers a new peer and starts its feed loop and initial
    /// piece-request attempt. Fails if `peer_id` is already registered.
    pub async fn add_peer(
        &self,
        peer_id: PeerId,
        remote_bitfield: Bitfield,
        transport: Arc<dyn Transport>,
        messages: MessageStream,
    ) -> Result<(), Error> {
        let entry =
            Arc::new(PeerEntry::new(peer_id, remote_bitfield, transport));

        {
            let mut registry = self.registry.write().await;
            if registry.contains_key(&peer_id) {
                return Err(Error::PeerAlreadyDispatched);
            }
            registry.insert(peer_id, Arc::clone(&entry));
        }

        let dispatcher = self.self_arc();
        {
            let dispatcher = Arc::clone(&dispatcher);
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                dispatcher.maybe_request_more_pieces(&entry).await;
            });
        }
        tokio::spawn(async move {
            dispatcher.run_feed(entry, messages).await;
        });

        Ok(())
    }

    /// Closes the done latch and every peer endpoint. Idempotent.
    pub async fn tear_down(&self) {
        self.pending_pieces_done.close();
        let registry = self.registry.read().await;
        for peer in registry.values() {
            peer.transport().close().await;
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.is_empty()
    }

    fn endgame(&self, local_bitfield: &Bitfield) -> bool {
        if self.conf.disable_endgame {
            return false;
        }
        let remaining =
            self.torrent.piece_count() - local_bitfield.count_ones();
        remaining <= self.conf.endgame_threshold
    }

    async fn maybe_request_more_pieces(&self, peer: &Arc<PeerEntry>) {
        let peer_bitfield = peer.bitfield().await;
        let local_bitfield = self.torrent.bitfield().await;
        let candidates: Vec<PieceIndex> = peer_bitfield
            .iter_ones()
            .filter(|&i| !local_bitfield[i])
            .collect();
        let endgame = self.endgame(&local_bitfield);
        self.request_pieces(peer, candidates, endgame).await;
    }

    /// Reserves `candidates` against the ledger and sends a request for each
    /// reserved index. Stops at the first send failure, marking it `Unsent`.
    /// Returns whether at least one request was sent successfully.
    async fn request_pieces(
        &self,
        peer: &Arc<PeerEntry>,
        candidates: Vec<PieceIndex>,
        endgame: bool,
    ) -> bool {
        let reserved =
            self.ledger.reserve_pieces(peer.id, candidates.into_iter(), endgame);
        let mut sent_any = false;
        for index in reserved {
            let length = match self.torrent.piece_len(index) {
                Ok(length) => length,
                Err(_) => continue,
            };
            let msg = Message::PieceRequest { index, offset: 0, length };
            match peer.transport().send(msg).await {
                Ok(()) => sent_any = true,
                Err(e) => {
                    log::warn!(
                        "failed to send piece request {} to peer: {}",
                        index, e
                    );
                    self.ledger.mark_unsent(peer.id, index);
                    break;
                }
            }
        }
        sent_any
    }

    async fn run_sweeper(self: Arc<Self>) {
        let interval = self.piece_request_timeout / 2;
        loop {
            tokio::select! {
                _ = self.pending_pieces_done.wait() => break,
                _ = tokio::time::sleep(interval) => {
                    self.resend_failed_piece_requests().await;
                }
            }
        }
    }

    async fn resend_failed_piece_requests(&self) {
        let failed = self.ledger.get_failed_requests();
        if failed.is_empty() {
            return;
        }
        self.metrics.record_failures(failed.len() as u64);

        let local_bitfield = self.torrent.bitfield().await;
        let endgame = self.endgame(&local_bitfield);
        let registry = self.registry.read().await;

        for entry in failed {
            if local_bitfield[entry.index] {
                continue;
            }
            let exclude_original = matches!(
                entry.status,
                RequestStatus::Expired | RequestStatus::Invalid
            );
            for (peer_id, peer) in registry.iter() {
                if exclude_original && *peer_id == entry.peer {
                    continue;
                }
                if !peer.has_piece(entry.index).await {
                    continue;
                }
                let placed = self
                    .request_pieces(peer, vec![entry.index], endgame)
                    .await;
                if placed {
                    self.metrics.record_redispatch();
                    break;
                }
            }
        }
    }

    async fn run_feed(
        self: Arc<Self>,
        peer: Arc<PeerEntry>,
        mut messages: MessageStream,
    ) {
        use futures::StreamExt;

        while let Some(result) = messages.next().await {
            match result {
                Ok(msg) => {
                    if let Err(e) = self.dispatch(&peer, msg).await {
                        log::warn!(
                            "error dispatching message from peer: {}",
                            e
                        );
                    }
                }
                Err(e) => {
                    log::debug!("peer connection error: {}", e);
                    break;
                }
            }
        }

        self.registry.write().await.remove(&peer.id);
        self.ledger.clear_peer(peer.id);
    }

    async fn dispatch(
        &self,
        peer: &Arc<PeerEntry>,
        msg: Message,
    ) -> Result<(), Error> {
        match msg {
            Message::Error { code, index, text } => {
                if matches!(code, ErrorCode::PieceRequestFailed) {
                    self.ledger.mark_invalid(peer.id, index);
                } else {
                    log::info!(
                        "peer reported error for piece {}: {:?} ({})",
                        index, code, text
                    );
                }
                Ok(())
            }
            Message::AnnouncePiece { index } => {
                self.handle_announce(peer, index).await
            }
            Message::PieceRequest { index, offset, length } => {
                self.handle_piece_request(peer, index, offset, length).await
            }
            Message::PiecePayload { index, offset, payload } => {
                self.handle_piece_payload(peer, index, offset, payload).await
            }
            Message::CancelPiece { .. } => {
                // inbound message processing is serialised per peer, so a
                // cancel always arrives after the piece has been committed
                Ok(())
            }
            Message::Bitfield(_) => {
                log::error!(
                    "unexpected bitfield message outside the initial \
                     exchange"
                );
                Err(Error::UnexpectedBitfield)
            }
            Message::Complete => self.handle_complete(peer).await,
        }
    }

    async fn handle_announce(
        &self,
        peer: &Arc<PeerEntry>,
        index: PieceIndex,
    ) -> Result<(), Error> {
        if index >= self.torrent.piece_count() {
            return Err(Error::InvalidPieceIndex(index));
        }
        peer.set_piece(index).await;
        self.maybe_request_more_pieces(peer).await;
        Ok(())
    }

    async fn handle_piece_request(
        &self,
        peer: &Arc<PeerEntry>,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), Error> {
        let expected_len = match self.torrent.piece_len(index) {
            Ok(len) => len,
            Err(_) => {
                let _ = peer
                    .transport()
                    .send(Message::Error {
                        code: ErrorCode::PieceRequestFailed,
                        index,
                        text: "invalid piece index".to_owned(),
                    })
                    .await;
                return Ok(());
            }
        };

        if offset != 0 || length != expected_len {
            let _ = peer
                .transport()
                .send(Message::Error {
                    code: ErrorCode::PieceRequestFailed,
                    index,
                    text: "chunked transfer is not supported".to_owned(),
                })
                .await;
            return Ok(());
        }

        let payload = match self.torrent.read_piece(index).await {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("failed to read piece {} from storage: {}", index, e);
                let _ = peer
                    .transport()
                    .send(Message::Error {
                        code: ErrorCode::PieceRequestFailed,
                        index,
                        text: e.to_string(),
                    })
                    .await;
                return Ok(());
            }
        };

        if peer
            .transport()
            .send(Message::PiecePayload { index, offset: 0, payload })
            .await
            .is_ok()
        {
            peer.stamp_piece_sent();
            // optimistic: assume the peer commits the piece we just served
            peer.set_piece(index).await;
        }
        Ok(())
    }

    async fn handle_piece_payload(
        &self,
        peer: &Arc<PeerEntry>,
        index: PieceIndex,
        offset: u32,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let expected_len = match self.torrent.piece_len(index) {
            Ok(len) => len,
            Err(_) => {
                self.ledger.mark_invalid(peer.id, index);
                return Ok(());
            }
        };

        if offset != 0 || payload.len() as u32 != expected_len {
            self.ledger.mark_invalid(peer.id, index);
            return Ok(());
        }

        match self.torrent.write_piece(index, payload).await {
            Ok(crate::storage::WriteOutcome::AlreadyComplete) => {
                // another peer's payload for this piece already won the
                // race; nothing to do
            }
            Ok(crate::storage::WriteOutcome::Written) => {
                self.telemetry.produce(Event::ReceivePiece {
                    info_hash: self.torrent.info_hash(),
                    local_peer: self.local_peer_id,
                    remote_peer: peer.id,
                    index,
                });
                peer.stamp_good_piece_received();
                if self.torrent.is_complete().await {
                    self.complete().await;
                }
                self.ledger.clear(index);
                self.maybe_request_more_pieces(peer).await;
                self.broadcast_announce(index, peer.id).await;
            }
            Err(e) => {
                log::warn!("failed to write piece {}: {}", index, e);
                self.ledger.mark_invalid(peer.id, index);
            }
        }
        Ok(())
    }

    async fn handle_complete(&self, peer: &Arc<PeerEntry>) -> Result<(), Error> {
        if self.torrent.is_complete().await {
            peer.transport().close().await;
        } else {
            peer.set_all(true).await;
            self.maybe_request_more_pieces(peer).await;
        }
        Ok(())
    }

    async fn broadcast_announce(&self, index: PieceIndex, exclude: PeerId) {
        let registry = self.registry.read().await;
        for (peer_id, peer) in registry.iter() {
            if *peer_id == exclude {
                continue;
            }
            // a peer whose feed just terminated may still appear here; a
            // failed send is tolerated and ignored
            let _ = peer.transport().send(Message::AnnouncePiece { index }).await;
        }
    }

    /// Idempotent. Notifies the observer at most once, stops the sweeper,
    /// and tells every peer the torrent is done.
    pub async fn complete(&self) {
        if self.complete_notified.close() {
            let observer = Arc::clone(&self.observer);
            let dispatcher = self.self_arc();
            tokio::spawn(async move {
                observer.dispatcher_complete(dispatcher).await;
            });
        }
        self.pending_pieces_done.close();

        let registry = self.registry.read().await;
        for peer in registry.values() {
            if peer.is_complete().await {
                peer.transport().close().await;
            } else {
                let _ = peer.transport().send(Message::Complete).await;
            }
        }
    }
}
