//! The per-peer connection: handshake, wire codec, and the `Transport`
//! contract the dispatcher drives.

pub mod codec;
mod tcp;

pub use codec::{ErrorCode, Handshake, Message};
pub use tcp::TcpTransport;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

/// A lazy, close-terminated sequence of inbound messages.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<Message, TransportError>> + Send>>;

/// The send/close half of a peer connection. `Receiver()` is represented
/// out-of-band as a [`MessageStream`] handed to the caller once, since only
/// one task (the dispatcher's feed loop) ever drains it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a message to the peer. May fail if the connection is closed or
    /// the underlying socket errors.
    async fn send(&self, msg: Message) -> Result<(), TransportError>;

    /// Idempotently closes the connection, unblocking any in-flight `send`
    /// and causing the paired [`MessageStream`] to terminate.
    async fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("handshake protocol string has the wrong length")]
    IncorrectProtocol,

    #[error("peer's advertised info hash does not match ours")]
    InfoHashMismatch,

    #[error("expected a bitfield message directly after the handshake")]
    ExpectedBitfield,

    #[error("invalid message id {0}")]
    InvalidMessageId(u8),

    #[error("invalid message length {0}")]
    InvalidMessageLen(usize),

    #[error("keep-alive messages are not part of this wire protocol")]
    UnexpectedKeepAlive,

    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
