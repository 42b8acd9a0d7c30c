use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures::{
    stream::{self, SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::codec::{Framed, FramedParts};

use super::{
    codec::{Handshake, HandshakeCodec, Message, MessageCodec},
    MessageStream, Transport, TransportError,
};
use crate::{latch::Latch, Bitfield, PeerId, Sha1Hash};

type SendHalf = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type RecvHalf = SplitStream<Framed<TcpStream, MessageCodec>>;

/// A `Transport` backed by a live TCP connection, speaking the handshake and
/// then the length-prefixed message codec.
pub struct TcpTransport {
    addr: SocketAddr,
    sink: Mutex<SendHalf>,
    shutdown: Arc<Latch>,
}

impl TcpTransport {
    /// Dials `addr` and performs the outbound side of the handshake.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
    ) -> Result<(Arc<Self>, MessageStream, Bitfield), TransportError> {
        let socket = TcpStream::connect(addr).await?;
        Self::handshake(socket, addr, info_hash, client_id, true).await
    }

    /// Performs the inbound side of the handshake over an already-accepted
    /// socket.
    pub async fn accept(
        socket: TcpStream,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
    ) -> Result<(Arc<Self>, MessageStream, Bitfield), TransportError> {
        Self::handshake(socket, addr, info_hash, client_id, false).await
    }

    async fn handshake(
        socket: TcpStream,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        is_outbound: bool,
    ) -> Result<(Arc<Self>, MessageStream, Bitfield), TransportError> {
        let mut framed = Framed::new(socket, HandshakeCodec);

        if is_outbound {
            log::debug!("sending handshake to {}", addr);
            framed.send(Handshake::new(info_hash, client_id)).await?;
        }

        let peer_handshake =
            framed.next().await.ok_or(TransportError::Closed)??;
        log::debug!("received handshake from {}: {:?}", addr, peer_handshake);
        if peer_handshake.info_hash != info_hash {
            log::warn!("peer {} advertised a mismatched info hash", addr);
            return Err(TransportError::InfoHashMismatch);
        }

        if !is_outbound {
            framed.send(Handshake::new(info_hash, client_id)).await?;
        }

        // switch to the message codec, carrying over any bytes the peer
        // already sent past the handshake
        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let framed = Framed::from_parts(new_parts);

        let (sink, mut stream) = framed.split();

        // the initial bitfield exchange is the transport's responsibility;
        // the dispatcher never sees a bare BITFIELD message
        let bitfield = match stream.next().await {
            Some(Ok(Message::Bitfield(bits))) => bits,
            Some(Ok(_)) => return Err(TransportError::ExpectedBitfield),
            Some(Err(e)) => return Err(e),
            None => return Err(TransportError::Closed),
        };

        let shutdown = Arc::new(Latch::new());
        let transport = Arc::new(Self {
            addr,
            sink: Mutex::new(sink),
            shutdown: Arc::clone(&shutdown),
        });
        let receiver: MessageStream =
            Self::cancellable_receiver(stream, shutdown);
        Ok((transport, receiver, bitfield))
    }

    /// Wraps the receive half so that closing `shutdown` unblocks it
    /// immediately, independent of whether the remote peer ever closes its
    /// write side. A plain `sink.close()` only half-closes the shared
    /// socket; a task parked in `stream.next()` would otherwise keep
    /// blocking until the peer reciprocates, which may never happen.
    fn cancellable_receiver(
        stream: RecvHalf,
        shutdown: Arc<Latch>,
    ) -> MessageStream {
        Box::pin(stream::unfold(
            (stream, shutdown),
            |(mut stream, shutdown)| async move {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => None,
                    item = stream.next() => item.map(|item| (item, (stream, shutdown))),
                }
            },
        ))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(msg).await
    }

    async fn close(&self) {
        self.shutdown.close();
        let mut sink = self.sink.lock().await;
        // errors here just mean the peer already closed their half
        let _ = sink.close().await;
        log::debug!("closed connection to {}", self.addr);
    }
}
