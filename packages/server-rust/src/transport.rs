//! Peer connection fan-out (spec §4.2 "Queue"), realized as one outbound
//! channel pair per node feeding a framed writer task, rather than a
//! single-threaded fd-readiness loop.
//!
//! This node's own loopback link is just another entry: the daemon
//! attaches itself at startup over an in-memory duplex stream, so a
//! locally originated call is routed through exactly the same path as a
//! call arriving from a peer (spec §4.1 "the client/daemon socket uses the
//! same framing").

use std::pin::Pin;
use std::task::{Context, Poll};

use ctdb_core::node::Pnn;
use ctdb_core::wire::{CtdbCodec, Frame};
use ctdb_core::CtdbError;
use dashmap::DashMap;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// One outbound link to a peer: an unbounded sender for call/control
/// traffic (spec §4.2 "never dropped") and a bounded sender for message
/// traffic (dropped along with the connection once full).
struct PeerLink {
    unbounded: mpsc::UnboundedSender<Frame>,
    bounded: mpsc::Sender<Frame>,
}

pub struct PeerLinks {
    links: DashMap<Pnn, PeerLink>,
    max_queue_depth_drop_msg: usize,
}

impl PeerLinks {
    #[must_use]
    pub fn new(max_queue_depth_drop_msg: usize) -> Self {
        Self { links: DashMap::new(), max_queue_depth_drop_msg }
    }

    /// Establishes (or replaces) the outbound link to `pnn` over any
    /// duplex byte stream, spawning a writer task that drains both
    /// channels into the framed sink.
    pub fn attach<S>(&self, pnn: Pnn, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (unbounded_tx, mut unbounded_rx) = mpsc::unbounded_channel::<Frame>();
        let (bounded_tx, mut bounded_rx) = mpsc::channel::<Frame>(self.max_queue_depth_drop_msg);
        self.links.insert(pnn, PeerLink { unbounded: unbounded_tx, bounded: bounded_tx });

        tokio::spawn(async move {
            let mut framed = Framed::new(stream, CtdbCodec);
            loop {
                tokio::select! {
                    biased;
                    frame = unbounded_rx.recv() => {
                        match frame {
                            Some(frame) if framed.send(frame).await.is_ok() => {}
                            _ => break,
                        }
                    }
                    frame = bounded_rx.recv() => {
                        match frame {
                            Some(frame) if framed.send(frame).await.is_ok() => {}
                            _ => break,
                        }
                    }
                }
            }
            tracing::debug!(pnn, "peer link writer task exiting");
        });
    }

    pub fn detach(&self, pnn: Pnn) {
        self.links.remove(&pnn);
    }

    #[must_use]
    pub fn is_attached(&self, pnn: Pnn) -> bool {
        self.links.contains_key(&pnn)
    }

    /// Enqueues call/control traffic; this never fails due to
    /// backpressure, only because no link to `pnn` exists yet.
    pub fn send_priority(&self, pnn: Pnn, frame: Frame) -> Result<(), CtdbError> {
        let link = self
            .links
            .get(&pnn)
            .ok_or_else(|| CtdbError::Transient(format!("no link to node {pnn}")))?;
        link.unbounded
            .send(frame)
            .map_err(|_| CtdbError::Transient(format!("peer {pnn} link closed")))
    }

    /// Enqueues message traffic; returns an error (the caller should tear
    /// the connection down) once the bounded queue is at capacity (spec
    /// §4.2's `max_queue_depth_drop_msg`).
    pub fn send_message(&self, pnn: Pnn, frame: Frame) -> Result<(), CtdbError> {
        let link = self
            .links
            .get(&pnn)
            .ok_or_else(|| CtdbError::Transient(format!("no link to node {pnn}")))?;
        link.bounded
            .try_send(frame)
            .map_err(|_| CtdbError::ResourceExhaustion(format!("message queue to node {pnn} full")))
    }
}

/// Wraps the write half of a split real peer socket so it satisfies
/// [`PeerLinks::attach`]'s `AsyncRead + AsyncWrite` bound. Inbound traffic on
/// a real peer connection is read separately off the other half and
/// dispatched directly; nothing ever polls read through this adapter, so its
/// `AsyncRead` impl is an immediate no-op EOF.
pub struct WriteOnly<W>(pub W);

impl<W: AsyncWrite + Unpin> AsyncWrite for WriteOnly<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl<W: Unpin> AsyncRead for WriteOnly<W> {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ctdb_core::wire::{Opcode, PacketHeader};

    use super::*;

    #[tokio::test]
    async fn send_priority_without_a_link_is_transient() {
        let links = PeerLinks::new(10);
        let header = PacketHeader::new(Opcode::ReqControl, 1, 0, 0, 1);
        let err = links.send_priority(0, Frame::new(header, Bytes::new())).unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn attach_then_send_delivers_over_loopback() {
        let links = PeerLinks::new(10);
        let (a, b) = tokio::io::duplex(4096);
        links.attach(7, a);
        let mut reader = Framed::new(b, CtdbCodec);

        let header = PacketHeader::new(Opcode::ReqControl, 1, 0, 0, 42);
        links.send_priority(7, Frame::new(header, Bytes::from_static(b"hi"))).unwrap();

        use futures_util::StreamExt;
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.header.reqid, 42);
    }
}
