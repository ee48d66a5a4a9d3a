//! Abstract split transport for plexus sessions.
//!
//! A connection is split once into a reader half, owned by the inbound
//! pump, and a writer half, owned by the outbound pump. Futures are boxed
//! and `Send` so each half can move into its own task.

use crate::codec::Frame;
use crate::error::{PlexusError, PlexusResult};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reading half of a connection.
pub trait FrameReader: Send {
    /// Read the next frame. `Ok(None)` means the peer closed cleanly.
    fn recv_frame(&mut self) -> BoxFuture<'_, PlexusResult<Option<Frame>>>;
}

/// Writing half of a connection.
pub trait FrameWriter: Send {
    /// Write one frame.
    fn send_frame(&mut self, frame: Frame) -> BoxFuture<'_, PlexusResult<()>>;

    /// Close the connection. Safe to call more than once.
    fn close(&mut self) -> BoxFuture<'_, PlexusResult<()>>;
}

/// A message-framed bidirectional connection.
pub trait Transport: Send + 'static {
    type Reader: FrameReader + 'static;
    type Writer: FrameWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// What the remote end pushed toward the server.
#[derive(Debug)]
enum Incoming {
    Frame(Frame),
    Error(String),
}

/// Channel-backed transport, the server side of an in-process connection.
pub struct MemoryTransport {
    incoming: mpsc::Receiver<Incoming>,
    outgoing: mpsc::Sender<Frame>,
}

/// The client side of a [`MemoryTransport`].
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<Incoming>>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryTransport {
    /// Create a connected transport/peer pair with `capacity` frames of
    /// buffering in each direction.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        (
            MemoryTransport {
                incoming: in_rx,
                outgoing: out_tx,
            },
            MemoryPeer {
                tx: Some(in_tx),
                rx: out_rx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (MemoryReader, MemoryWriter) {
        (
            MemoryReader { rx: self.incoming },
            MemoryWriter {
                tx: Some(self.outgoing),
            },
        )
    }
}

pub struct MemoryReader {
    rx: mpsc::Receiver<Incoming>,
}

impl FrameReader for MemoryReader {
    fn recv_frame(&mut self) -> BoxFuture<'_, PlexusResult<Option<Frame>>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Incoming::Frame(frame)) => Ok(Some(frame)),
                Some(Incoming::Error(reason)) => Err(PlexusError::TransportRead(reason)),
                None => Ok(None),
            }
        })
    }
}

pub struct MemoryWriter {
    tx: Option<mpsc::Sender<Frame>>,
}

impl FrameWriter for MemoryWriter {
    fn send_frame(&mut self, frame: Frame) -> BoxFuture<'_, PlexusResult<()>> {
        Box::pin(async move {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| PlexusError::TransportWrite("connection closed".into()))?;
            tx.send(frame)
                .await
                .map_err(|_| PlexusError::TransportWrite("peer went away".into()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, PlexusResult<()>> {
        Box::pin(async move {
            self.tx = None;
            Ok(())
        })
    }
}

impl MemoryPeer {
    /// Send a frame to the server.
    pub async fn send(&self, frame: Frame) -> PlexusResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PlexusError::TransportWrite("peer closed".into()))?;
        tx.send(Incoming::Frame(frame))
            .await
            .map_err(|_| PlexusError::TransportWrite("server side dropped".into()))
    }

    /// Make the server's next read fail with a transport error.
    pub async fn fail(&self, reason: impl Into<String>) -> PlexusResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PlexusError::TransportWrite("peer closed".into()))?;
        tx.send(Incoming::Error(reason.into()))
            .await
            .map_err(|_| PlexusError::TransportWrite("server side dropped".into()))
    }

    /// Receive the next frame written by the server; `None` once the
    /// server closed its writer.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Close the client side; the server reads a clean end of stream once
    /// buffered frames are drained.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (transport, mut peer) = MemoryTransport::pair(4);
        let (mut reader, mut writer) = transport.split();

        peer.send(Frame::Text("up".into())).await.unwrap();
        assert_eq!(
            reader.recv_frame().await.unwrap(),
            Some(Frame::Text("up".into()))
        );

        writer.send_frame(Frame::Text("down".into())).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Text("down".into())));
    }

    #[tokio::test]
    async fn peer_close_is_clean_eof() {
        let (transport, mut peer) = MemoryTransport::pair(4);
        let (mut reader, _writer) = transport.split();
        peer.send(Frame::Text("last".into())).await.unwrap();
        peer.close();
        assert!(reader.recv_frame().await.unwrap().is_some());
        assert!(reader.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn peer_fail_is_read_error() {
        let (transport, peer) = MemoryTransport::pair(4);
        let (mut reader, _writer) = transport.split();
        peer.fail("reset").await.unwrap();
        let err = reader.recv_frame().await.unwrap_err();
        assert!(matches!(err, PlexusError::TransportRead(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn writer_close_ends_peer_stream() {
        let (transport, mut peer) = MemoryTransport::pair(4);
        let (_reader, mut writer) = transport.split();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(peer.recv().await.is_none());
        assert!(writer.send_frame(Frame::Text("late".into())).await.is_err());
    }
}
