//! WebSocket listener and transport using tokio-tungstenite.
//!
//! The listener performs the HTTP upgrade, captures what the request said
//! about the client into a [`ConnectionMeta`], and hands the upgraded stream
//! to the server as a [`WebSocketTransport`].

use crate::handler::ConnectionMeta;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use plexus_core::transport::BoxFuture;
use plexus_core::{Frame, FrameReader, FrameWriter, PlexusError, PlexusResult, Transport};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// An upgraded connection waiting for its handshake with the registry.
pub struct WebSocketConnection {
    pub transport: WebSocketTransport,
    pub meta: ConnectionMeta,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. Upgrade requests outside `path_prefix` get a 404. The
/// accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    path_prefix: String,
) -> PlexusResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| PlexusError::Other(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %path_prefix, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let prefix = path_prefix.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, addr, &prefix).await {
                            Ok(conn) => {
                                debug!(remote = %addr, path = %conn.meta.path, "WebSocket connection accepted");
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    prefix: &str,
) -> PlexusResult<WebSocketConnection> {
    let mut meta = ConnectionMeta::default().with_remote(addr);
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        meta.path = req.uri().path().to_string();
        meta.query = req.uri().query().map(str::to_string);
        meta.headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if path_matches(prefix, &meta.path) {
            Ok(resp)
        } else {
            let mut refused = ErrorResponse::new(Some("not found".to_string()));
            *refused.status_mut() = StatusCode::NOT_FOUND;
            Err(refused)
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, capture)
        .await
        .map_err(|e| PlexusError::ConnectionRejected(format!("upgrade failed: {e}")))?;

    Ok(WebSocketConnection {
        transport: WebSocketTransport::new(ws),
        meta,
    })
}

/// Whether `path` is `prefix` or lies below it.
fn path_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// A WebSocket stream adapted to the split frame transport.
pub struct WebSocketTransport<S = TcpStream> {
    ws: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = WebSocketReader<S>;
    type Writer = WebSocketWriter<S>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.ws.split();
        (
            WebSocketReader { stream },
            WebSocketWriter {
                sink,
                closed: false,
            },
        )
    }
}

pub struct WebSocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> FrameReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Text and binary messages become frames. A close message or end of
    /// stream is a clean close; control frames are skipped.
    fn recv_frame(&mut self) -> BoxFuture<'_, PlexusResult<Option<Frame>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::Binary(data.to_vec()))),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(PlexusError::TransportRead(format!("WS recv failed: {e}")));
                    }
                    None => return Ok(None),
                }
            }
        })
    }
}

pub struct WebSocketWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

impl<S> FrameWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send_frame(&mut self, frame: Frame) -> BoxFuture<'_, PlexusResult<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(PlexusError::TransportWrite("connection closed".into()));
            }
            let msg = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(data) => Message::Binary(data.into()),
            };
            self.sink
                .send(msg)
                .await
                .map_err(|e| PlexusError::TransportWrite(format!("WS send failed: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, PlexusResult<()>> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            self.sink
                .close()
                .await
                .map_err(|e| PlexusError::TransportWrite(format!("WS close failed: {e}")))
        })
    }
}
