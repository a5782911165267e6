use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::{AsyncRead, AsyncWrite, SinkExt, StreamExt};
use libp2p::multiaddr::Protocol;
use plexus_net_primitives::{Multiaddr, ParsedAddr, TransportKind, socket_addr_to_multiaddr};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::listener::ACCEPT_BACKLOG;
use crate::tcp::{accept_loop, bind, connect};
use crate::{ByteStream, Inbound, Listener, Transport, TransportError};

#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    fn parse(addr: &Multiaddr) -> Option<ParsedAddr> {
        ParsedAddr::parse(addr)
            .ok()
            .filter(|parsed| parsed.kind == TransportKind::WebSocket)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        Self::parse(addr).is_some()
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        Self::parse(addr).is_some_and(|parsed| parsed.socket_addr().is_some())
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<ByteStream, TransportError> {
        let parsed = Self::parse(addr).ok_or_else(|| TransportError::AddressUnsupported(addr.clone()))?;
        let ws = connect_ws(addr, &parsed).await?;
        Ok(Box::new(WsStream::new(ws)))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let bind_addr = Self::parse(addr)
            .and_then(|parsed| parsed.socket_addr())
            .ok_or_else(|| TransportError::AddressUnsupported(addr.clone()))?;
        let (listener, local_addr) = bind(bind_addr).await?;

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(listener, shutdown.clone(), move |stream, remote| {
            let tx = tx.clone();
            async move {
                if tx.is_closed() {
                    return false;
                }
                // Handshake per socket so a slow client cannot stall the accept loop.
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => {
                            let inbound = Inbound {
                                stream: Box::new(WsStream::new(ws)),
                                remote_addr: socket_addr_to_multiaddr(remote)
                                    .with(Protocol::Ws("/".into())),
                            };
                            let _ = tx.send(inbound).await;
                        }
                        Err(e) => debug!(%remote, error = %e, "websocket handshake failed"),
                    }
                });
                true
            }
        }));

        let local_addr = socket_addr_to_multiaddr(local_addr).with(Protocol::Ws("/".into()));
        debug!(%local_addr, "websocket listener started");
        Ok(Listener::new(local_addr, rx, shutdown))
    }
}

/// Dials the TCP part of `parsed` and runs the WebSocket client handshake.
pub(crate) async fn connect_ws(
    addr: &Multiaddr,
    parsed: &ParsedAddr,
) -> Result<WebSocketStream<TcpStream>, TransportError> {
    let stream = connect(addr, parsed).await?;
    let (ws, _response) = tokio_tungstenite::client_async(parsed.ws_url(), stream)
        .await
        .map_err(|e| TransportError::unreachable(addr, into_io_error(e)))?;
    trace!(%addr, "websocket connected");
    Ok(ws)
}

/// Byte stream over WebSocket binary frames.
///
/// Each write becomes one binary frame. Text, ping and pong frames are skipped
/// on read; a close frame reads as end of stream.
pub struct WsStream {
    inner: WebSocketStream<TcpStream>,
    read_buf: Bytes,
    read_eof: bool,
}

impl WsStream {
    pub fn new(inner: WebSocketStream<TcpStream>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            read_eof: false,
        }
    }
}

impl std::fmt::Debug for WsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsStream")
            .field("buffered", &self.read_buf.len())
            .field("read_eof", &self.read_eof)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = buf.len().min(this.read_buf.len());
                this.read_buf.copy_to_slice(&mut buf[..n]);
                return Poll::Ready(Ok(n));
            }
            if this.read_eof {
                return Poll::Ready(Ok(0));
            }

            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = Bytes::from(data),
                Some(Ok(Message::Close(_))) | None => this.read_eof = true,
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    this.read_eof = true;
                }
                Some(Err(e)) => return Poll::Ready(Err(into_io_error(e))),
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.inner.poll_ready_unpin(cx)).map_err(into_io_error)?;
        this.inner
            .start_send_unpin(Message::binary(buf.to_vec()))
            .map_err(into_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .inner
            .poll_flush_unpin(cx)
            .map_err(into_io_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.get_mut().inner.poll_close_unpin(cx)) {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(into_io_error(e))),
        }
    }
}

pub(crate) fn into_io_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::ErrorKind::BrokenPipe.into()
        }
        other => io::Error::other(other),
    }
}
