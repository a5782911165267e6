use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use plexus_net_primitives::{
    Multiaddr, ParsedAddr, TransportKind, advertised_ip, socket_addr_to_multiaddr,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::listener::ACCEPT_BACKLOG;
use crate::{ByteStream, Inbound, Listener, Transport, TransportError};

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    fn parse(addr: &Multiaddr) -> Option<ParsedAddr> {
        ParsedAddr::parse(addr)
            .ok()
            .filter(|parsed| parsed.kind == TransportKind::Tcp)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        Self::parse(addr).is_some()
    }

    fn can_listen(&self, addr: &Multiaddr) -> bool {
        Self::parse(addr).is_some_and(|parsed| parsed.socket_addr().is_some())
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<ByteStream, TransportError> {
        let parsed = Self::parse(addr).ok_or_else(|| TransportError::AddressUnsupported(addr.clone()))?;
        let stream = connect(addr, &parsed).await?;
        Ok(Box::new(stream.compat()))
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
                let inbound = Inbound {
                    stream: Box::new(stream.compat()),
                    remote_addr: socket_addr_to_multiaddr(remote),
                };
                tx.send(inbound).await.is_ok()
            }
        }));

        debug!(%local_addr, "tcp listener started");
        Ok(Listener::new(socket_addr_to_multiaddr(local_addr), rx, shutdown))
    }
}

/// Opens a TCP socket to the host and port of `parsed`, with `TCP_NODELAY` set.
pub(crate) async fn connect(addr: &Multiaddr, parsed: &ParsedAddr) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(parsed.socket_target())
        .await
        .map_err(|e| TransportError::unreachable(addr, e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::unreachable(addr, e))?;
    trace!(%addr, "tcp connected");
    Ok(stream)
}

/// Binds a listening socket and returns it with the address to advertise.
pub(crate) async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    Ok((listener, SocketAddr::new(advertised_ip(bound.ip()), bound.port())))
}

/// Accepts sockets until cancelled or until `on_accept` reports that nobody is
/// collecting streams any more.
pub(crate) async fn accept_loop<F, Fut>(listener: TcpListener, shutdown: CancellationToken, on_accept: F)
where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%remote, error = ?e, "failed to set TCP_NODELAY");
                }
                trace!(%remote, "accepted tcp socket");
                if !on_accept(stream, remote).await {
                    break;
                }
            }
            Err(e) => {
                warn!(error = ?e, "tcp accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    trace!("tcp accept loop stopped");
}
