//! In-process rendezvous broker.
//!
//! Speaks the broker side of `plexus_net_transport::rendezvous::proto`:
//! registered peers keep a control socket open and hear about each other;
//! a dial socket is parked until the target opens a matching accept socket,
//! then the two are spliced frame by frame.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use plexus_net_primitives::{Multiaddr, PeerId, TransportKind, socket_addr_to_multiaddr};
use plexus_net_transport::rendezvous::proto::{self, BrokerMessage, ClientMessage, SessionId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Socket = WebSocketStream<TcpStream>;

/// How long a parked dial waits for the target's accept socket.
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    peers: DashMap<PeerId, mpsc::UnboundedSender<BrokerMessage>>,
    sessions: DashMap<SessionId, oneshot::Sender<Socket>>,
    next_session: AtomicU64,
}

impl State {
    fn broadcast(&self, except: &PeerId, msg: &BrokerMessage) {
        for entry in self.peers.iter().filter(|e| e.key() != except) {
            let _ = entry.value().send(msg.clone());
        }
    }
}

/// A running broker. Stops when dropped.
pub struct RendezvousServer {
    local_addr: SocketAddr,
    state: Arc<State>,
    shutdown: CancellationToken,
}

impl RendezvousServer {
    /// Binds a broker on an ephemeral loopback port.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(State::default());
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));
        debug!(%local_addr, "rendezvous broker started");
        Ok(Self {
            local_addr,
            state,
            shutdown,
        })
    }

    /// The broker's listen address for `kind`, e.g.
    /// `/ip4/127.0.0.1/tcp/<port>/ws/p2p-websocket-star`.
    ///
    /// Panics if `kind` is not brokered.
    pub fn addr(&self, kind: TransportKind) -> Multiaddr {
        let Some(segment) = kind.broker_protocol() else {
            panic!("{kind} is not a brokered transport");
        };
        socket_addr_to_multiaddr(self.local_addr)
            .with(Protocol::Ws("/".into()))
            .with(segment)
    }

    /// Peers with a registered control socket.
    pub fn registered(&self) -> Vec<PeerId> {
        self.state.peers.iter().map(|e| *e.key()).collect()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let Ok((tcp, remote)) = accepted else {
            continue;
        };
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(tcp).await {
                Ok(ws) => handle_socket(ws, state, shutdown).await,
                Err(e) => debug!(%remote, error = %e, "broker websocket handshake failed"),
            }
        });
    }
}

async fn handle_socket(mut ws: Socket, state: Arc<State>, shutdown: CancellationToken) {
    match proto::recv::<_, ClientMessage>(&mut ws).await {
        Ok(Some(ClientMessage::Register { peer })) => control(ws, peer, state, shutdown).await,
        Ok(Some(ClientMessage::Dial { from, to })) => dial(ws, from, to, state, shutdown).await,
        Ok(Some(ClientMessage::Accept { session })) => match state.sessions.remove(&session) {
            Some((_, parked)) => {
                let _ = parked.send(ws);
            }
            None => trace!(session, "accept for unknown session"),
        },
        Ok(None) => {}
        Err(e) => debug!(error = %e, "broker failed to read first message"),
    }
}

async fn control(mut ws: Socket, peer: PeerId, state: Arc<State>, shutdown: CancellationToken) {
    // Registered before the reply goes out, so a dial right after `listen` finds the peer.
    let (tx, mut rx) = mpsc::unbounded_channel();
    for existing in state.peers.iter() {
        let _ = tx.send(BrokerMessage::PeerJoined {
            peer: *existing.key(),
        });
    }
    state.broadcast(&peer, &BrokerMessage::PeerJoined { peer });
    state.peers.insert(peer, tx);
    debug!(peer_id = %peer, "peer registered with broker");

    if proto::send(&mut ws, &BrokerMessage::Registered).await.is_err() {
        state.peers.remove(&peer);
        return;
    }

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if proto::send(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = proto::recv::<_, ClientMessage>(&mut stream) => match incoming {
                Ok(Some(other)) => trace!(peer_id = %peer, ?other, "ignoring message on control socket"),
                Ok(None) | Err(_) => break,
            },
        }
    }

    state.peers.remove(&peer);
    state.broadcast(&peer, &BrokerMessage::PeerLeft { peer });
    debug!(peer_id = %peer, "peer left broker");
}

async fn dial(mut ws: Socket, from: PeerId, to: PeerId, state: Arc<State>, shutdown: CancellationToken) {
    let Some(target) = state.peers.get(&to).map(|e| e.value().clone()) else {
        let reason = format!("peer {to} is not registered");
        let _ = proto::send(&mut ws, &BrokerMessage::DialFailed { reason }).await;
        return;
    };

    let session = state.next_session.fetch_add(1, Ordering::Relaxed);
    let (parked_tx, parked_rx) = oneshot::channel();
    state.sessions.insert(session, parked_tx);
    let _ = target.send(BrokerMessage::Incoming { session, from });

    let accepted = tokio::time::timeout(SESSION_TIMEOUT, parked_rx).await;
    let Ok(Ok(mut other)) = accepted else {
        state.sessions.remove(&session);
        let reason = format!("peer {to} did not accept");
        let _ = proto::send(&mut ws, &BrokerMessage::DialFailed { reason }).await;
        return;
    };

    if proto::send(&mut other, &BrokerMessage::Connected).await.is_err()
        || proto::send(&mut ws, &BrokerMessage::Connected).await.is_err()
    {
        return;
    }
    trace!(session, %from, %to, "brokered session spliced");

    let (a_sink, a_stream) = ws.split();
    let (b_sink, b_stream) = other.split();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = futures::future::join(a_stream.forward(b_sink), b_stream.forward(a_sink)) => {}
    }
    trace!(session, "brokered session ended");
}
