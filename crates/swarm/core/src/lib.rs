//! Multi-transport connection swarm.
//!
//! The swarm dials peers over whichever of its transports can reach them,
//! upgrades the raw streams into authenticated multiplexed connections and
//! keeps at most one live connection per peer, whichever end dialed first.
//! Inbound connections take the same path. Every new connection runs the
//! identify exchange in the background and the results land in the
//! [`PeerBook`].

mod builder;
mod config;
mod error;
mod events;
mod handler;
mod metrics;
mod swarm;
mod target;

pub use builder::SwarmBuilder;
pub use config::{ConfigError, DEFAULT_DIAL_TIMEOUT, DEFAULT_PROTOCOL_VERSION, SwarmConfig};
pub use error::{DialError, ErrorCategory, ListenError};
pub use events::SwarmEvent;
pub use handler::StreamHandler;
pub use swarm::Swarm;
pub use target::DialTarget;

pub use plexus_net_identify::PROTOCOL as IDENTIFY_PROTOCOL;
pub use plexus_net_peers::{PeerBook, PeerRecord};
pub use plexus_net_primitives::{Multiaddr, PeerId, PeerInfo, TransportKind};
pub use plexus_net_transport::{
    AnyTransport, Discovery, DiscoveryEvent, RendezvousDiscovery, RendezvousTransport,
    TcpTransport, TransportError, WsTransport,
};
pub use plexus_net_upgrade::{Connection, ConnectionId, Endpoint, Stream, UpgradeError};
