use futures::stream::BoxStream;
use libp2p::identity::Keypair;
use plexus_net_transport::{AnyTransport, Discovery, DiscoveryEvent, TcpTransport, WsTransport};

use crate::config::{ConfigError, SwarmConfig};
use crate::swarm::Swarm;

/// Assembles a [`Swarm`].
///
/// Transports are consulted in the order they were added. Without any
/// explicit transport the swarm gets TCP and WebSocket.
///
/// ```ignore
/// let swarm = SwarmBuilder::new(keypair)
///     .with_config(SwarmConfig::default().with_listen_addr("/ip4/127.0.0.1/tcp/0"))
///     .build()?;
/// swarm.start().await?;
/// ```
pub struct SwarmBuilder {
    keypair: Keypair,
    config: SwarmConfig,
    transports: Vec<AnyTransport>,
    discoveries: Vec<BoxStream<'static, DiscoveryEvent>>,
}

impl SwarmBuilder {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            config: SwarmConfig::default(),
            transports: Vec::new(),
            discoveries: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: impl Into<AnyTransport>) -> Self {
        self.transports.push(transport.into());
        self
    }

    /// Subscribes to `discovery` now, so no event is missed before
    /// [`Swarm::start`] begins consuming them.
    pub fn with_discovery(mut self, discovery: &impl Discovery) -> Self {
        self.discoveries.push(discovery.events());
        self
    }

    pub fn build(self) -> Result<Swarm, ConfigError> {
        self.config.validate()?;

        let transports = if self.transports.is_empty() {
            vec![TcpTransport::default().into(), WsTransport::default().into()]
        } else {
            self.transports
        };

        Ok(Swarm::new(self.keypair, self.config, transports, self.discoveries))
    }
}

impl std::fmt::Debug for SwarmBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmBuilder")
            .field("peer_id", &self.keypair.public().to_peer_id())
            .field("config", &self.config)
            .field("transports", &self.transports)
            .field("discoveries", &self.discoveries.len())
            .finish()
    }
}
