//! Swarm configuration.

use std::time::Duration;

use plexus_net_primitives::Multiaddr;
use plexus_net_upgrade::UpgradeConfig;
use serde::{Deserialize, Serialize};

/// Default dial timeout per candidate address.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default protocol version advertised through identify.
pub const DEFAULT_PROTOCOL_VERSION: &str = "ipfs/0.1.0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}

/// Swarm configuration.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwarmConfig {
    /// Addresses bound by [`Swarm::start`](crate::Swarm::start).
    #[serde(default)]
    pub listen_addrs: Vec<String>,

    /// Timeout for reaching one candidate address, in milliseconds.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Timeout for the secure handshake plus multiplexer setup.
    #[serde(default = "default_upgrade_timeout_ms")]
    pub upgrade_timeout_ms: u64,

    #[serde(default = "default_stream_open_timeout_ms")]
    pub stream_open_timeout_ms: u64,

    /// Upper bound on a graceful connection close.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Timeout for the identify exchange after a connection is established.
    #[serde(default = "default_identify_timeout_ms")]
    pub identify_timeout_ms: u64,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    #[serde(default = "default_agent_version")]
    pub agent_version: String,

    /// Capacity of the swarm event channel. Slow subscribers lag.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_millis() as u64
}

fn default_upgrade_timeout_ms() -> u64 {
    10_000
}

fn default_stream_open_timeout_ms() -> u64 {
    5_000
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

fn default_identify_timeout_ms() -> u64 {
    5_000
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_agent_version() -> String {
    format!("plexus/{}", env!("CARGO_PKG_VERSION"))
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            upgrade_timeout_ms: default_upgrade_timeout_ms(),
            stream_open_timeout_ms: default_stream_open_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            identify_timeout_ms: default_identify_timeout_ms(),
            protocol_version: default_protocol_version(),
            agent_version: default_agent_version(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl SwarmConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Appends a listen address.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addrs.push(addr.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("dial_timeout_ms", self.dial_timeout_ms),
            ("upgrade_timeout_ms", self.upgrade_timeout_ms),
            ("stream_open_timeout_ms", self.stream_open_timeout_ms),
            ("close_timeout_ms", self.close_timeout_ms),
            ("identify_timeout_ms", self.identify_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::ZeroValue {
                field: "event_channel_capacity",
            });
        }
        self.listen_multiaddrs()?;
        Ok(())
    }

    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>, ConfigError> {
        self.listen_addrs
            .iter()
            .map(|addr| {
                addr.parse::<Multiaddr>().map_err(|e| ConfigError::InvalidListenAddr {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn upgrade_config(&self) -> UpgradeConfig {
        UpgradeConfig {
            upgrade_timeout: Duration::from_millis(self.upgrade_timeout_ms),
            stream_open_timeout: Duration::from_millis(self.stream_open_timeout_ms),
            close_timeout: self.close_timeout(),
            ..UpgradeConfig::default()
        }
    }
}
