use std::time::Duration;

use crate::YAMUX_PROTOCOL;

/// Upgrade and per-connection settings.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Multiplexer protocols in preference order.
    pub multiplexers: Vec<String>,
    /// Bound on the whole upgrade (security + multiplexer negotiation).
    pub upgrade_timeout: Duration,
    /// Bound on opening and negotiating one substream.
    pub stream_open_timeout: Duration,
    /// Bound on closing the multiplexer.
    pub close_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            multiplexers: vec![YAMUX_PROTOCOL.to_string()],
            upgrade_timeout: Duration::from_secs(10),
            stream_open_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
        }
    }
}
