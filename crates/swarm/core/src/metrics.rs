//! Swarm metrics

use metrics::Counter;

/// Connection and dial counters.
#[derive(Clone, Debug)]
pub(crate) struct SwarmMetrics {
    /// Candidate addresses handed to a transport
    pub(crate) dial_attempts_total: Counter,
    /// Dials that produced no connection
    pub(crate) dial_failures_total: Counter,
    /// Connections registered as active
    pub(crate) connections_established_total: Counter,
    /// Registered connections that went away
    pub(crate) connections_closed_total: Counter,
    /// Connections closed because another one to the same peer won
    pub(crate) connections_deduplicated_total: Counter,
}

impl Default for SwarmMetrics {
    fn default() -> Self {
        Self {
            dial_attempts_total: metrics::counter!("swarm.dial.attempts_total"),
            dial_failures_total: metrics::counter!("swarm.dial.failures_total"),
            connections_established_total: metrics::counter!(
                "swarm.connections.established_total"
            ),
            connections_closed_total: metrics::counter!("swarm.connections.closed_total"),
            connections_deduplicated_total: metrics::counter!(
                "swarm.connections.deduplicated_total"
            ),
        }
    }
}

impl SwarmMetrics {
    pub(crate) fn inc_dial_attempts(&self) {
        self.dial_attempts_total.increment(1);
    }

    pub(crate) fn inc_dial_failures(&self) {
        self.dial_failures_total.increment(1);
    }

    pub(crate) fn inc_connections_established(&self) {
        self.connections_established_total.increment(1);
    }

    pub(crate) fn inc_connections_closed(&self) {
        self.connections_closed_total.increment(1);
    }

    pub(crate) fn inc_connections_deduplicated(&self) {
        self.connections_deduplicated_total.increment(1);
    }
}
