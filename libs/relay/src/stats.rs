//! Relay-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Client sockets accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently registered.
    pub connections_active: AtomicU64,
    /// Connections torn down.
    pub connections_closed: AtomicU64,
    /// Upstream dials that failed.
    pub upstream_connect_failed: AtomicU64,
    /// Accept calls that returned an error.
    pub accept_errors: AtomicU64,
    /// Control actions that returned an error.
    pub action_failures: AtomicU64,
    /// Bytes forwarded from clients to the upstream.
    pub bytes_client_to_upstream: AtomicU64,
    /// Bytes forwarded from the upstream to clients.
    pub bytes_upstream_to_client: AtomicU64,
    /// Bytes discarded by drop faults, both directions.
    pub bytes_dropped: AtomicU64,
}

impl RelayStats {
    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            upstream_connect_failed: self.upstream_connect_failed.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
            bytes_client_to_upstream: self.bytes_client_to_upstream.load(Ordering::Relaxed),
            bytes_upstream_to_client: self.bytes_upstream_to_client.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub upstream_connect_failed: u64,
    pub accept_errors: u64,
    pub action_failures: u64,
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
    pub bytes_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = RelayStats::default();
        stats.connections_accepted.fetch_add(2, Ordering::Relaxed);
        stats.bytes_dropped.fetch_add(10, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.bytes_dropped, 10);
        assert_eq!(snapshot.connections_active, 0);
    }
}
