//! Cluster gauge sink.
//!
//! The core publishes two gauges on quorum entry; everything else about
//! metrics lives outside.

/// Sink for the cluster-level gauges the core maintains.
pub trait ClusterMetrics: Send + Sync {
    /// Number of monitors in the peer map.
    fn set_peer_count(&self, n: u64);

    /// Number of monitors in the current quorum.
    fn set_quorum_count(&self, n: u64);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl ClusterMetrics for NullMetrics {
    fn set_peer_count(&self, _n: u64) {}
    fn set_quorum_count(&self, _n: u64) {}
}
