//! Interface to the external election module.
//!
//! The elector exchanges its own messages with peers and eventually calls
//! back into [`Monitor::win_election`] or [`Monitor::lose_election`].
//!
//! [`Monitor::win_election`]: crate::monitor::Monitor::win_election
//! [`Monitor::lose_election`]: crate::monitor::Monitor::lose_election

use std::net::SocketAddr;

/// The election module as seen by the monitor core.
pub trait Election: Send {
    /// Start a new election round.
    fn call_election(&mut self);

    /// Current election epoch.
    fn epoch(&self) -> u64;

    /// Resume answering election traffic.
    fn start_participating(&mut self);

    /// Stop answering election traffic (operator-driven quorum exit).
    fn stop_participating(&mut self);

    /// Handle elector traffic from a peer.
    fn dispatch(&mut self, from: SocketAddr, payload: Vec<u8>);

    /// Final teardown.
    fn shutdown(&mut self);
}
