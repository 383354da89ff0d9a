//! Interface to the external replicated-log module.
//!
//! The core drives the log through a handful of lifecycle calls and the
//! trim gate; the commit algorithm itself lives behind this trait.

use std::net::SocketAddr;

/// The replicated log as seen by the monitor core.
pub trait ReplicatedLog: Send {
    /// Latest committed version.
    fn version(&self) -> u64;

    /// Oldest committed version still present.
    fn first_committed(&self) -> u64;

    /// Load state from the store at startup (and after a completed sync).
    fn init(&mut self);

    /// Enter the leader role after winning an election.
    fn leader_init(&mut self);

    /// Enter the peon role after losing an election.
    fn peon_init(&mut self);

    /// Drop in-flight rounds; the monitor is re-bootstrapping.
    fn restart(&mut self);

    /// Suppress trimming of the committed prefix. Calls nest.
    fn trim_disable(&mut self);

    /// Release one trim suppression.
    fn trim_enable(&mut self);

    /// Whether trimming is currently suppressed.
    fn is_trim_disabled(&self) -> bool;

    /// Whether a trim is wanted right now.
    fn should_trim(&self) -> bool;

    /// Whether on-disk state is coherent enough to serve reads.
    fn is_consistent(&self) -> bool;

    /// Handle log-module traffic from a peer.
    fn dispatch(&mut self, from: SocketAddr, payload: Vec<u8>);
}
