//! Outbound message transport.

use std::net::SocketAddr;

use crate::messages::Message;

/// Transport used by the core to reach peers and clients.
///
/// Delivery is best-effort; every protocol in the core tolerates loss
/// through timeouts.
pub trait Messenger: Send + Sync {
    /// Send a message to `to`.
    fn send(&self, to: SocketAddr, msg: Message);

    /// Tear down any connection to `addr`.
    fn mark_down(&self, addr: SocketAddr);

    /// Tear down every outbound connection (rank changed; peers must
    /// re-identify us).
    fn mark_down_all(&self);

    /// Whether a connection to `addr` is currently live.
    fn is_connected(&self, addr: SocketAddr) -> bool;

    /// Our own address.
    fn local_addr(&self) -> SocketAddr;
}
