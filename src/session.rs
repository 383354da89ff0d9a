//! Active connections: clients, peers, and the synthetic sessions
//! fabricated for forwarded requests.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::caps::CapabilityGrant;
use crate::messages::SubscribeItem;

/// Where replies to a forwarded request must travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyLink {
    /// The monitor that forwarded the request.
    pub via: SocketAddr,
    /// Its routed-request id for this request.
    pub tid: u64,
}

/// One subscription held by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    /// Next version the subscriber wants.
    pub next: u64,
    /// Deliver once and forget.
    pub onetime: bool,
}

/// One admitted connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Peer address (for a forwarded request: the original client).
    pub addr: SocketAddr,
    /// Whether the peer is an authenticated monitor.
    pub is_monitor: bool,
    /// Capabilities.
    pub caps: CapabilityGrant,
    /// When the session was admitted.
    pub admitted_at: Instant,
    /// Expiry; `None` for monitor peers.
    pub until: Option<Instant>,
    /// Set when the connection went away but the session object lingers.
    pub closed: bool,
    /// Reverse path for forwarded requests.
    pub proxy: Option<ProxyLink>,
    /// Routed-request ids owned by this session.
    pub routed_tids: BTreeSet<u64>,
    /// Map-name keyed subscriptions.
    pub subs: BTreeMap<String, Subscription>,
}

impl Session {
    fn new(addr: SocketAddr, is_monitor: bool, admitted_at: Instant) -> Self {
        Self {
            addr,
            is_monitor,
            caps: CapabilityGrant::default(),
            admitted_at,
            until: None,
            closed: false,
            proxy: None,
            routed_tids: BTreeSet::new(),
            subs: BTreeMap::new(),
        }
    }

    /// Record or refresh a subscription.
    pub fn update_sub(&mut self, what: &str, item: SubscribeItem) {
        self.subs.insert(
            what.to_string(),
            Subscription {
                next: item.start,
                onetime: item.onetime,
            },
        );
    }
}

/// Registry of sessions keyed by peer address.
#[derive(Debug, Default)]
pub struct SessionMap {
    sessions: HashMap<SocketAddr, Session>,
}

impl SessionMap {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new session, replacing any stale one at the same address.
    pub fn insert(&mut self, addr: SocketAddr, is_monitor: bool, now: Instant) -> &mut Session {
        use std::collections::hash_map::Entry;
        match self.sessions.entry(addr) {
            Entry::Occupied(mut entry) => {
                entry.insert(Session::new(addr, is_monitor, now));
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(Session::new(addr, is_monitor, now)),
        }
    }

    /// Look up a live session.
    pub fn get(&self, addr: &SocketAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    /// Look up a live session mutably.
    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(addr)
    }

    /// Remove a session, returning it for routed-request teardown.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Session> {
        self.sessions.remove(addr)
    }

    /// All sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Addresses of every session, for iteration with mutation.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.sessions.keys().copied().collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn insert_replaces_existing_session() {
        let mut map = SessionMap::new();
        let now = Instant::now();
        map.insert(addr(1), false, now).routed_tids.insert(7);
        let fresh = map.insert(addr(1), false, now);
        assert!(fresh.routed_tids.is_empty());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn monitor_sessions_have_no_expiry() {
        let mut map = SessionMap::new();
        let s = map.insert(addr(1), true, Instant::now());
        assert!(s.is_monitor);
        assert!(s.until.is_none());
    }

    #[test]
    fn subscriptions_are_keyed_by_map_name() {
        let mut map = SessionMap::new();
        let s = map.insert(addr(1), false, Instant::now());
        s.update_sub(
            "osdmap",
            SubscribeItem {
                start: 5,
                onetime: false,
            },
        );
        s.update_sub(
            "osdmap",
            SubscribeItem {
                start: 9,
                onetime: true,
            },
        );
        assert_eq!(s.subs.len(), 1);
        assert_eq!(s.subs["osdmap"].next, 9);
        assert!(s.subs["osdmap"].onetime);
    }

    #[test]
    fn remove_returns_session_for_teardown() {
        let mut map = SessionMap::new();
        map.insert(addr(1), false, Instant::now())
            .routed_tids
            .insert(42);
        let removed = map.remove(&addr(1)).unwrap();
        assert!(removed.routed_tids.contains(&42));
        assert!(map.get(&addr(1)).is_none());
    }
}
