//! Authoritative monitor membership: rank, name, and address bookkeeping.
//!
//! The peer map is the sole authority for rank derivation. Epoch 0 marks a
//! seed map that has never been committed through the map service.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Address placeholder used before a member's real endpoint is learned.
pub const BLANK_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Returns true for the blank placeholder address.
pub fn is_blank_addr(addr: &SocketAddr) -> bool {
    addr.ip().is_unspecified() && addr.port() == 0
}

/// Identity of one monitor as derived from the peer map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorId {
    /// Configured monitor name.
    pub name: String,
    /// Rank within the peer map; `None` until the map contains us.
    pub rank: Option<u32>,
    /// Endpoint address.
    pub addr: SocketAddr,
}

/// One member entry: name plus endpoint address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerEntry {
    /// Monitor name.
    pub name: String,
    /// Endpoint address; may be [`BLANK_ADDR`] until learned.
    pub addr: SocketAddr,
}

/// Versioned, ordered membership list. Rank equals insertion position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMap {
    /// Map epoch; 0 means "seed, never committed".
    pub epoch: u64,
    /// Cluster identity; probes from a different cluster are ignored.
    pub fsid: Uuid,
    members: Vec<PeerEntry>,
}

impl PeerMap {
    /// Create a seed map (epoch 0) from name/address pairs.
    pub fn seed(fsid: Uuid, members: Vec<PeerEntry>) -> Self {
        Self {
            epoch: 0,
            fsid,
            members,
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the map has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `name` is a member.
    pub fn contains_name(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name)
    }

    /// Whether `addr` belongs to a member.
    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.members.iter().any(|m| m.addr == *addr)
    }

    /// Rank of the member named `name`.
    pub fn rank_of_name(&self, name: &str) -> Option<u32> {
        self.members.iter().position(|m| m.name == name).map(|i| i as u32)
    }

    /// Rank of the member at `addr`.
    pub fn rank_of_addr(&self, addr: &SocketAddr) -> Option<u32> {
        self.members.iter().position(|m| m.addr == *addr).map(|i| i as u32)
    }

    /// Name of the member holding `rank`.
    pub fn name_of_rank(&self, rank: u32) -> Option<&str> {
        self.members.get(rank as usize).map(|m| m.name.as_str())
    }

    /// Address of the member holding `rank`.
    pub fn addr_of_rank(&self, rank: u32) -> Option<SocketAddr> {
        self.members.get(rank as usize).map(|m| m.addr)
    }

    /// Name of the member at `addr`.
    pub fn name_of_addr(&self, addr: &SocketAddr) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.addr == *addr)
            .map(|m| m.name.as_str())
    }

    /// Address recorded for `name`.
    pub fn addr_of_name(&self, name: &str) -> Option<SocketAddr> {
        self.members.iter().find(|m| m.name == name).map(|m| m.addr)
    }

    /// Append a member. Rank follows insertion order.
    pub fn add(&mut self, name: impl Into<String>, addr: SocketAddr) {
        self.members.push(PeerEntry {
            name: name.into(),
            addr,
        });
    }

    /// Rename a member in place, preserving its rank.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) {
        if let Some(m) = self.members.iter_mut().find(|m| m.name == from) {
            m.name = to.into();
        }
    }

    /// Record the real address of a member learned through probing.
    pub fn set_addr(&mut self, name: &str, addr: SocketAddr) {
        if let Some(m) = self.members.iter_mut().find(|m| m.name == name) {
            m.addr = addr;
        }
    }

    /// Iterate over members in rank order.
    pub fn members(&self) -> impl Iterator<Item = &PeerEntry> {
        self.members.iter()
    }

    /// Pick a random member name.
    pub fn pick_random(&self) -> Option<&str> {
        use rand::Rng;
        if self.members.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..self.members.len());
        Some(self.members[i].name.as_str())
    }

    /// Restrict a seed map to the configured initial members.
    ///
    /// Only meaningful before the map has ever been committed. Members not in
    /// `initial` are removed; their addresses are returned so the caller can
    /// keep probing them as bootstrap hints. Our own entry is added (or its
    /// address fixed up) if `initial` names us but the seed does not carry a
    /// usable address for us.
    pub fn set_initial_members(
        &mut self,
        initial: &[String],
        my_name: &str,
        my_addr: SocketAddr,
    ) -> BTreeSet<SocketAddr> {
        let mut displaced = BTreeSet::new();
        self.members.retain(|m| {
            if initial.iter().any(|n| n == &m.name) {
                true
            } else {
                if !is_blank_addr(&m.addr) {
                    displaced.insert(m.addr);
                }
                false
            }
        });
        if initial.iter().any(|n| n == my_name) {
            match self.members.iter_mut().find(|m| m.name == my_name) {
                Some(me) if is_blank_addr(&me.addr) => me.addr = my_addr,
                Some(_) => {}
                None => self.members.push(PeerEntry {
                    name: my_name.to_string(),
                    addr: my_addr,
                }),
            }
        }
        displaced
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_stdvec(self).unwrap_or_default()
    }

    /// Deserialize from the wire.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        postcard::from_bytes(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn three_mon_map() -> PeerMap {
        let mut map = PeerMap::seed(Uuid::new_v4(), Vec::new());
        map.add("a", addr(1));
        map.add("b", addr(2));
        map.add("c", addr(3));
        map
    }

    #[test]
    fn rank_follows_insertion_order() {
        let map = three_mon_map();
        assert_eq!(map.rank_of_name("a"), Some(0));
        assert_eq!(map.rank_of_name("b"), Some(1));
        assert_eq!(map.rank_of_name("c"), Some(2));
        assert_eq!(map.rank_of_name("zz"), None);
    }

    #[test]
    fn contains_matches_membership() {
        let map = three_mon_map();
        assert!(map.contains_name("b"));
        assert!(!map.contains_name("d"));
        assert!(map.contains_addr(&addr(3)));
        assert!(!map.contains_addr(&addr(9)));
    }

    #[test]
    fn rename_preserves_rank() {
        let mut map = three_mon_map();
        map.rename("b", "beta");
        assert_eq!(map.rank_of_name("beta"), Some(1));
        assert!(!map.contains_name("b"));
    }

    #[test]
    fn set_addr_replaces_blank_entry() {
        let mut map = PeerMap::seed(Uuid::new_v4(), Vec::new());
        map.add("a", BLANK_ADDR);
        assert!(is_blank_addr(&map.addr_of_name("a").unwrap()));
        map.set_addr("a", addr(5));
        assert_eq!(map.addr_of_name("a"), Some(addr(5)));
    }

    #[test]
    fn initial_members_filter_keeps_named_and_reports_displaced() {
        let mut map = three_mon_map();
        let displaced = map.set_initial_members(
            &["a".to_string(), "c".to_string()],
            "a",
            addr(1),
        );
        assert_eq!(map.len(), 2);
        assert!(map.contains_name("a"));
        assert!(map.contains_name("c"));
        assert_eq!(displaced.into_iter().collect::<Vec<_>>(), vec![addr(2)]);
    }

    #[test]
    fn initial_members_filter_adds_self_when_missing() {
        let mut map = PeerMap::seed(Uuid::new_v4(), Vec::new());
        map.add("b", addr(2));
        map.set_initial_members(&["a".to_string()], "a", addr(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.addr_of_name("a"), Some(addr(1)));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let map = three_mon_map();
        let decoded = PeerMap::decode(&map.encode()).unwrap();
        assert_eq!(map, decoded);
    }
}
