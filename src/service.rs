//! Interface to the per-map services layered on the replicated log.
//!
//! Each service owns one map (OSD, MDS, placement groups, monitor map, the
//! cluster log, auth) and one store prefix. The core never interprets a
//! service's state; it only routes messages, propagates lifecycle events,
//! and copies the prefixes wholesale during a store sync.

use std::net::SocketAddr;

use serde::Deserialize;
use serde::Serialize;

/// The fixed set of map services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Object storage daemon map.
    OsdMap,
    /// Metadata server map.
    MdsMap,
    /// Placement group map.
    PgMap,
    /// Monitor membership map.
    MonMap,
    /// Cluster log.
    LogMap,
    /// Authentication map.
    Auth,
}

impl ServiceKind {
    /// All service kinds, in dispatch order.
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::OsdMap,
        ServiceKind::MdsMap,
        ServiceKind::PgMap,
        ServiceKind::MonMap,
        ServiceKind::LogMap,
        ServiceKind::Auth,
    ];

    /// Store prefix owned by this service.
    pub fn prefix(self) -> &'static str {
        match self {
            ServiceKind::OsdMap => "osdmap",
            ServiceKind::MdsMap => "mdsmap",
            ServiceKind::PgMap => "pgmap",
            ServiceKind::MonMap => "monmap",
            ServiceKind::LogMap => "logm",
            ServiceKind::Auth => "auth",
        }
    }

    /// Service selected by the leading token of an operator command.
    pub fn from_command_prefix(token: &str) -> Option<Self> {
        match token {
            "osd" => Some(ServiceKind::OsdMap),
            "mds" => Some(ServiceKind::MdsMap),
            "pg" => Some(ServiceKind::PgMap),
            "mon" => Some(ServiceKind::MonMap),
            "log" => Some(ServiceKind::LogMap),
            "auth" => Some(ServiceKind::Auth),
            _ => None,
        }
    }

    /// Service owning the given store prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.prefix() == prefix)
    }
}

/// One map service as seen by the core.
pub trait Service: Send {
    /// Which map this service owns.
    fn kind(&self) -> ServiceKind;

    /// Latest committed version of this map.
    fn version(&self) -> u64;

    /// Oldest version still retrievable.
    fn first_committed(&self) -> u64;

    /// Re-read state from the log after a commit became visible.
    fn update_from_paxos(&mut self);

    /// An election round resolved; the quorum may have changed.
    fn election_finished(&mut self);

    /// The monitor is re-bootstrapping; drop in-flight proposals.
    fn restart(&mut self) {}

    /// Periodic housekeeping.
    fn tick(&mut self);

    /// Handle a service-tagged message.
    fn dispatch(&mut self, from: SocketAddr, payload: Vec<u8>);

    /// Final teardown.
    fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_unique() {
        let mut prefixes: Vec<_> = ServiceKind::ALL.iter().map(|k| k.prefix()).collect();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), ServiceKind::ALL.len());
    }

    #[test]
    fn command_prefix_selects_expected_service() {
        assert_eq!(
            ServiceKind::from_command_prefix("osd"),
            Some(ServiceKind::OsdMap)
        );
        assert_eq!(
            ServiceKind::from_command_prefix("auth"),
            Some(ServiceKind::Auth)
        );
        assert_eq!(ServiceKind::from_command_prefix("fsid"), None);
    }

    #[test]
    fn prefix_roundtrip() {
        for kind in ServiceKind::ALL {
            assert_eq!(ServiceKind::from_prefix(kind.prefix()), Some(kind));
        }
    }
}
