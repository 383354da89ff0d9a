//! Operator-facing status documents and administrative verbs.
//!
//! Read-only snapshots render as JSON; the two mutating verbs (`sync_force`,
//! `add_bootstrap_peer_hint`) return plain messages.

use std::net::IpAddr;
use std::net::SocketAddr;

use serde_json::json;
use serde_json::Value;

use crate::error::CommandError;
use crate::monitor::Monitor;
use crate::monitor::SyncRole;
use crate::store::Transaction;
use crate::store::FORCE_SYNC_KEY;
use crate::store::SYNC_PREFIX;

/// Port assumed when a bootstrap hint omits one.
pub const DEFAULT_MONITOR_PORT: u16 = 6789;

fn peer_map_doc(mon: &Monitor) -> Value {
    let members: Vec<Value> = mon
        .peer_map()
        .members()
        .enumerate()
        .map(|(rank, m)| {
            json!({
                "rank": rank,
                "name": m.name,
                "addr": m.addr.to_string(),
            })
        })
        .collect();
    json!({
        "epoch": mon.peer_map().epoch,
        "fsid": mon.peer_map().fsid.to_string(),
        "mons": members,
    })
}

/// Snapshot of this monitor's lifecycle state.
pub fn mon_status(mon: &Monitor) -> Value {
    let mut doc = json!({
        "name": mon.name(),
        "rank": mon.rank(),
        "state": mon.state().name(),
        "election_epoch": mon.elector.epoch(),
        "quorum": mon.quorum().iter().collect::<Vec<_>>(),
        "outside_quorum": mon.outside_quorum.iter().collect::<Vec<_>>(),
        "monmap": peer_map_doc(mon),
    });
    if mon.is_synchronizing() {
        if let Some(leader) = &mon.sync_leader {
            doc["sync_leader"] = json!(leader.addr.to_string());
        }
        if let Some(provider) = &mon.sync_provider {
            doc["sync_provider"] = json!(provider.addr.to_string());
        }
    }
    doc
}

/// Snapshot of the current quorum. Callers gate on quorum membership.
pub fn quorum_status(mon: &Monitor) -> Value {
    json!({
        "election_epoch": mon.elector.epoch(),
        "quorum": mon.quorum().iter().collect::<Vec<_>>(),
        "monmap": peer_map_doc(mon),
    })
}

/// Snapshot of every sync role this monitor currently plays.
pub fn sync_status(mon: &Monitor) -> Value {
    let mut doc = json!({
        "state": mon.state().name(),
        "paxos_version": mon.paxos.version(),
    });

    if mon.is_leader() || mon.sync_role().contains(SyncRole::LEADER) {
        let trim = mon.trim.lock();
        let mut section = json!({
            "disabled": mon.paxos.is_trim_disabled(),
            "should_trim": mon.paxos.should_trim(),
        });
        if !trim.timeouts.is_empty() {
            section["mons"] = json!(trim
                .timeouts
                .keys()
                .map(|a| a.to_string())
                .collect::<Vec<_>>());
        }
        doc["trim"] = section;
    }

    if mon.sync_role().contains(SyncRole::PROVIDER) || !mon.sync_entities.is_empty() {
        let on_going: Vec<Value> = mon
            .sync_entities
            .keys()
            .map(|addr| json!({ "addr": addr.to_string(), "state": "start" }))
            .collect();
        doc["on_going"] = json!(on_going);
    }

    if mon.is_synchronizing() || mon.sync_role().contains(SyncRole::REQUESTER) {
        doc["leader"] = match &mon.sync_leader {
            Some(peer) => json!({ "addr": peer.addr.to_string() }),
            None => json!({}),
        };
        doc["provider"] = match &mon.sync_provider {
            Some(peer) => json!({ "addr": peer.addr.to_string() }),
            None => json!({}),
        };
    }

    if mon.config.sync_leader_kill_at > 0 {
        doc["leader_kill_at"] = json!(mon.config.sync_leader_kill_at);
    }
    if mon.config.sync_provider_kill_at > 0 {
        doc["provider_kill_at"] = json!(mon.config.sync_provider_kill_at);
    }
    if mon.config.sync_requester_kill_at > 0 {
        doc["requester_kill_at"] = json!(mon.config.sync_requester_kill_at);
    }

    doc
}

/// Persist the marker that forces a full store resync on the next startup.
pub fn sync_force(mon: &mut Monitor) -> String {
    let mut tx = Transaction::new();
    tx.put(SYNC_PREFIX, FORCE_SYNC_KEY, vec![1]);
    if let Err(err) = mon.store.apply(tx) {
        tracing::error!(%err, "failed to persist force_sync marker");
        return format!("failed to persist force_sync marker: {err}");
    }
    "forcing store sync the next time the monitor starts".to_string()
}

/// Record an extra address to probe during bootstrap.
pub fn add_bootstrap_peer_hint(mon: &mut Monitor, arg: &str) -> (i32, String) {
    if mon.is_leader() || mon.is_peon() {
        return (
            CommandError::Invalid.code(),
            "mon already active; ignoring bootstrap hint".to_string(),
        );
    }
    if arg.is_empty() {
        return (
            CommandError::Invalid.code(),
            "syntax is 'add_bootstrap_peer_hint ip[:port]'".to_string(),
        );
    }
    let addr = match arg.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(_) => match arg.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, DEFAULT_MONITOR_PORT),
            Err(_) => {
                return (
                    CommandError::Invalid.code(),
                    format!("failed to parse addr '{arg}'"),
                );
            }
        },
    };
    mon.extra_probe_peers.insert(addr);
    let peers: Vec<String> = mon.extra_probe_peers.iter().map(|a| a.to_string()).collect();
    (0, format!("adding peer {addr} to list: {peers:?}"))
}
