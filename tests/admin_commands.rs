//! Operator command surface: capability gating, status documents, forced
//! resync, bootstrap hints, and quorum enter/exit.

use std::net::SocketAddr;
use std::sync::Arc;

use vigil::caps::CapabilityGrant;
use vigil::messages::Message;
use vigil::messages::MonCommand;
use vigil::messages::MonCommandAck;
use vigil::metrics::NullMetrics;
use vigil::monitor::Monitor;
use vigil::peer_map::PeerEntry;
use vigil::peer_map::PeerMap;
use vigil::service::ServiceKind;
use vigil::store::MemoryStore;
use vigil::store::Store;
use vigil::store::Transaction;
use vigil::testing::CaptureMessenger;
use vigil::testing::Cluster;
use vigil::testing::StubElection;
use vigil::testing::StubLog;
use vigil::testing::StubService;
use vigil::LifecycleState;
use vigil::MonitorConfig;

fn client_addr() -> SocketAddr {
    "10.9.9.9:4000".parse().unwrap()
}

fn command(cluster: &Cluster, args: &[&str]) -> Message {
    Message::Command(MonCommand {
        fsid: cluster.fsid,
        args: args.iter().map(|s| s.to_string()).collect(),
    })
}

fn acks(cluster: &Cluster) -> Vec<MonCommandAck> {
    cluster
        .client_messages_to(client_addr())
        .into_iter()
        .filter_map(|m| match m {
            Message::CommandAck(ack) => Some(ack),
            _ => None,
        })
        .collect()
}

fn elected_cluster() -> Cluster {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    cluster.init_all();
    cluster.pump();
    cluster.run_election(0, &[0, 1, 2]);
    cluster
}

#[test]
fn commands_from_unprivileged_clients_are_denied() {
    let mut cluster = elected_cluster();
    cluster.client_send(0, client_addr(), command(&cluster, &["mon_status"]));
    cluster.pump();
    let acks = acks(&cluster);
    assert_eq!(acks.len(), 1);
    assert!(acks[0].code < 0);
    assert!(acks[0].status.contains("denied"));
}

#[test]
fn mon_status_returns_a_json_document() {
    let mut cluster = elected_cluster();
    // First contact creates the session; then auth grants read access.
    cluster.client_send(0, client_addr(), command(&cluster, &["fsid"]));
    cluster
        .mons[0]
        .monitor
        .set_session_caps(&client_addr(), CapabilityGrant::allow_all());

    cluster.client_send(0, client_addr(), command(&cluster, &["mon_status"]));
    cluster.pump();

    let acks = acks(&cluster);
    let status_ack = acks.last().unwrap();
    assert_eq!(status_ack.code, 0);
    let doc: serde_json::Value = serde_json::from_slice(&status_ack.data).unwrap();
    assert_eq!(doc["state"], "leader");
    assert_eq!(doc["rank"], 0);
    assert_eq!(doc["quorum"].as_array().map(Vec::len), Some(3));
    assert_eq!(doc["monmap"]["mons"].as_array().map(Vec::len), Some(3));
}

#[test]
fn quorum_status_waits_for_quorum_then_answers() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    cluster.init_all();

    // Commands bypass the admission gate even out of quorum.
    cluster.client_send(0, client_addr(), command(&cluster, &["fsid"]));
    cluster
        .mons[0]
        .monitor
        .set_session_caps(&client_addr(), CapabilityGrant::allow_all());
    cluster.client_send(0, client_addr(), command(&cluster, &["quorum_status"]));
    cluster.pump();
    // Only the fsid ack so far; quorum_status is parked.
    assert_eq!(acks(&cluster).len(), 1);

    cluster.pump();
    cluster.run_election(0, &[0, 1, 2]);
    cluster.pump();

    let all = acks(&cluster);
    let last = all.last().unwrap();
    assert_eq!(last.code, 0);
    let doc: serde_json::Value = serde_json::from_slice(&last.data).unwrap();
    assert_eq!(doc["quorum"].as_array().map(Vec::len), Some(3));
}

#[test]
fn wrong_fsid_command_is_rejected() {
    let mut cluster = elected_cluster();
    let foreign = Message::Command(MonCommand {
        fsid: uuid::Uuid::new_v4(),
        args: vec!["mon_status".to_string()],
    });
    cluster.client_send(0, client_addr(), foreign);
    cluster.pump();
    let acks = acks(&cluster);
    assert_eq!(acks.len(), 1);
    assert!(acks[0].status.contains("fsid"));
    assert!(acks[0].code < 0);
}

#[test]
fn fsid_command_echoes_the_cluster_id() {
    let mut cluster = elected_cluster();
    cluster.client_send(0, client_addr(), command(&cluster, &["fsid"]));
    cluster.pump();
    let acks = acks(&cluster);
    assert_eq!(acks[0].code, 0);
    assert_eq!(acks[0].status, cluster.fsid.to_string());
}

#[test]
fn sync_force_persists_marker_and_next_startup_clears_the_store() {
    let mut cluster = elected_cluster();
    cluster.client_send(0, client_addr(), command(&cluster, &["fsid"]));
    cluster
        .mons[0]
        .monitor
        .set_session_caps(&client_addr(), CapabilityGrant::allow_all());
    cluster.client_send(0, client_addr(), command(&cluster, &["sync_force"]));
    cluster.pump();

    assert!(cluster.mons[0]
        .store
        .get("mon_sync", "force_sync")
        .is_some());

    // Simulate the restart: a fresh monitor over the same store clears the
    // sync targets before initializing the log.
    let store = cluster.mons[0].store.clone();
    let mut tx = Transaction::new();
    tx.put("osdmap", "stale", vec![1]);
    store.apply(tx).unwrap();

    let mut restarted = monitor_over(store.clone());
    restarted.init(cluster.now);

    assert_eq!(store.get("osdmap", "stale"), None);
    assert_eq!(store.get("mon_sync", "force_sync"), None);
}

fn monitor_over(store: Arc<MemoryStore>) -> Monitor {
    let addr: SocketAddr = "127.0.0.1:7300".parse().unwrap();
    let seed = PeerMap::seed(
        uuid::Uuid::new_v4(),
        vec![PeerEntry {
            name: "a".to_string(),
            addr,
        }],
    );
    let (log, _) = StubLog::new(store.clone(), 0, 0);
    let (elect, _) = StubElection::new();
    let services = ServiceKind::ALL
        .iter()
        .map(|&kind| {
            let (service, _) = StubService::new(kind);
            Box::new(service) as Box<dyn vigil::service::Service>
        })
        .collect();
    Monitor::new(
        "a",
        MonitorConfig::default(),
        seed,
        store,
        Box::new(log),
        Box::new(elect),
        services,
        Arc::new(CaptureMessenger::new(addr)),
        Arc::new(NullMetrics),
    )
}

#[test]
fn bootstrap_peer_hint_is_accepted_while_inactive_and_rejected_once_active() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    cluster.init(0);

    cluster.client_send(0, client_addr(), command(&cluster, &["fsid"]));
    cluster
        .mons[0]
        .monitor
        .set_session_caps(&client_addr(), CapabilityGrant::allow_all());
    cluster.client_send(
        0,
        client_addr(),
        command(&cluster, &["add_bootstrap_peer_hint", "10.1.2.3:6789"]),
    );
    cluster.pump_dropping(|_, _, _| true);

    // Hint accepted while probing.
    let first = acks(&cluster);
    // Replies were dropped with everything else; check through the admin
    // surface instead.
    assert!(first.is_empty());
    let (code, msg) =
        vigil::admin::add_bootstrap_peer_hint(&mut cluster.mons[0].monitor, "10.1.2.4");
    assert_eq!(code, 0);
    assert!(msg.contains("10.1.2.4"));

    // Once in quorum the hint is refused.
    cluster.pump();
    cluster.init(1);
    cluster.init(2);
    cluster.pump();
    cluster.run_election(0, &[0, 1, 2]);
    let (code, msg) =
        vigil::admin::add_bootstrap_peer_hint(&mut cluster.mons[0].monitor, "10.1.2.5");
    assert!(code < 0);
    assert!(msg.contains("already active"));
}

#[test]
fn malformed_bootstrap_hint_is_rejected() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    cluster.init(0);
    let (code, msg) =
        vigil::admin::add_bootstrap_peer_hint(&mut cluster.mons[0].monitor, "not-an-addr");
    assert!(code < 0);
    assert!(msg.contains("failed to parse"));
}

#[test]
fn quorum_exit_and_enter_drive_the_elector() {
    let mut cluster = elected_cluster();
    cluster.client_send(0, client_addr(), command(&cluster, &["fsid"]));
    cluster
        .mons[0]
        .monitor
        .set_session_caps(&client_addr(), CapabilityGrant::allow_all());

    let calls_before = cluster.mons[0].elect.lock().calls;
    cluster.client_send(0, client_addr(), command(&cluster, &["quorum", "exit"]));
    assert_eq!(cluster.mons[0].monitor.state(), LifecycleState::Electing);
    assert!(!cluster.mons[0].elect.lock().participating);
    assert_eq!(cluster.mons[0].elect.lock().calls, calls_before + 1);

    cluster.client_send(0, client_addr(), command(&cluster, &["quorum", "enter"]));
    assert!(cluster.mons[0].elect.lock().participating);
    assert_eq!(cluster.mons[0].elect.lock().calls, calls_before + 2);
}

#[test]
fn unrecognized_command_gets_einval() {
    let mut cluster = elected_cluster();
    cluster.client_send(0, client_addr(), command(&cluster, &["frobnicate"]));
    cluster.pump();
    let acks = acks(&cluster);
    assert_eq!(acks[0].code, -22);
    assert!(acks[0].status.contains("unrecognized"));
}

#[test]
fn service_prefixed_commands_reach_their_service() {
    let mut cluster = elected_cluster();
    cluster.client_send(0, client_addr(), command(&cluster, &["auth", "list"]));
    assert_eq!(
        cluster.mons[0].services[&ServiceKind::Auth]
            .lock()
            .dispatched
            .len(),
        1
    );
}
