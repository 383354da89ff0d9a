//! Smoke tests for the tokio runtime shell.

use std::net::SocketAddr;
use std::sync::Arc;

use vigil::metrics::NullMetrics;
use vigil::monitor::Monitor;
use vigil::peer_map::PeerEntry;
use vigil::peer_map::PeerMap;
use vigil::runtime::AdminQuery;
use vigil::service::ServiceKind;
use vigil::store::MemoryStore;
use vigil::testing::CaptureMessenger;
use vigil::testing::StubElection;
use vigil::testing::StubLog;
use vigil::testing::StubService;
use vigil::MonitorConfig;

fn single_member_monitor() -> Monitor {
    let addr: SocketAddr = "127.0.0.1:7400".parse().unwrap();
    let store = Arc::new(MemoryStore::new());
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

#[tokio::test]
async fn spawned_single_member_monitor_answers_admin_queries() {
    let handle = vigil::runtime::spawn(single_member_monitor());

    let doc = handle.admin(AdminQuery::MonStatus).await.unwrap();
    assert_eq!(doc["state"], "leader");
    assert_eq!(doc["rank"], 0);

    let quorum = handle.admin(AdminQuery::QuorumStatus).await.unwrap();
    assert_eq!(quorum["quorum"].as_array().map(Vec::len), Some(1));

    let monitor = handle.shutdown().await.unwrap();
    assert!(matches!(
        monitor.state(),
        vigil::LifecycleState::ShuttingDown
    ));
}

#[tokio::test]
async fn runtime_shutdown_is_clean_while_idle() {
    let handle = vigil::runtime::spawn(single_member_monitor());
    let sync = handle.admin(AdminQuery::SyncStatus).await.unwrap();
    assert_eq!(sync["state"], "leader");
    let monitor = handle.shutdown().await.unwrap();
    assert!(!monitor.is_fenced());
}
