//! In-memory multi-monitor cluster with scripted delivery and a manual
//! clock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::messages::Message;
use crate::metrics::NullMetrics;
use crate::monitor::Envelope;
use crate::monitor::Monitor;
use crate::peer_map::PeerEntry;
use crate::peer_map::PeerMap;
use crate::service::ServiceKind;
use crate::store::MemoryStore;
use crate::testing::CaptureMessenger;
use crate::testing::StubElection;
use crate::testing::StubElectionState;
use crate::testing::StubLog;
use crate::testing::StubLogState;
use crate::testing::StubService;
use crate::testing::StubServiceState;

/// One monitor plus handles on its collaborator stubs.
pub struct TestMonitor {
    /// The core under test.
    pub monitor: Monitor,
    /// This monitor's address in the shared peer map.
    pub addr: SocketAddr,
    /// Captured outbound traffic.
    pub messenger: Arc<CaptureMessenger>,
    /// Replicated-log stub state.
    pub log: Arc<Mutex<StubLogState>>,
    /// Elector stub state.
    pub elect: Arc<Mutex<StubElectionState>>,
    /// Backing store.
    pub store: Arc<MemoryStore>,
    /// Map-service stub states.
    pub services: BTreeMap<ServiceKind, Arc<Mutex<StubServiceState>>>,
}

/// A cluster of in-memory monitors sharing one seed peer map.
///
/// Message delivery and time are fully scripted: [`Cluster::pump`] moves
/// captured monitor-to-monitor traffic, [`Cluster::advance`] moves the clock
/// and fires due timers. Traffic addressed outside the cluster (clients) is
/// collected for assertions.
pub struct Cluster {
    /// The manual clock.
    pub now: Instant,
    /// Cluster identity.
    pub fsid: Uuid,
    /// Monitors by rank.
    pub mons: Vec<TestMonitor>,
    /// Captured monitor-to-client traffic: (sender, destination, message).
    pub client_traffic: Vec<(SocketAddr, SocketAddr, Message)>,
}

fn member_addr(i: usize) -> SocketAddr {
    format!("127.0.0.1:{}", 7100 + i).parse().expect("fixed test address")
}

fn member_name(i: usize) -> String {
    char::from(b'a' + (i as u8 % 26)).to_string()
}

impl Cluster {
    /// Build `n` monitors over a fresh seed map. Monitors are constructed
    /// but not initialized; adjust stub state first, then call
    /// [`Cluster::init_all`].
    pub fn new(n: usize, config: MonitorConfig) -> Self {
        let fsid = Uuid::new_v4();
        let members: Vec<PeerEntry> = (0..n)
            .map(|i| PeerEntry {
                name: member_name(i),
                addr: member_addr(i),
            })
            .collect();
        let seed = PeerMap::seed(fsid, members);

        let mons = (0..n)
            .map(|i| {
                let addr = member_addr(i);
                let store = Arc::new(MemoryStore::new());
                let messenger = Arc::new(CaptureMessenger::new(addr));
                let (log, log_state) = StubLog::new(store.clone(), 0, 0);
                let (elect, elect_state) = StubElection::new();

                let mut services: Vec<Box<dyn crate::service::Service>> = Vec::new();
                let mut service_states = BTreeMap::new();
                for kind in ServiceKind::ALL {
                    let (service, state) = StubService::new(kind);
                    services.push(Box::new(service));
                    service_states.insert(kind, state);
                }

                let monitor = Monitor::new(
                    member_name(i),
                    config.clone(),
                    seed.clone(),
                    store.clone(),
                    Box::new(log),
                    Box::new(elect),
                    services,
                    messenger.clone(),
                    Arc::new(NullMetrics),
                );
                TestMonitor {
                    monitor,
                    addr,
                    messenger,
                    log: log_state,
                    elect: elect_state,
                    store,
                    services: service_states,
                }
            })
            .collect();

        Self {
            now: Instant::now(),
            fsid,
            mons,
            client_traffic: Vec::new(),
        }
    }

    /// Address of monitor `i`.
    pub fn addr(&self, i: usize) -> SocketAddr {
        self.mons[i].addr
    }

    /// Index of the monitor listening on `addr`.
    pub fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.mons.iter().position(|m| m.addr == addr)
    }

    /// Initialize one monitor.
    pub fn init(&mut self, i: usize) {
        let now = self.now;
        self.mons[i].monitor.init(now);
    }

    /// Initialize every monitor.
    pub fn init_all(&mut self) {
        for i in 0..self.mons.len() {
            self.init(i);
        }
    }

    /// Move captured monitor-to-monitor traffic until the cluster is quiet.
    ///
    /// Returns the number of messages delivered.
    pub fn pump(&mut self) -> usize {
        self.pump_dropping(|_, _, _| false)
    }

    /// Like [`Cluster::pump`], but messages for which `drop` returns true
    /// are discarded (sender index, destination, message).
    pub fn pump_dropping<F>(&mut self, drop: F) -> usize
    where
        F: Fn(usize, SocketAddr, &Message) -> bool,
    {
        let mut delivered = 0;
        for _round in 0..1000 {
            let mut batch: Vec<(usize, SocketAddr, Message)> = Vec::new();
            for (i, mon) in self.mons.iter().enumerate() {
                for (to, msg) in mon.messenger.take_sent() {
                    batch.push((i, to, msg));
                }
            }
            if batch.is_empty() {
                return delivered;
            }
            for (from_idx, to, msg) in batch {
                if drop(from_idx, to, &msg) {
                    continue;
                }
                let from = self.mons[from_idx].addr;
                match self.index_of(to) {
                    Some(target) => {
                        let now = self.now;
                        self.mons[target].monitor.dispatch(
                            Envelope {
                                from,
                                from_monitor: true,
                                received_at: now,
                                msg,
                            },
                            now,
                        );
                        delivered += 1;
                    }
                    None => {
                        self.client_traffic.push((from, to, msg));
                    }
                }
            }
        }
        delivered
    }

    /// Advance the clock and fire every timer that became due.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        for mon in &mut self.mons {
            mon.monitor.fire_due(now);
        }
    }

    /// Deliver a client message to monitor `i`.
    pub fn client_send(&mut self, i: usize, client: SocketAddr, msg: Message) {
        let now = self.now;
        self.mons[i].monitor.dispatch(
            Envelope {
                from: client,
                from_monitor: false,
                received_at: now,
                msg,
            },
            now,
        );
    }

    /// Resolve an election: `winner` wins with `members` as the quorum, the
    /// rest of `members` lose. Epochs on every member's elector stub are
    /// aligned first.
    pub fn run_election(&mut self, winner: usize, members: &[usize]) {
        let epoch = members
            .iter()
            .map(|&i| self.mons[i].elect.lock().epoch)
            .max()
            .unwrap_or(1)
            + 1;
        let quorum: BTreeSet<u32> = members
            .iter()
            .map(|&i| self.mons[i].monitor.rank().unwrap_or(i as u32))
            .collect();
        let winner_rank = self.mons[winner].monitor.rank().unwrap_or(winner as u32);
        let now = self.now;
        for &i in members {
            self.mons[i].elect.lock().epoch = epoch;
        }
        for &i in members {
            if i == winner {
                self.mons[i].monitor.win_election(epoch, quorum.clone(), now);
            } else {
                self.mons[i]
                    .monitor
                    .lose_election(epoch, quorum.clone(), winner_rank, now);
            }
        }
    }

    /// Messages captured for a given non-cluster destination.
    pub fn client_messages_to(&self, dest: SocketAddr) -> Vec<Message> {
        self.client_traffic
            .iter()
            .filter(|(_, to, _)| *to == dest)
            .map(|(_, _, msg)| msg.clone())
            .collect()
    }
}
