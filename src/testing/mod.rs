//! Deterministic testing infrastructure.
//!
//! Provides capture-based collaborator stubs and an in-memory multi-monitor
//! [`Cluster`] with scripted message delivery and manual clock control. No
//! real network or wall-clock timing is involved, so multi-monitor protocol
//! tests stay fast and reproducible.

mod cluster;

pub use cluster::Cluster;
pub use cluster::TestMonitor;

use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::election::Election;
use crate::messages::Message;
use crate::messenger::Messenger;
use crate::paxos::ReplicatedLog;
use crate::service::Service;
use crate::service::ServiceKind;
use crate::store::Store;

/// Encode a `u64` the way the stubs persist versions.
pub fn encode_u64(v: u64) -> Vec<u8> {
    postcard::to_stdvec(&v).unwrap_or_default()
}

/// Decode a `u64` persisted by [`encode_u64`].
pub fn decode_u64(bytes: &[u8]) -> Option<u64> {
    postcard::from_bytes(bytes).ok()
}

/// Messenger that records every send instead of touching a network.
pub struct CaptureMessenger {
    local: SocketAddr,
    /// Outbound messages in send order.
    pub sent: Arc<Mutex<VecDeque<(SocketAddr, Message)>>>,
    /// Addresses explicitly torn down.
    pub downed: Arc<Mutex<Vec<SocketAddr>>>,
    /// Number of mark-down-all calls.
    pub down_all_calls: Arc<Mutex<u32>>,
    /// Addresses reported as disconnected to `is_connected`.
    pub disconnected: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl CaptureMessenger {
    /// A messenger claiming to listen on `local`.
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            sent: Arc::new(Mutex::new(VecDeque::new())),
            downed: Arc::new(Mutex::new(Vec::new())),
            down_all_calls: Arc::new(Mutex::new(0)),
            disconnected: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Drain everything sent so far.
    pub fn take_sent(&self) -> Vec<(SocketAddr, Message)> {
        self.sent.lock().drain(..).collect()
    }
}

impl Messenger for CaptureMessenger {
    fn send(&self, to: SocketAddr, msg: Message) {
        self.sent.lock().push_back((to, msg));
    }

    fn mark_down(&self, addr: SocketAddr) {
        self.downed.lock().push(addr);
        self.disconnected.lock().insert(addr);
    }

    fn mark_down_all(&self) {
        *self.down_all_calls.lock() += 1;
    }

    fn is_connected(&self, addr: SocketAddr) -> bool {
        !self.disconnected.lock().contains(&addr)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Observable state of a [`StubLog`].
#[derive(Debug, Default)]
pub struct StubLogState {
    /// Latest committed version.
    pub version: u64,
    /// Oldest committed version.
    pub first_committed: u64,
    /// Whether the on-disk state reads as coherent.
    pub consistent: bool,
    /// Whether a trim is currently wanted.
    pub should_trim: bool,
    /// Nested trim suppressions currently held.
    pub trim_suppressions: u32,
    /// Total `trim_disable` calls observed.
    pub trim_disable_calls: u32,
    /// Total `trim_enable` calls observed.
    pub trim_enable_calls: u32,
    /// `init` calls.
    pub inits: u32,
    /// `leader_init` calls.
    pub leader_inits: u32,
    /// `peon_init` calls.
    pub peon_inits: u32,
    /// `restart` calls.
    pub restarts: u32,
    /// Log-module payloads handed over by the dispatch shell.
    pub dispatched: Vec<(SocketAddr, Vec<u8>)>,
}

/// Key under the log prefix where the stub persists its latest version.
pub const STUB_LOG_VERSION_KEY: &str = "last_committed";
/// Key under the log prefix where the stub persists its oldest version.
pub const STUB_LOG_FIRST_KEY: &str = "first_committed";

/// Replicated-log stub backed by shared observable state.
///
/// `init` reloads the version range from the store, which makes a completed
/// store sync visible the same way a real log module would see it.
pub struct StubLog {
    state: Arc<Mutex<StubLogState>>,
    store: Arc<dyn Store>,
}

impl StubLog {
    /// A stub reading its versions from `store`, starting at the given range.
    pub fn new(
        store: Arc<dyn Store>,
        version: u64,
        first_committed: u64,
    ) -> (Self, Arc<Mutex<StubLogState>>) {
        let state = Arc::new(Mutex::new(StubLogState {
            version,
            first_committed,
            consistent: true,
            ..Default::default()
        }));
        (
            Self {
                state: state.clone(),
                store,
            },
            state,
        )
    }
}

impl ReplicatedLog for StubLog {
    fn version(&self) -> u64 {
        self.state.lock().version
    }

    fn first_committed(&self) -> u64 {
        self.state.lock().first_committed
    }

    fn init(&mut self) {
        let mut state = self.state.lock();
        state.inits += 1;
        if let Some(v) = self
            .store
            .get(crate::store::PAXOS_PREFIX, STUB_LOG_VERSION_KEY)
            .as_deref()
            .and_then(decode_u64)
        {
            state.version = v;
        }
        if let Some(v) = self
            .store
            .get(crate::store::PAXOS_PREFIX, STUB_LOG_FIRST_KEY)
            .as_deref()
            .and_then(decode_u64)
        {
            state.first_committed = v;
        }
    }

    fn leader_init(&mut self) {
        self.state.lock().leader_inits += 1;
    }

    fn peon_init(&mut self) {
        self.state.lock().peon_inits += 1;
    }

    fn restart(&mut self) {
        self.state.lock().restarts += 1;
    }

    fn trim_disable(&mut self) {
        let mut state = self.state.lock();
        state.trim_suppressions += 1;
        state.trim_disable_calls += 1;
    }

    fn trim_enable(&mut self) {
        let mut state = self.state.lock();
        state.trim_suppressions = state.trim_suppressions.saturating_sub(1);
        state.trim_enable_calls += 1;
    }

    fn is_trim_disabled(&self) -> bool {
        self.state.lock().trim_suppressions > 0
    }

    fn should_trim(&self) -> bool {
        let state = self.state.lock();
        state.should_trim && state.trim_suppressions == 0
    }

    fn is_consistent(&self) -> bool {
        self.state.lock().consistent
    }

    fn dispatch(&mut self, from: SocketAddr, payload: Vec<u8>) {
        self.state.lock().dispatched.push((from, payload));
    }
}

/// Observable state of a [`StubElection`].
#[derive(Debug, Default)]
pub struct StubElectionState {
    /// Current election epoch.
    pub epoch: u64,
    /// `call_election` invocations.
    pub calls: u32,
    /// Whether we answer election traffic.
    pub participating: bool,
    /// Elector payloads handed over by the dispatch shell.
    pub dispatched: Vec<(SocketAddr, Vec<u8>)>,
    /// Whether `shutdown` ran.
    pub shut_down: bool,
}

/// Election stub that records calls; the test harness decides outcomes.
pub struct StubElection {
    state: Arc<Mutex<StubElectionState>>,
}

impl StubElection {
    /// A fresh stub at epoch 1.
    pub fn new() -> (Self, Arc<Mutex<StubElectionState>>) {
        let state = Arc::new(Mutex::new(StubElectionState {
            epoch: 1,
            participating: true,
            ..Default::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl Election for StubElection {
    fn call_election(&mut self) {
        let mut state = self.state.lock();
        state.calls += 1;
        state.epoch += 1;
    }

    fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    fn start_participating(&mut self) {
        self.state.lock().participating = true;
    }

    fn stop_participating(&mut self) {
        self.state.lock().participating = false;
    }

    fn dispatch(&mut self, from: SocketAddr, payload: Vec<u8>) {
        self.state.lock().dispatched.push((from, payload));
    }

    fn shutdown(&mut self) {
        self.state.lock().shut_down = true;
    }
}

/// Observable state of a [`StubService`].
#[derive(Debug, Default)]
pub struct StubServiceState {
    /// Reported map version.
    pub version: u64,
    /// Reported oldest version.
    pub first_committed: u64,
    /// `update_from_paxos` calls.
    pub updates: u32,
    /// `election_finished` calls.
    pub elections_finished: u32,
    /// `restart` calls.
    pub restarts: u32,
    /// `tick` calls.
    pub ticks: u32,
    /// Payloads handed over by the dispatch shell.
    pub dispatched: Vec<(SocketAddr, Vec<u8>)>,
    /// Whether `shutdown` ran.
    pub shut_down: bool,
}

/// Map-service stub that records every lifecycle call.
pub struct StubService {
    kind: ServiceKind,
    state: Arc<Mutex<StubServiceState>>,
}

impl StubService {
    /// A stub for `kind`.
    pub fn new(kind: ServiceKind) -> (Self, Arc<Mutex<StubServiceState>>) {
        let state = Arc::new(Mutex::new(StubServiceState::default()));
        (
            Self {
                kind,
                state: state.clone(),
            },
            state,
        )
    }
}

impl Service for StubService {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn version(&self) -> u64 {
        self.state.lock().version
    }

    fn first_committed(&self) -> u64 {
        self.state.lock().first_committed
    }

    fn update_from_paxos(&mut self) {
        self.state.lock().updates += 1;
    }

    fn election_finished(&mut self) {
        self.state.lock().elections_finished += 1;
    }

    fn restart(&mut self) {
        self.state.lock().restarts += 1;
    }

    fn tick(&mut self) {
        self.state.lock().ticks += 1;
    }

    fn dispatch(&mut self, from: SocketAddr, payload: Vec<u8>) {
        self.state.lock().dispatched.push((from, payload));
    }

    fn shutdown(&mut self) {
        self.state.lock().shut_down = true;
    }
}
