//! The monitor core: lifecycle state machine and dispatch shell.
//!
//! A monitor is one of a small odd-sized set of processes jointly keeping the
//! authoritative cluster state alive through a replicated log. This module
//! owns the top-level state machine (probing, electing, synchronizing,
//! leader/peon) and the per-message admission and routing; the log, the
//! elector, and the map services are trait collaborators.
//!
//! Everything here runs single-threaded: the runtime shell serializes
//! message delivery, timer firings, and admin queries onto one owner.

mod router;
mod sync;

pub use router::RoutedRequest;
pub use sync::LeaderKillPoint;
pub use sync::ProviderKillPoint;
pub use sync::RequesterKillPoint;
pub use sync::SyncPeer;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::caps::CapabilityGrant;
use crate::caps::CAP_R;
use crate::caps::CAP_X;
use crate::config::MonitorConfig;
use crate::election::Election;
use crate::error::CommandError;
use crate::messages::Message;
use crate::messages::MonCommand;
use crate::messages::MonCommandAck;
use crate::messages::MonGetVersion;
use crate::messages::MonGetVersionReply;
use crate::messages::MonJoin;
use crate::messages::MonProbe;
use crate::messages::MonSubscribe;
use crate::messages::MonSubscribeAck;
use crate::messages::ProbeOp;
use crate::messenger::Messenger;
use crate::metrics::ClusterMetrics;
use crate::paxos::ReplicatedLog;
use crate::peer_map::is_blank_addr;
use crate::peer_map::PeerMap;
use crate::service::Service;
use crate::service::ServiceKind;
use crate::session::SessionMap;
use crate::store::flag_is_set;
use crate::store::Store;
use crate::store::Transaction;
use crate::store::FORCE_SYNC_KEY;
use crate::store::IN_SYNC_KEY;
use crate::store::JOINED_KEY;
use crate::store::MONITOR_PREFIX;
use crate::store::PAXOS_PREFIX;
use crate::store::SYNC_PREFIX;
use crate::timer::TimerEvent;
use crate::timer::TimerHandle;
use crate::timer::TimerQueue;

/// Top-level monitor state. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Discovering peers and the current committed map.
    Probing,
    /// An election round is in flight.
    Electing,
    /// Catching up our store from a quorum member.
    Synchronizing,
    /// Won the last election.
    Leader,
    /// Lost the last election; following the leader.
    Peon,
    /// Terminal.
    ShuttingDown,
}

impl LifecycleState {
    /// Operator-facing name.
    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Probing => "probing",
            LifecycleState::Electing => "electing",
            LifecycleState::Synchronizing => "synchronizing",
            LifecycleState::Leader => "leader",
            LifecycleState::Peon => "peon",
            LifecycleState::ShuttingDown => "shutdown",
        }
    }
}

/// Independent bitset of sync duties a monitor may hold at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRole(u8);

impl SyncRole {
    /// Catching-up monitor consuming chunks.
    pub const REQUESTER: SyncRole = SyncRole(0x1);
    /// Quorum member streaming chunks.
    pub const PROVIDER: SyncRole = SyncRole(0x2);
    /// Elected leader coordinating trim suppression.
    pub const LEADER: SyncRole = SyncRole(0x4);

    /// No duties.
    pub fn none() -> Self {
        SyncRole(0)
    }

    /// Whether every bit of `role` is held.
    pub fn contains(self, role: SyncRole) -> bool {
        self.0 & role.0 == role.0
    }

    /// Add duties.
    pub fn insert(&mut self, role: SyncRole) {
        self.0 |= role.0;
    }

    /// Drop duties.
    pub fn remove(&mut self, role: SyncRole) {
        self.0 &= !role.0;
    }

    /// Whether no duty is held.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Progress of the requester-side sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Not synchronizing.
    None,
    /// Waiting for the leader to accept.
    Start,
    /// Consuming the chunk stream.
    Chunks,
    /// Waiting for the finish acknowledgement.
    Stop,
}

/// Per-requester session state tracked by the sync leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderSyncState {
    /// The only state a session occupies for its whole lifetime.
    Start,
}

/// Sync-leader bookkeeping, guarded separately so the admin surface can read
/// it while dispatch holds the monitor. Always acquired after the monitor
/// lock; never inverted.
#[derive(Debug, Default)]
pub struct TrimState {
    /// Per-requester trim deadline timers.
    pub timeouts: HashMap<SocketAddr, TimerHandle>,
    /// Per-requester session states.
    pub states: HashMap<SocketAddr, LeaderSyncState>,
    /// Pending delayed re-enable of log trimming.
    pub reenable_timer: Option<TimerHandle>,
}

/// One inbound message plus its transport context.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sender address.
    pub from: SocketAddr,
    /// Whether the transport authenticated the sender as a monitor.
    pub from_monitor: bool,
    /// When the message arrived.
    pub received_at: Instant,
    /// The message.
    pub msg: Message,
}

/// The monitor core.
pub struct Monitor {
    pub(crate) name: String,
    pub(crate) config: Arc<MonitorConfig>,
    pub(crate) rank: Option<u32>,
    pub(crate) has_ever_joined: bool,
    pub(crate) fenced: bool,
    pub(crate) state: LifecycleState,

    pub(crate) peer_map: PeerMap,
    pub(crate) quorum: BTreeSet<u32>,
    pub(crate) outside_quorum: BTreeSet<String>,
    pub(crate) extra_probe_peers: BTreeSet<SocketAddr>,
    pub(crate) leader: Option<u32>,
    pub(crate) leader_since: Option<Instant>,
    pub(crate) exited_quorum: Option<Instant>,

    pub(crate) store: Arc<dyn Store>,
    pub(crate) paxos: Box<dyn ReplicatedLog>,
    pub(crate) elector: Box<dyn Election>,
    pub(crate) services: Vec<Box<dyn Service>>,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) metrics: Arc<dyn ClusterMetrics>,
    metrics_registered: bool,

    pub(crate) timer: TimerQueue,
    probe_timeout_event: Option<TimerHandle>,

    pub(crate) sessions: SessionMap,
    waitlist: Vec<Envelope>,
    waitfor_quorum: Vec<Envelope>,

    pub(crate) routed_requests: BTreeMap<u64, RoutedRequest>,
    pub(crate) routed_request_tid: u64,

    pub(crate) sync_role: SyncRole,
    pub(crate) sync_phase: SyncPhase,
    pub(crate) sync_leader: Option<SyncPeer>,
    pub(crate) sync_provider: Option<SyncPeer>,
    pub(crate) sync_entities: HashMap<SocketAddr, sync::ProviderEntity>,
    pub(crate) trim: Arc<Mutex<TrimState>>,
}

impl Monitor {
    /// Construct a monitor around its collaborators. Call [`Monitor::init`]
    /// before delivering anything.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        config: MonitorConfig,
        peer_map: PeerMap,
        store: Arc<dyn Store>,
        paxos: Box<dyn ReplicatedLog>,
        elector: Box<dyn Election>,
        services: Vec<Box<dyn Service>>,
        messenger: Arc<dyn Messenger>,
        metrics: Arc<dyn ClusterMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            rank: None,
            has_ever_joined: false,
            fenced: false,
            state: LifecycleState::Probing,
            peer_map,
            quorum: BTreeSet::new(),
            outside_quorum: BTreeSet::new(),
            extra_probe_peers: BTreeSet::new(),
            leader: None,
            leader_since: None,
            exited_quorum: None,
            store,
            paxos,
            elector,
            services,
            messenger,
            metrics,
            metrics_registered: false,
            timer: TimerQueue::new(),
            probe_timeout_event: None,
            sessions: SessionMap::new(),
            waitlist: Vec::new(),
            waitfor_quorum: Vec::new(),
            routed_requests: BTreeMap::new(),
            routed_request_tid: 0,
            sync_role: SyncRole::none(),
            sync_phase: SyncPhase::None,
            sync_leader: None,
            sync_provider: None,
            sync_entities: HashMap::new(),
            trim: Arc::new(Mutex::new(TrimState::default())),
        }
    }

    /// Load durable state, clean up after interrupted syncs, initialize the
    /// log, and enter probing.
    pub fn init(&mut self, now: Instant) {
        tracing::info!(name = %self.name, fsid = %self.peer_map.fsid, "monitor init");

        self.has_ever_joined = flag_is_set(&*self.store, MONITOR_PREFIX, JOINED_KEY);
        tracing::debug!(has_ever_joined = self.has_ever_joined, "loaded join marker");

        if !self.has_ever_joined && !self.config.initial_members.is_empty() {
            let initial = self.config.initial_members.clone();
            tracing::info!(?initial, "filtering seed peer map to initial members");
            let displaced = self.peer_map.set_initial_members(
                &initial,
                &self.name,
                self.messenger.local_addr(),
            );
            self.extra_probe_peers.extend(displaced);
        }

        // A leftover in_sync or force_sync marker means the store may be
        // inconsistent. Start from a clean slate.
        let mut clear_store = false;
        if flag_is_set(&*self.store, SYNC_PREFIX, IN_SYNC_KEY) {
            tracing::warn!("previous sync never finished; clearing potentially inconsistent store");
            clear_store = true;
        }
        if flag_is_set(&*self.store, SYNC_PREFIX, FORCE_SYNC_KEY) {
            tracing::warn!("force_sync marker set; clearing store state");
            clear_store = true;
        }
        if clear_store {
            let mut prefixes = self.sync_target_prefixes();
            prefixes.insert(SYNC_PREFIX.to_string());
            self.store.clear_prefixes(&prefixes);
        }

        self.init_paxos();

        self.exited_quorum = Some(now);
        self.timer
            .schedule(now, self.config.tick_interval, TimerEvent::Tick);
        self.bootstrap(now);
    }

    fn init_paxos(&mut self) {
        self.paxos.init();
        if self.paxos.is_consistent() {
            for service in &mut self.services {
                service.update_from_paxos();
            }
        }
    }

    /// Store prefixes copied wholesale during a sync: every service prefix
    /// plus the log's own.
    pub(crate) fn sync_target_prefixes(&self) -> BTreeSet<String> {
        let mut prefixes: BTreeSet<String> =
            ServiceKind::ALL.iter().map(|k| k.prefix().to_string()).collect();
        prefixes.insert(PAXOS_PREFIX.to_string());
        prefixes
    }

    // ---- accessors ----------------------------------------------------

    /// Configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rank in the peer map, if any.
    pub fn rank(&self) -> Option<u32> {
        self.rank
    }

    /// This monitor's identity as derived from the peer map.
    pub fn id(&self) -> crate::peer_map::MonitorId {
        crate::peer_map::MonitorId {
            name: self.name.clone(),
            rank: self.rank,
            addr: self.messenger.local_addr(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Current sync duties.
    pub fn sync_role(&self) -> SyncRole {
        self.sync_role
    }

    /// Current quorum (ranks).
    pub fn quorum(&self) -> &BTreeSet<u32> {
        &self.quorum
    }

    /// The peer map.
    pub fn peer_map(&self) -> &PeerMap {
        &self.peer_map
    }

    /// Whether this monitor fenced itself after removal from the map.
    pub fn is_fenced(&self) -> bool {
        self.fenced
    }

    /// Whether we currently lead the quorum.
    pub fn is_leader(&self) -> bool {
        self.state == LifecycleState::Leader
    }

    /// Whether we follow the current leader.
    pub fn is_peon(&self) -> bool {
        self.state == LifecycleState::Peon
    }

    /// Whether we are probing.
    pub fn is_probing(&self) -> bool {
        self.state == LifecycleState::Probing
    }

    /// Whether a store sync is in flight.
    pub fn is_synchronizing(&self) -> bool {
        self.state == LifecycleState::Synchronizing
    }

    /// Rank of the current leader.
    pub fn leader_rank(&self) -> Option<u32> {
        self.leader
    }

    /// Earliest deadline among scheduled timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.next_deadline()
    }

    /// Current requester-side sync phase.
    pub fn sync_phase(&self) -> SyncPhase {
        self.sync_phase
    }

    /// Whether a session exists for `addr`.
    pub fn has_session(&self, addr: &SocketAddr) -> bool {
        self.sessions.get(addr).is_some()
    }

    /// Replace the capabilities on an existing session.
    ///
    /// This is the seam the auth service uses once it has authenticated the
    /// entity behind the connection.
    pub fn set_session_caps(&mut self, addr: &SocketAddr, caps: CapabilityGrant) -> bool {
        match self.sessions.get_mut(addr) {
            Some(session) => {
                session.caps = caps;
                true
            }
            None => false,
        }
    }

    /// Number of outstanding routed requests.
    pub fn routed_request_count(&self) -> usize {
        self.routed_requests.len()
    }

    /// Ids of outstanding routed requests, ascending.
    pub fn routed_request_tids(&self) -> Vec<u64> {
        self.routed_requests.keys().copied().collect()
    }

    // ---- lifecycle ----------------------------------------------------

    /// Re-enter probing: refresh rank, reset connections and sync state,
    /// then either self-elect (singleton map) or probe every peer.
    pub fn bootstrap(&mut self, now: Instant) {
        tracing::debug!(name = %self.name, "bootstrap");

        self.unregister_metrics();
        self.cancel_probe_timeout();

        let my_addr = self.messenger.local_addr();
        let new_rank = self.peer_map.rank_of_addr(&my_addr);
        if new_rank.is_none() && self.rank.is_some() && self.has_ever_joined {
            tracing::error!(name = %self.name, "removed from the peer map; fencing");
            self.fence();
            return;
        }
        if new_rank != self.rank {
            tracing::info!(old = ?self.rank, new = ?new_rank, "rank changed");
            self.rank = new_rank;
            // Peers would otherwise keep talking to our old identity.
            self.messenger.mark_down_all();
        }

        self.reset_sync();
        self.state = LifecycleState::Probing;
        self.reset(now);

        if self.peer_map.len() == 1 && self.rank == Some(0) {
            self.win_standalone_election(now);
            return;
        }

        self.reset_probe_timeout(now);

        if self.peer_map.contains_name(&self.name) {
            self.outside_quorum.insert(self.name.clone());
        }

        tracing::debug!("probing other monitors");
        let probe = Message::Probe(self.make_probe(ProbeOp::Probe));
        let peers: Vec<SocketAddr> = self
            .peer_map
            .members()
            .map(|m| m.addr)
            .filter(|a| *a != my_addr && !is_blank_addr(a))
            .collect();
        for peer in peers {
            self.messenger.send(peer, probe.clone());
        }
        for peer in self.extra_probe_peers.clone() {
            if peer != my_addr {
                self.messenger.send(peer, probe.clone());
            }
        }
    }

    fn make_probe(&self, op: ProbeOp) -> MonProbe {
        MonProbe {
            fsid: self.peer_map.fsid,
            op,
            name: self.name.clone(),
            has_ever_joined: self.has_ever_joined,
            quorum: self.quorum.clone(),
            peer_map: self.peer_map.encode(),
            paxos_first: self.paxos.first_committed(),
            paxos_last: self.paxos.version(),
        }
    }

    /// Drop quorum-derived state; called on bootstrap and when an election
    /// starts from leader/peon.
    fn reset(&mut self, now: Instant) {
        tracing::debug!("reset");
        self.leader_since = None;
        if !self.quorum.is_empty() {
            self.exited_quorum = Some(now);
        }
        self.quorum.clear();
        self.outside_quorum.clear();
        self.paxos.restart();
        for service in &mut self.services {
            service.restart();
        }
    }

    fn fence(&mut self) {
        let err = crate::error::MonitorError::Fenced;
        tracing::error!(%err, name = %self.name);
        self.fenced = true;
        self.state = LifecycleState::ShuttingDown;
        self.timer.clear();
    }

    /// Terminal teardown: services, elector, timers.
    pub fn shutdown(&mut self) {
        tracing::info!(name = %self.name, "shutdown");
        self.state = LifecycleState::ShuttingDown;
        self.elector.shutdown();
        for service in &mut self.services {
            service.shutdown();
        }
        self.timer.clear();
    }

    // ---- probing ------------------------------------------------------

    fn cancel_probe_timeout(&mut self) {
        if let Some(handle) = self.probe_timeout_event.take() {
            self.timer.cancel(handle);
        }
    }

    fn reset_probe_timeout(&mut self, now: Instant) {
        self.cancel_probe_timeout();
        let handle = self
            .timer
            .schedule(now, self.config.probe_timeout, TimerEvent::ProbeTimeout);
        self.probe_timeout_event = Some(handle);
    }

    fn probe_timeout(&mut self, now: Instant) {
        tracing::debug!("probe timeout, re-bootstrapping");
        self.probe_timeout_event = None;
        if self.is_probing() || self.is_synchronizing() {
            self.bootstrap(now);
        }
    }

    fn handle_probe(&mut self, from: SocketAddr, m: MonProbe, now: Instant) {
        if m.fsid != self.peer_map.fsid {
            tracing::debug!(theirs = %m.fsid, ours = %self.peer_map.fsid, "ignoring probe with foreign fsid");
            return;
        }
        match m.op {
            ProbeOp::Probe => self.handle_probe_probe(from),
            ProbeOp::Reply => self.handle_probe_reply(from, m, now),
        }
    }

    fn handle_probe_probe(&mut self, from: SocketAddr) {
        tracing::debug!(peer = %from, "probe received");
        let reply = Message::Probe(self.make_probe(ProbeOp::Reply));
        self.messenger.send(from, reply);

        // A prober we do not know about is a bootstrap hint.
        if !self.peer_map.contains_addr(&from) {
            tracing::debug!(peer = %from, "adding prober to bootstrap hints");
            self.extra_probe_peers.insert(from);
        }
    }

    fn handle_probe_reply(&mut self, from: SocketAddr, m: MonProbe, now: Instant) {
        tracing::debug!(peer = %from, name = %m.name, first = m.paxos_first, last = m.paxos_last, "probe reply");

        if !self.is_probing() {
            return;
        }

        // Adopt a newer committed map, but only from a peer that has
        // actually been part of a quorum. Replacement never goes backward.
        if let Some(new_map) = PeerMap::decode(&m.peer_map) {
            if new_map != self.peer_map
                && m.has_ever_joined
                && (new_map.epoch > self.peer_map.epoch || !self.has_ever_joined)
            {
                tracing::info!(
                    theirs = new_map.epoch,
                    ours = self.peer_map.epoch,
                    "adopting newer committed peer map"
                );
                self.peer_map = new_map;
                self.bootstrap(now);
                return;
            }
        }

        // Fix up a placeholder name in a seed map.
        if self.peer_map.epoch == 0 {
            if let Some(peer_name) = self.peer_map.name_of_addr(&from).map(String::from) {
                if peer_name.starts_with("noname-") && peer_name != m.name {
                    tracing::debug!(old = %peer_name, new = %m.name, "renaming peer in seed map");
                    self.peer_map.rename(&peer_name, m.name.clone());
                }
            }
        }

        // Learn a member's real address.
        if let Some(addr) = self.peer_map.addr_of_name(&m.name) {
            if is_blank_addr(&addr) {
                tracing::info!(name = %m.name, addr = %from, "learned initial peer address");
                self.peer_map.set_addr(&m.name, from);
                self.bootstrap(now);
                return;
            }
        }

        if !m.quorum.is_empty() {
            tracing::debug!(quorum = ?m.quorum, "peer reports an existing quorum");
            if self.paxos.version() + self.config.max_join_drift < m.paxos_last {
                tracing::info!(
                    peer_version = m.paxos_last,
                    our_version = self.paxos.version(),
                    "too far behind the quorum; starting store sync"
                );
                self.sync_start(from, now);
                return;
            }
            let my_addr = self.messenger.local_addr();
            let in_map = self
                .peer_map
                .addr_of_name(&self.name)
                .map(|a| !is_blank_addr(&a))
                .unwrap_or(false);
            if in_map {
                self.start_election();
            } else {
                tracing::debug!("not in the peer map yet; asking to join");
                let target = m
                    .quorum
                    .iter()
                    .next()
                    .and_then(|rank| self.peer_map.addr_of_rank(*rank))
                    .unwrap_or(from);
                self.messenger.send(
                    target,
                    Message::Join(MonJoin {
                        fsid: self.peer_map.fsid,
                        name: self.name.clone(),
                        addr: my_addr,
                    }),
                );
            }
        } else {
            // No quorum anywhere yet. Make sure our store is close enough
            // for an election to produce a usable leader.
            if m.paxos_first > self.paxos.version() {
                tracing::info!(
                    peer_first = m.paxos_first,
                    our_version = self.paxos.version(),
                    "peer's oldest version is ahead of us; starting store sync"
                );
                self.sync_start(from, now);
                return;
            }
            if self.paxos.first_committed() > m.paxos_last {
                tracing::debug!(peer = %from, "waiting for peer to sync from us");
                return;
            }

            if self.peer_map.contains_name(&m.name) {
                self.outside_quorum.insert(m.name.clone());
            } else {
                tracing::debug!(name = %m.name, "prober not in the peer map; ignoring for quorum counting");
            }

            let need = self.peer_map.len() / 2 + 1;
            tracing::debug!(outside = ?self.outside_quorum, need, "counting monitors outside quorum");
            if self.outside_quorum.len() >= need {
                if self.outside_quorum.contains(&self.name) {
                    tracing::info!("enough monitors outside quorum; calling election");
                    self.start_election();
                } else {
                    tracing::debug!("enough for a quorum, but it does not include us; waiting");
                }
            }
        }
    }

    // ---- elections ----------------------------------------------------

    fn start_election(&mut self) {
        tracing::info!(name = %self.name, "calling for a new election");
        self.cancel_probe_timeout();
        self.state = LifecycleState::Electing;
        self.elector.call_election();
    }

    fn win_standalone_election(&mut self, now: Instant) {
        tracing::info!("single-member map; electing self");
        self.rank = self.peer_map.rank_of_name(&self.name);
        let rank = self.rank.unwrap_or(0);
        let mut quorum = BTreeSet::new();
        quorum.insert(rank);
        let epoch = self.elector.epoch().max(1);
        self.win_election(epoch, quorum, now);
    }

    /// Callback from the election module: we won.
    pub fn win_election(&mut self, epoch: u64, active: BTreeSet<u32>, now: Instant) {
        if self.state != LifecycleState::Electing {
            self.reset(now);
        }
        self.state = LifecycleState::Leader;
        self.leader_since = Some(now);
        self.leader = self.rank;
        self.quorum = active;
        self.outside_quorum.clear();
        tracing::info!(epoch, quorum = ?self.quorum, "won leader election");

        self.paxos.leader_init();
        for service in &mut self.services {
            service.election_finished();
        }
        self.finish_election(now);
    }

    /// Callback from the election module: we lost; follow `leader`.
    pub fn lose_election(&mut self, epoch: u64, quorum: BTreeSet<u32>, leader: u32, now: Instant) {
        self.state = LifecycleState::Peon;
        self.leader_since = None;
        self.leader = Some(leader);
        self.quorum = quorum;
        self.outside_quorum.clear();
        tracing::info!(epoch, leader, quorum = ?self.quorum, "lost election");

        // Any requester we were coordinating must abort before the next
        // tick: the new leader owns trim suppression now.
        self.sync_leader_abort_all();

        self.paxos.peon_init();
        for service in &mut self.services {
            service.election_finished();
        }
        self.finish_election(now);
    }

    fn finish_election(&mut self, now: Instant) {
        self.exited_quorum = None;

        let waiting: Vec<Envelope> = self
            .waitfor_quorum
            .drain(..)
            .chain(self.waitlist.drain(..))
            .collect();
        for env in waiting {
            self.dispatch(env, now);
        }

        self.resend_routed_requests();
        self.register_metrics();
        self.update_metrics();

        // If the map knows us under another name, ask the quorum to fix it.
        let my_addr = self.messenger.local_addr();
        let mapped = self.peer_map.name_of_addr(&my_addr).map(String::from);
        if mapped.as_deref() != Some(self.name.as_str()) {
            if let Some(target) = self
                .quorum
                .iter()
                .next()
                .and_then(|rank| self.peer_map.addr_of_rank(*rank))
            {
                tracing::debug!(mapped = ?mapped, name = %self.name, "renaming self in the peer map");
                self.messenger.send(
                    target,
                    Message::Join(MonJoin {
                        fsid: self.peer_map.fsid,
                        name: self.name.clone(),
                        addr: my_addr,
                    }),
                );
            }
        }
    }

    /// Record that we have joined a quorum at least once.
    ///
    /// Called by the map service once our membership commits; also flips the
    /// durable marker consulted at startup.
    pub fn note_joined(&mut self) {
        if !self.has_ever_joined {
            self.has_ever_joined = true;
            let mut tx = Transaction::new();
            tx.put(MONITOR_PREFIX, JOINED_KEY, vec![1]);
            if let Err(err) = self.store.apply(tx) {
                tracing::error!(%err, "failed to persist join marker");
            }
        }
    }

    fn register_metrics(&mut self) {
        if !self.metrics_registered {
            self.metrics_registered = true;
        }
    }

    fn unregister_metrics(&mut self) {
        self.metrics_registered = false;
    }

    fn update_metrics(&self) {
        if self.metrics_registered {
            self.metrics.set_peer_count(self.peer_map.len() as u64);
            self.metrics.set_quorum_count(self.quorum.len() as u64);
        }
    }

    // ---- dispatch shell ------------------------------------------------

    /// Entry point for every inbound message.
    pub fn dispatch(&mut self, env: Envelope, now: Instant) {
        if self.state == LifecycleState::ShuttingDown {
            return;
        }

        // Session admission.
        let mut reuse_caps: Option<CapabilityGrant> = None;
        if let Some(session) = self.sessions.get(&env.from) {
            if session.closed {
                reuse_caps = Some(session.caps.clone());
                self.sessions.remove(&env.from);
            }
        }
        if self.sessions.get(&env.from).is_none() {
            let bypasses_gate = env.from_monitor
                || matches!(env.msg, Message::Command(_))
                || matches!(
                    env.msg,
                    Message::Service {
                        kind: ServiceKind::Auth,
                        ..
                    }
                );
            if self.exited_quorum.is_some() && !bypasses_gate {
                // Out of quorum: hold recent messages until we are back in,
                // or send the client elsewhere.
                if env.received_at + self.config.lease > now
                    && self.messenger.is_connected(env.from)
                {
                    tracing::debug!(from = %env.from, msg = env.msg.type_name(), "waitlisting until we regain quorum");
                    self.waitlist.push(env);
                } else {
                    tracing::debug!(from = %env.from, "out of quorum too long; sending client elsewhere");
                    self.messenger.mark_down(env.from);
                }
                return;
            }
            let session = self.sessions.insert(env.from, env.from_monitor, now);
            if env.from_monitor {
                // Peer type was authenticated by the transport.
                session.caps = CapabilityGrant::allow_all();
            } else {
                session.until = Some(now + self.config.subscribe_interval);
                if let Some(caps) = reuse_caps {
                    session.caps = caps;
                }
            }
        }

        let Envelope {
            from,
            from_monitor,
            received_at,
            msg,
        } = env;

        match msg {
            Message::Route(m) => self.handle_route(from, m),
            Message::GetMap => self.send_latest_peer_map(from),
            Message::GetVersion(m) => self.handle_get_version(from, m),
            Message::Command(m) => self.handle_command(
                Envelope {
                    from,
                    from_monitor,
                    received_at,
                    msg: Message::Command(m),
                },
                now,
            ),
            Message::Subscribe(m) => self.handle_subscribe(from, m, now),
            Message::Probe(m) => self.handle_probe(from, m, now),
            Message::Sync(m) => self.handle_sync(from, m, now),
            Message::Join(m) => {
                let payload = Message::Join(m).to_bytes();
                if let Some(service) = self.service_mut(ServiceKind::MonMap) {
                    service.dispatch(from, payload);
                }
            }
            Message::Paxos(m) => {
                let caps_ok = from_monitor
                    || self
                        .sessions
                        .get(&from)
                        .map(|s| s.caps.check(ServiceKind::MonMap, CAP_X))
                        .unwrap_or(false);
                if !caps_ok {
                    tracing::debug!(from = %from, "dropping log traffic from entity without coordinate caps");
                    return;
                }
                let current = self.elector.epoch();
                if m.epoch > current {
                    tracing::debug!(theirs = m.epoch, ours = current, "log epoch ahead of us; re-bootstrapping");
                    self.bootstrap(now);
                } else if m.epoch == current {
                    self.paxos.dispatch(from, m.payload);
                    if self.paxos.is_consistent() {
                        for service in &mut self.services {
                            service.update_from_paxos();
                        }
                    }
                }
                // Older epochs are stale; drop silently.
            }
            Message::Election(m) => {
                if let Some(session) = self.sessions.get(&from) {
                    if !session.caps.check(ServiceKind::MonMap, CAP_X) {
                        tracing::warn!(from = %from, "election traffic from entity without coordinate caps");
                    }
                }
                if !self.is_probing() && !self.is_synchronizing() {
                    self.elector.dispatch(from, m.payload);
                }
            }
            Message::Forward(m) => self.handle_forward(from, m, now),
            Message::Service { kind, payload } => {
                if let Some(service) = self.service_mut(kind) {
                    service.dispatch(from, payload);
                }
            }
            other => {
                tracing::debug!(from = %from, msg = other.type_name(), "dropping unexpected message");
            }
        }
    }

    pub(crate) fn service_mut(&mut self, kind: ServiceKind) -> Option<&mut Box<dyn Service>> {
        self.services.iter_mut().find(|s| s.kind() == kind)
    }

    pub(crate) fn service(&self, kind: ServiceKind) -> Option<&dyn Service> {
        self.services
            .iter()
            .find(|s| s.kind() == kind)
            .map(|s| s.as_ref())
    }

    /// The transport lost a connection.
    pub fn handle_connection_reset(&mut self, addr: SocketAddr) {
        if self.state == LifecycleState::ShuttingDown {
            return;
        }
        // Monitor sessions are lossless; only client sessions die with the
        // connection.
        let is_monitor = self
            .sessions
            .get(&addr)
            .map(|s| s.is_monitor)
            .unwrap_or(false);
        if is_monitor {
            return;
        }
        tracing::debug!(%addr, "connection reset; closing session");
        self.remove_session(addr);
    }

    // ---- subscriptions and map queries ---------------------------------

    fn send_latest_peer_map(&self, to: SocketAddr) {
        self.messenger
            .send(to, Message::PeerMap(self.peer_map.encode()));
    }

    fn handle_get_version(&mut self, from: SocketAddr, m: MonGetVersion) {
        if self.sessions.get(&from).is_none() {
            return;
        }
        let mut reply = MonGetVersionReply {
            handle: m.handle,
            version: 0,
            oldest_version: 0,
        };
        match ServiceKind::from_prefix(&m.what) {
            Some(ServiceKind::MonMap) => {
                reply.version = self.peer_map.epoch;
                reply.oldest_version = self
                    .service(ServiceKind::MonMap)
                    .map(|s| s.first_committed())
                    .unwrap_or(0);
            }
            Some(kind) => {
                if let Some(service) = self.service(kind) {
                    reply.version = service.version();
                    reply.oldest_version = service.first_committed();
                }
            }
            None => {
                tracing::warn!(what = %m.what, "version query for unknown map");
            }
        }
        self.messenger.send(from, Message::GetVersionReply(reply));
    }

    fn handle_subscribe(&mut self, from: SocketAddr, m: MonSubscribe, now: Instant) {
        let Some(session) = self.sessions.get_mut(&from) else {
            tracing::debug!(%from, "subscribe without a session; dropping");
            return;
        };
        session.until = Some(now + self.config.subscribe_interval);

        let mut reply = false;
        for (what, item) in &m.what {
            if !item.onetime {
                reply = true;
            }
            session.update_sub(what, *item);
        }
        if m.what.contains_key(ServiceKind::MonMap.prefix()) {
            self.check_monmap_sub(from);
        }
        if reply {
            self.messenger.send(
                from,
                Message::SubscribeAck(MonSubscribeAck {
                    fsid: self.peer_map.fsid,
                    interval_secs: self.config.subscribe_interval.as_secs() as u32,
                }),
            );
        }
    }

    /// Push the peer map to every session whose subscription is behind.
    pub fn check_monmap_subs(&mut self) {
        for addr in self.sessions.addrs() {
            self.check_monmap_sub(addr);
        }
    }

    fn check_monmap_sub(&mut self, addr: SocketAddr) {
        let epoch = self.peer_map.epoch;
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let key = ServiceKind::MonMap.prefix();
        let Some(sub) = session.subs.get_mut(key) else {
            return;
        };
        if sub.next > epoch {
            return;
        }
        if sub.onetime {
            session.subs.remove(key);
        } else {
            sub.next = epoch + 1;
        }
        self.send_latest_peer_map(addr);
    }

    // ---- commands -------------------------------------------------------

    fn handle_command(&mut self, env: Envelope, now: Instant) {
        let Message::Command(cmd) = env.msg.clone() else {
            return;
        };
        let cmd = &cmd;
        let from = env.from;
        let from_monitor = env.from_monitor;

        if cmd.fsid != self.peer_map.fsid {
            tracing::debug!(theirs = %cmd.fsid, "command for a foreign cluster");
            self.reply_command(
                from,
                from_monitor,
                cmd,
                CommandError::NotPermitted.code(),
                "wrong fsid".to_string(),
                Vec::new(),
            );
            return;
        }

        let Some(caps) = self.sessions.get(&from).map(|s| s.caps.clone()) else {
            self.reply_command(
                from,
                from_monitor,
                cmd,
                CommandError::AccessDenied.code(),
                "access denied".to_string(),
                Vec::new(),
            );
            return;
        };

        let access_cmd = caps.allows_command(&cmd.args);
        let access_r = access_cmd || caps.check(ServiceKind::MonMap, CAP_R);
        let access_all = access_cmd || caps.is_allow_all();

        let Some(first) = cmd.args.first().map(String::from) else {
            self.reply_command(
                from,
                from_monitor,
                cmd,
                CommandError::Invalid.code(),
                "empty command".to_string(),
                Vec::new(),
            );
            return;
        };

        // Map-owned commands go to the owning service untouched.
        if let Some(kind) = ServiceKind::from_command_prefix(&first) {
            let payload = env.msg.to_bytes();
            if let Some(service) = self.service_mut(kind) {
                service.dispatch(from, payload);
            }
            return;
        }

        let denied = |mon: &mut Monitor, cmd: &MonCommand| {
            mon.reply_command(
                from,
                from_monitor,
                cmd,
                CommandError::AccessDenied.code(),
                "access denied".to_string(),
                Vec::new(),
            );
        };

        match first.as_str() {
            "fsid" => {
                let fsid = self.peer_map.fsid.to_string();
                self.reply_command(from, from_monitor, cmd, 0, fsid, Vec::new());
            }
            "mon_status" => {
                if !access_r {
                    denied(self, cmd);
                    return;
                }
                let doc = crate::admin::mon_status(self);
                self.reply_json(from, from_monitor, cmd, doc);
            }
            "quorum_status" => {
                if !access_r {
                    denied(self, cmd);
                    return;
                }
                if !self.is_leader() && !self.is_peon() {
                    tracing::debug!("quorum_status waiting for quorum");
                    self.waitfor_quorum.push(env);
                    return;
                }
                let doc = crate::admin::quorum_status(self);
                self.reply_json(from, from_monitor, cmd, doc);
            }
            "sync_status" => {
                if !access_r {
                    denied(self, cmd);
                    return;
                }
                let doc = crate::admin::sync_status(self);
                self.reply_json(from, from_monitor, cmd, doc);
            }
            "sync_force" => {
                if !access_r {
                    denied(self, cmd);
                    return;
                }
                let status = crate::admin::sync_force(self);
                self.reply_command(from, from_monitor, cmd, 0, status, Vec::new());
            }
            "add_bootstrap_peer_hint" => {
                if !access_all {
                    denied(self, cmd);
                    return;
                }
                let arg = cmd.args.get(1).cloned().unwrap_or_default();
                let (code, status) = crate::admin::add_bootstrap_peer_hint(self, &arg);
                self.reply_command(from, from_monitor, cmd, code, status, Vec::new());
            }
            "quorum" => {
                if !access_all {
                    denied(self, cmd);
                    return;
                }
                match cmd.args.get(1).map(String::as_str) {
                    Some("exit") => {
                        self.reset(now);
                        self.start_election();
                        self.elector.stop_participating();
                        self.reply_command(
                            from,
                            from_monitor,
                            cmd,
                            0,
                            "stopped responding to quorum, initiated new election".to_string(),
                            Vec::new(),
                        );
                    }
                    Some("enter") => {
                        self.elector.start_participating();
                        self.reset(now);
                        self.start_election();
                        self.reply_command(
                            from,
                            from_monitor,
                            cmd,
                            0,
                            "started responding to quorum, initiated new election".to_string(),
                            Vec::new(),
                        );
                    }
                    _ => {
                        self.reply_command(
                            from,
                            from_monitor,
                            cmd,
                            CommandError::Invalid.code(),
                            "unknown quorum subcommand; use exit or enter".to_string(),
                            Vec::new(),
                        );
                    }
                }
            }
            _ => {
                self.reply_command(
                    from,
                    from_monitor,
                    cmd,
                    CommandError::Invalid.code(),
                    "unrecognized command".to_string(),
                    Vec::new(),
                );
            }
        }
    }

    fn reply_json(
        &mut self,
        from: SocketAddr,
        from_monitor: bool,
        cmd: &MonCommand,
        doc: serde_json::Value,
    ) {
        let data = serde_json::to_vec(&doc).unwrap_or_default();
        self.reply_command(from, from_monitor, cmd, 0, String::new(), data);
    }

    fn reply_command(
        &mut self,
        from: SocketAddr,
        from_monitor: bool,
        cmd: &MonCommand,
        code: i32,
        status: String,
        data: Vec<u8>,
    ) {
        // Monitor-to-monitor commands are fire-and-forget.
        if from_monitor {
            return;
        }
        let ack = Message::CommandAck(MonCommandAck {
            args: cmd.args.clone(),
            code,
            status,
            data,
        });
        self.send_reply(from, ack);
    }

    // ---- tick -----------------------------------------------------------

    fn tick(&mut self, now: Instant) {
        self.timer
            .schedule(now, self.config.tick_interval, TimerEvent::Tick);

        for service in &mut self.services {
            service.tick();
        }

        // Trim expired client sessions; evict everyone if we have been out
        // of quorum long enough that clients should look elsewhere.
        let out_too_long = self
            .exited_quorum
            .map(|t| now > t + 2 * self.config.lease)
            .unwrap_or(false);
        for addr in self.sessions.addrs() {
            let Some(session) = self.sessions.get(&addr) else {
                continue;
            };
            if session.is_monitor {
                continue;
            }
            let expired = session.until.map(|u| u < now).unwrap_or(false);
            if expired {
                tracing::debug!(%addr, "trimming expired session");
                self.messenger.mark_down(addr);
                self.remove_session(addr);
            } else if out_too_long {
                tracing::debug!(%addr, "out of quorum too long; evicting session");
                self.messenger.mark_down(addr);
                self.remove_session(addr);
            }
        }

        if !self.waitlist.is_empty() {
            let waiting: Vec<Envelope> = self.waitlist.drain(..).collect();
            for env in waiting {
                self.dispatch(env, now);
            }
        }
    }

    fn remove_session(&mut self, addr: SocketAddr) {
        if let Some(session) = self.sessions.remove(&addr) {
            for tid in &session.routed_tids {
                if self.routed_requests.remove(tid).is_some() {
                    tracing::debug!(tid, "dropping routed request with its session");
                }
            }
        }
    }

    // ---- timers ---------------------------------------------------------

    /// Fire every due timer.
    pub fn fire_due(&mut self, now: Instant) {
        for (handle, event) in self.timer.due(now) {
            self.on_timer(handle, event, now);
        }
    }

    fn on_timer(&mut self, handle: TimerHandle, event: TimerEvent, now: Instant) {
        if self.state == LifecycleState::ShuttingDown {
            return;
        }
        match event {
            TimerEvent::Tick => self.tick(now),
            TimerEvent::ProbeTimeout => self.probe_timeout(now),
            TimerEvent::SyncStartReplyTimeout => self.sync_start_reply_timeout(now),
            TimerEvent::SyncChunkTimeout { peer } => self.sync_timeout(peer, now),
            TimerEvent::SyncTrimTimeout { peer } => self.sync_trim_timeout(peer, handle, now),
            TimerEvent::SyncTrimReenable => self.sync_trim_reenable(),
            TimerEvent::SyncHeartbeatInterval => self.sync_heartbeat_interval(now),
            TimerEvent::SyncHeartbeatTimeout => self.sync_heartbeat_timeout(now),
            TimerEvent::SyncFinishReplyTimeout => self.sync_finish_reply_timeout(now),
            TimerEvent::SyncRetryBackoff { peer } => self.sync_retry(peer, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_role_bits_are_independent() {
        let mut role = SyncRole::none();
        assert!(role.is_none());
        role.insert(SyncRole::PROVIDER);
        role.insert(SyncRole::LEADER);
        assert!(role.contains(SyncRole::PROVIDER));
        assert!(role.contains(SyncRole::LEADER));
        assert!(!role.contains(SyncRole::REQUESTER));
        role.remove(SyncRole::PROVIDER);
        assert!(!role.contains(SyncRole::PROVIDER));
        assert!(role.contains(SyncRole::LEADER));
    }

    #[test]
    fn sync_role_contains_requires_every_bit() {
        let mut role = SyncRole::none();
        role.insert(SyncRole::LEADER);
        let mut both = SyncRole::none();
        both.insert(SyncRole::LEADER);
        both.insert(SyncRole::PROVIDER);
        assert!(!role.contains(both));
        role.insert(SyncRole::PROVIDER);
        assert!(role.contains(both));
    }

    #[test]
    fn lifecycle_state_names_are_stable() {
        assert_eq!(LifecycleState::Probing.name(), "probing");
        assert_eq!(LifecycleState::Synchronizing.name(), "synchronizing");
        assert_eq!(LifecycleState::ShuttingDown.name(), "shutdown");
    }
}
