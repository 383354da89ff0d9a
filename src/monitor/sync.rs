//! Three-role bulk store synchronization.
//!
//! A lagging **requester** copies the persisted state of a live quorum from a
//! **provider** (any quorum member) while the elected **sync leader** keeps
//! log trimming disabled so the streamed snapshot stays coherent. One monitor
//! may be provider for one peer and sync leader for another at the same
//! time; the requester role excludes leader and peon.
//!
//! The chunk stream is strictly half-duplex per requester/provider pair:
//! exactly one chunk is in flight until its reply arrives.

use std::net::SocketAddr;
use std::time::Instant;

use crate::error::MonitorError;
use crate::messages::sync_flags;
use crate::messages::Message;
use crate::messages::MonSync;
use crate::messages::SyncOp;
use crate::monitor::LeaderSyncState;
use crate::monitor::LifecycleState;
use crate::monitor::Monitor;
use crate::monitor::SyncPhase;
use crate::monitor::SyncRole;
use crate::store::StoreKey;
use crate::store::SyncCursor;
use crate::store::Transaction;
use crate::store::IN_SYNC_KEY;
use crate::store::SYNC_PREFIX;
use crate::timer::TimerEvent;
use crate::timer::TimerHandle;

/// Numbered fault-injection checkpoints on the sync leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LeaderKillPoint {
    /// A sync start reached us as the leader.
    StartReceived = 1,
    /// The start reply left.
    StartReplied = 2,
    /// A heartbeat from a known requester arrived.
    HeartbeatReceived = 3,
    /// The heartbeat reply left.
    HeartbeatReplied = 4,
    /// An abort for a requester is about to leave.
    AbortQueued = 5,
    /// The abort left.
    AbortSent = 6,
    /// The finish reply is about to leave.
    FinishReplied = 7,
    /// The finish handshake completed.
    FinishDone = 8,
}

/// Numbered fault-injection checkpoints on the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProviderKillPoint {
    /// A sync start is about to bounce to the real leader.
    StartForwardQueued = 1,
    /// The bounced start left.
    StartForwarded = 2,
    /// A chunk is about to leave.
    ChunkQueued = 3,
    /// The chunk left.
    ChunkSent = 4,
}

/// Numbered fault-injection checkpoints on the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequesterKillPoint {
    /// The sync start left.
    StartSent = 1,
    /// The first heartbeat is about to leave.
    HeartbeatQueued = 2,
    /// The first heartbeat left.
    HeartbeatSent = 3,
    /// The chunk-stream request is about to leave.
    StartChunksQueued = 4,
    /// The chunk-stream request left.
    StartChunksSent = 5,
    /// A chunk reply is about to leave.
    ChunkReplyQueued = 8,
    /// The finish is about to leave.
    FinishQueued = 9,
    /// The finish left.
    FinishSent = 10,
    /// The finish reply was applied; about to re-bootstrap.
    FinishAcked = 11,
}

/// Requester-side handle on one remote peer (sync leader or provider).
#[derive(Debug)]
pub struct SyncPeer {
    /// Peer address. Updated when a start reply reveals the true leader.
    pub addr: SocketAddr,
    /// Active timer owned by this peer relationship.
    pub timeout: Option<TimerHandle>,
    /// Chunk timeouts survived so far.
    pub attempts: u32,
    /// Last key applied from the chunk stream; resume point.
    pub last_received_key: Option<StoreKey>,
    /// Running CRC over received chunk payloads since the last CRC check.
    pub crc: u32,
    /// Consecutive heartbeat timeouts.
    pub heartbeat_misses: u32,
}

impl SyncPeer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: None,
            attempts: 0,
            last_received_key: None,
            crc: 0,
            heartbeat_misses: 0,
        }
    }
}

/// Provider-side state for one requester being fed chunks.
pub(crate) struct ProviderEntity {
    pub(crate) addr: SocketAddr,
    /// Log version when the cursor was opened.
    pub(crate) version: u64,
    pub(crate) cursor: Option<Box<dyn SyncCursor>>,
    pub(crate) timeout: Option<TimerHandle>,
    /// Running CRC over sent chunk payloads since the last CRC emission.
    pub(crate) crc: u32,
    pub(crate) chunks_since_crc: u32,
}

impl Monitor {
    fn leader_kill(&self, point: LeaderKillPoint) {
        if self.config.sync_leader_kill_at == point as u32 {
            panic!("sync leader fault injection at checkpoint {}", point as u32);
        }
    }

    fn provider_kill(&self, point: ProviderKillPoint) {
        if self.config.sync_provider_kill_at == point as u32 {
            panic!("sync provider fault injection at checkpoint {}", point as u32);
        }
    }

    fn requester_kill(&self, point: RequesterKillPoint) {
        if self.config.sync_requester_kill_at == point as u32 {
            panic!("sync requester fault injection at checkpoint {}", point as u32);
        }
    }

    /// Drop every piece of sync state, canceling all owned timers.
    pub(crate) fn reset_sync(&mut self) {
        {
            let mut trim = self.trim.lock();
            for (_, handle) in trim.timeouts.drain() {
                self.timer.cancel(handle);
            }
            trim.states.clear();
            if let Some(handle) = trim.reenable_timer.take() {
                self.timer.cancel(handle);
            }
        }
        for (_, entity) in self.sync_entities.drain() {
            if let Some(handle) = entity.timeout {
                self.timer.cancel(handle);
            }
        }
        if let Some(peer) = self.sync_leader.take() {
            if let Some(handle) = peer.timeout {
                self.timer.cancel(handle);
            }
        }
        if let Some(peer) = self.sync_provider.take() {
            if let Some(handle) = peer.timeout {
                self.timer.cancel(handle);
            }
        }
        self.sync_phase = SyncPhase::None;
        self.sync_role = SyncRole::none();
    }

    pub(crate) fn handle_sync(&mut self, from: SocketAddr, m: MonSync, now: Instant) {
        tracing::debug!(peer = %from, op = ?m.op, flags = m.flags, "sync message");
        match m.op {
            SyncOp::Start => self.handle_sync_start(from, m, now),
            SyncOp::StartReply => self.handle_sync_start_reply(from, m, now),
            SyncOp::Heartbeat => self.handle_sync_heartbeat(from, now),
            SyncOp::HeartbeatReply => self.handle_sync_heartbeat_reply(from, now),
            SyncOp::Finish => self.handle_sync_finish(from, now),
            SyncOp::FinishReply => self.handle_sync_finish_reply(from, now),
            SyncOp::StartChunks => self.handle_sync_start_chunks(from, m, now),
            SyncOp::Chunk => self.handle_sync_chunk(from, m, now),
            SyncOp::ChunkReply => self.handle_sync_chunk_reply(from, m, now),
            SyncOp::Abort => self.handle_sync_abort(from, now),
        }
    }

    fn sync_send_heartbeat(&self, other: SocketAddr, reply: bool) {
        let op = if reply {
            SyncOp::HeartbeatReply
        } else {
            SyncOp::Heartbeat
        };
        self.messenger.send(other, Message::Sync(MonSync::new(op)));
    }

    // ---- sync leader ----------------------------------------------------

    fn handle_sync_start(&mut self, from: SocketAddr, m: MonSync, now: Instant) {
        // Some requester picked us as its point of entry into the quorum.
        // If we are a quorum member but not the leader, bounce the message
        // to the real leader; its reply goes straight back to the sender.
        if !self.is_leader() && !self.quorum.is_empty() {
            let Some(leader_addr) = self
                .leader
                .and_then(|rank| self.peer_map.addr_of_rank(rank))
            else {
                tracing::warn!("in quorum without a known leader; dropping sync start");
                return;
            };
            let original = if m.flags & sync_flags::REPLY_TO != 0 {
                m.reply_to.unwrap_or(from)
            } else {
                from
            };
            let mut fwd = m;
            fwd.reply_to = Some(original);
            fwd.flags |= sync_flags::REPLY_TO;
            tracing::debug!(requester = %original, leader = %leader_addr, "bouncing sync start to the leader");
            self.provider_kill(ProviderKillPoint::StartForwardQueued);
            self.messenger.send(leader_addr, Message::Sync(fwd));
            self.provider_kill(ProviderKillPoint::StartForwarded);
            return;
        }

        let other = if m.flags & sync_flags::REPLY_TO != 0 {
            m.reply_to.unwrap_or(from)
        } else {
            from
        };

        self.leader_kill(LeaderKillPoint::StartReceived);

        let mut reply = MonSync::new(SyncOp::StartReply);
        {
            let mut trim = self.trim.lock();
            if trim.timeouts.contains_key(&other) {
                tracing::debug!(requester = %other, "sync session already in progress");
                match trim.states.get(&other) {
                    Some(LeaderSyncState::Start) => {
                        tracing::debug!("ignoring stray sync start");
                        return;
                    }
                    None => {
                        tracing::debug!("destroying stale session state and starting fresh");
                        if let Some(handle) = trim.timeouts.remove(&other) {
                            self.timer.cancel(handle);
                        }
                        trim.states.remove(&other);
                    }
                }
            }

            let busy = (!self.quorum.is_empty() && self.paxos.should_trim())
                || trim.reenable_timer.is_some();
            if busy {
                reply.flags |= sync_flags::RETRY;
            } else {
                let handle = self.timer.schedule(
                    now,
                    self.config.sync_trim_timeout,
                    TimerEvent::SyncTrimTimeout { peer: other },
                );
                trim.timeouts.insert(other, handle);
                trim.states.insert(other, LeaderSyncState::Start);
                self.sync_role.insert(SyncRole::LEADER);
                self.paxos.trim_disable();
            }
        }
        self.messenger.send(other, Message::Sync(reply));
        self.leader_kill(LeaderKillPoint::StartReplied);
    }

    fn handle_sync_heartbeat(&mut self, from: SocketAddr, now: Instant) {
        let known = {
            let trim = self.trim.lock();
            self.sync_role.contains(SyncRole::LEADER)
                && trim.states.get(&from) == Some(&LeaderSyncState::Start)
        };
        if !known {
            tracing::debug!(peer = %from, "ignoring stray sync heartbeat");
            return;
        }

        if !self.is_leader() && !self.quorum.is_empty() {
            // We were the leader when this session opened, but lost the
            // election since. The requester must start over with the winner.
            self.sync_finish(from, true, now);
            return;
        }

        {
            let mut trim = self.trim.lock();
            if let Some(handle) = trim.timeouts.get_mut(&from) {
                self.timer.cancel(*handle);
                *handle = self.timer.schedule(
                    now,
                    self.config.sync_trim_timeout,
                    TimerEvent::SyncTrimTimeout { peer: from },
                );
            }
        }

        self.leader_kill(LeaderKillPoint::HeartbeatReceived);
        self.sync_send_heartbeat(from, true);
        self.leader_kill(LeaderKillPoint::HeartbeatReplied);
    }

    /// Close one requester's session; `abort` also tells the requester.
    pub(crate) fn sync_finish(&mut self, entity: SocketAddr, abort: bool, now: Instant) {
        tracing::debug!(requester = %entity, abort, "sync session closing");

        let mut trim = self.trim.lock();
        if !trim.timeouts.contains_key(&entity) {
            tracing::debug!(requester = %entity, "no known sync effort; ignoring");
            return;
        }
        if let Some(handle) = trim.timeouts.remove(&entity) {
            self.timer.cancel(handle);
        }
        trim.states.remove(&entity);

        if abort {
            self.leader_kill(LeaderKillPoint::AbortQueued);
            self.messenger
                .send(entity, Message::Sync(MonSync::new(SyncOp::Abort)));
            self.leader_kill(LeaderKillPoint::AbortSent);
        }

        if !trim.timeouts.is_empty() {
            // Other requesters still hold suppressions of their own.
            self.paxos.trim_enable();
            return;
        }

        tracing::debug!("no longer a sync leader");
        self.sync_role.remove(SyncRole::LEADER);

        // We may have been the leader, but by now we may no longer be: the
        // monitor we synced may have come back and won the election.
        if self.is_leader() && self.paxos.is_trim_disabled() {
            // Grace period so an in-flight finish handshake can complete.
            let handle = self.timer.schedule(
                now,
                self.config.trim_reenable_delay,
                TimerEvent::SyncTrimReenable,
            );
            trim.reenable_timer = Some(handle);
        } else {
            self.paxos.trim_enable();
        }
    }

    pub(crate) fn sync_trim_timeout(&mut self, peer: SocketAddr, _handle: TimerHandle, now: Instant) {
        tracing::warn!(requester = %peer, "requester went quiet; aborting its sync session");
        self.sync_finish(peer, true, now);
    }

    pub(crate) fn sync_trim_reenable(&mut self) {
        tracing::debug!("trim grace period over; re-enabling log trimming");
        self.trim.lock().reenable_timer = None;
        self.paxos.trim_enable();
    }

    fn handle_sync_finish(&mut self, from: SocketAddr, now: Instant) {
        let known = {
            let trim = self.trim.lock();
            trim.timeouts.contains_key(&from)
                && trim.states.get(&from) == Some(&LeaderSyncState::Start)
        };
        if !known {
            tracing::debug!(peer = %from, "ignoring stray sync finish");
            return;
        }

        // Even if we lost the leadership meanwhile, the requester's copy is
        // complete; scrapping it now would help no one.
        if !self.is_leader() {
            tracing::debug!("no longer the leader; acknowledging the finish anyway");
        }

        self.leader_kill(LeaderKillPoint::FinishReplied);
        self.messenger
            .send(from, Message::Sync(MonSync::new(SyncOp::FinishReply)));
        self.leader_kill(LeaderKillPoint::FinishDone);

        self.sync_finish(from, false, now);
    }

    /// Lost the election while coordinating requesters: every one of them
    /// must abort before the next tick, and every trim suppression we took
    /// must be released.
    pub(crate) fn sync_leader_abort_all(&mut self) {
        let requesters: Vec<SocketAddr> = {
            let mut trim = self.trim.lock();
            let peers: Vec<SocketAddr> = trim.timeouts.keys().copied().collect();
            for (_, handle) in trim.timeouts.drain() {
                self.timer.cancel(handle);
            }
            trim.states.clear();
            if let Some(handle) = trim.reenable_timer.take() {
                self.timer.cancel(handle);
                self.paxos.trim_enable();
            }
            peers
        };
        for peer in requesters {
            tracing::info!(requester = %peer, "lost election while coordinating its sync; aborting");
            self.messenger
                .send(peer, Message::Sync(MonSync::new(SyncOp::Abort)));
            self.paxos.trim_enable();
        }
        self.sync_role.remove(SyncRole::LEADER);
    }

    // ---- provider -------------------------------------------------------

    fn handle_sync_start_chunks(&mut self, from: SocketAddr, m: MonSync, now: Instant) {
        // An existing session for this requester means either a stray
        // message or a requester that died and came back before our timers
        // noticed. Either way the timers own the cleanup; drop the message.
        if self.sync_entities.contains_key(&from) {
            tracing::debug!(requester = %from, "chunk session already in progress; dropping");
            return;
        }

        let cursor = self.store.synchronizer(
            self.sync_target_prefixes(),
            m.last_key.clone(),
            self.config.sync_max_chunk_size,
        );
        if m.last_key.is_some() {
            tracing::debug!(requester = %from, last_key = ?m.last_key, "resuming chunk stream");
        }
        let entity = ProviderEntity {
            addr: from,
            version: self.paxos.version(),
            cursor: Some(cursor),
            timeout: None,
            crc: 0,
            chunks_since_crc: 0,
        };
        self.sync_entities.insert(from, entity);
        self.sync_role.insert(SyncRole::PROVIDER);

        self.sync_send_chunks(from, now);
    }

    fn handle_sync_chunk_reply(&mut self, from: SocketAddr, m: MonSync, now: Instant) {
        if !self.sync_role.contains(SyncRole::PROVIDER) || !self.sync_entities.contains_key(&from)
        {
            tracing::debug!(peer = %from, "ignoring stray chunk reply");
            return;
        }
        if m.flags & sync_flags::LAST != 0 {
            // The last chunk was acknowledged.
            self.sync_provider_cleanup(from);
            return;
        }
        self.sync_send_chunks(from, now);
    }

    fn sync_send_chunks(&mut self, peer: SocketAddr, now: Instant) {
        let max_crc_interval = self.config.sync_chunk_crc_interval;
        let Some(entity) = self.sync_entities.get_mut(&peer) else {
            return;
        };
        if let Some(handle) = entity.timeout.take() {
            self.timer.cancel(handle);
        }
        let Some(cursor) = entity.cursor.as_mut() else {
            tracing::debug!(requester = %peer, "chunk stream already exhausted");
            return;
        };

        let mut msg = MonSync::new(SyncOp::Chunk);
        msg.version = entity.version;

        let chunk_bytes;
        match cursor.next_chunk() {
            Some((bytes, last_key)) => {
                msg.last_key = Some(last_key);
                chunk_bytes = bytes;
            }
            None => {
                // Nothing under the sync targets; still complete the
                // handshake with an empty terminal chunk.
                chunk_bytes = Transaction::new().encode();
            }
        }
        entity.crc = crc32c::crc32c_append(entity.crc, &chunk_bytes);
        entity.chunks_since_crc += 1;
        msg.chunk = chunk_bytes;

        let exhausted = !cursor.has_next();
        if exhausted {
            msg.flags |= sync_flags::LAST;
            entity.cursor = None;
        }
        if exhausted || entity.chunks_since_crc >= max_crc_interval {
            msg.flags |= sync_flags::CRC;
            msg.crc = Some(entity.crc);
            entity.crc = 0;
            entity.chunks_since_crc = 0;
        }

        let handle = self.timer.schedule(
            now,
            self.config.sync_timeout,
            TimerEvent::SyncChunkTimeout { peer },
        );
        entity.timeout = Some(handle);

        tracing::debug!(
            requester = %peer,
            bytes = msg.chunk.len(),
            last = msg.flags & sync_flags::LAST != 0,
            "sending chunk"
        );
        self.provider_kill(ProviderKillPoint::ChunkQueued);
        self.messenger.send(peer, Message::Sync(msg));
        self.provider_kill(ProviderKillPoint::ChunkSent);
    }

    fn sync_provider_cleanup(&mut self, peer: SocketAddr) {
        tracing::debug!(requester = %peer, "dropping provider state");
        if let Some(entity) = self.sync_entities.remove(&peer) {
            if let Some(handle) = entity.timeout {
                self.timer.cancel(handle);
            }
        }
        if self.sync_entities.is_empty() {
            tracing::debug!("no longer a sync provider");
            self.sync_role.remove(SyncRole::PROVIDER);
        }
    }

    // ---- chunk timeout (both sides) ------------------------------------

    pub(crate) fn sync_timeout(&mut self, peer: SocketAddr, now: Instant) {
        if self.state == LifecycleState::Synchronizing {
            // Our provider went silent. Try another quorum member, resuming
            // from the last applied key.
            let attempts = match self.sync_provider.as_mut() {
                Some(provider) => {
                    provider.attempts += 1;
                    provider.attempts
                }
                None => return,
            };
            tracing::warn!(provider = %peer, attempts, "chunk timeout");

            if attempts > self.config.sync_max_retries || self.peer_map.len() == 2 {
                // Either we tried too often, or there is nobody else to ask.
                self.sync_requester_abort(now);
                return;
            }

            let current_name = self
                .peer_map
                .name_of_addr(&peer)
                .map(String::from)
                .unwrap_or_default();
            let debug_provider = self.config.sync_debug_provider.clone();
            let debug_fallback = self.config.sync_debug_provider_fallback.clone();

            // Random pick, bounded so a weird map cannot spin us forever.
            for _ in 0..(2 * self.peer_map.len()) {
                let mut candidate = match self.peer_map.pick_random() {
                    Some(name) => name.to_string(),
                    None => break,
                };
                if let Some(fallback) = &debug_fallback {
                    if current_name != *fallback {
                        candidate = fallback.clone();
                    } else if let Some(debug) = &debug_provider {
                        if current_name != *debug {
                            candidate = debug.clone();
                        }
                    }
                }
                if candidate == self.name || candidate == current_name {
                    continue;
                }
                let Some(addr) = self.peer_map.addr_of_name(&candidate) else {
                    continue;
                };
                tracing::info!(provider = %candidate, "switching sync provider");
                if let Some(provider) = self.sync_provider.as_mut() {
                    provider.addr = addr;
                }
                self.sync_phase = SyncPhase::Start;
                self.sync_start_chunks(now);
                return;
            }

            tracing::error!("unable to find a replacement provider; aborting sync");
            self.sync_requester_abort(now);
        } else if self.sync_role.contains(SyncRole::PROVIDER) {
            // A requester stopped acknowledging chunks.
            self.sync_provider_cleanup(peer);
        }
    }

    // ---- requester ------------------------------------------------------

    /// Enter the synchronizing state and open a session against `other`.
    pub(crate) fn sync_start(&mut self, other: SocketAddr, now: Instant) {
        // Entering sync leaves probing; its timer must not fire under us.
        self.cancel_probe_timeout();

        tracing::info!(peer = %other, "starting store sync");
        if self.state == LifecycleState::Synchronizing
            && self.sync_role.contains(SyncRole::REQUESTER)
        {
            tracing::debug!("already synchronizing; dropping");
            return;
        }
        debug_assert!(self.sync_role.is_none());
        debug_assert_eq!(self.sync_phase, SyncPhase::None);

        self.state = LifecycleState::Synchronizing;
        self.sync_role.insert(SyncRole::REQUESTER);
        self.sync_phase = SyncPhase::Start;

        // The snapshot must be rebuilt from nothing; partial state from an
        // earlier attempt is worthless.
        let mut targets = self.sync_target_prefixes();
        targets.insert(SYNC_PREFIX.to_string());
        self.store.clear_prefixes(&targets);

        let mut tx = Transaction::new();
        tx.put(SYNC_PREFIX, IN_SYNC_KEY, vec![1]);
        if let Err(err) = self.store.apply(tx) {
            tracing::error!(%err, "failed to persist in_sync marker");
        }

        // Assume `other` is both leader and provider until the start reply
        // corrects us.
        let mut leader_addr = other;
        let mut provider_addr = other;
        if let Some(name) = &self.config.sync_debug_leader {
            if let Some(addr) = self.peer_map.addr_of_name(name) {
                leader_addr = addr;
            }
        }
        if let Some(name) = &self.config.sync_debug_provider {
            if let Some(addr) = self.peer_map.addr_of_name(name) {
                provider_addr = addr;
            }
        }

        let mut leader = SyncPeer::new(leader_addr);
        // The start may bounce through a non-leader on its way; give the
        // reply twice the usual room.
        leader.timeout = Some(self.timer.schedule(
            now,
            2 * self.config.sync_trim_timeout,
            TimerEvent::SyncStartReplyTimeout,
        ));
        self.sync_leader = Some(leader);
        self.sync_provider = Some(SyncPeer::new(provider_addr));

        self.messenger
            .send(other, Message::Sync(MonSync::new(SyncOp::Start)));
        self.requester_kill(RequesterKillPoint::StartSent);
    }

    fn handle_sync_start_reply(&mut self, from: SocketAddr, m: MonSync, now: Instant) {
        if !self.sync_role.contains(SyncRole::REQUESTER) || self.sync_phase != SyncPhase::Start {
            // The leader may be answering a start we have long given up on.
            // We cannot tell whether it stopped trimming on our behalf, so
            // leave its state alone and let the timeouts sort it out.
            tracing::debug!(peer = %from, "ignoring stray sync start reply");
            return;
        }

        // Whoever replied is the true sync leader.
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.addr = from;
            if let Some(handle) = leader.timeout.take() {
                self.timer.cancel(handle);
            }
        }

        if m.flags & sync_flags::RETRY != 0 {
            tracing::debug!("sync leader is busy; retrying after back-off");
            self.sync_role = SyncRole::none();
            self.sync_phase = SyncPhase::None;
            let handle = self.timer.schedule(
                now,
                self.config.sync_backoff_timeout,
                TimerEvent::SyncRetryBackoff { peer: from },
            );
            if let Some(leader) = self.sync_leader.as_mut() {
                leader.timeout = Some(handle);
            }
            return;
        }

        let handle = self.timer.schedule(
            now,
            self.config.sync_heartbeat_timeout,
            TimerEvent::SyncHeartbeatTimeout,
        );
        let leader_addr = match self.sync_leader.as_mut() {
            Some(leader) => {
                leader.timeout = Some(handle);
                leader.heartbeat_misses = 0;
                leader.addr
            }
            None => {
                self.timer.cancel(handle);
                return;
            }
        };

        self.requester_kill(RequesterKillPoint::HeartbeatQueued);
        self.sync_send_heartbeat(leader_addr, false);
        self.requester_kill(RequesterKillPoint::HeartbeatSent);

        self.sync_start_chunks(now);
    }

    fn sync_start_chunks(&mut self, now: Instant) {
        if !self.sync_role.contains(SyncRole::REQUESTER) || self.sync_phase != SyncPhase::Start {
            tracing::warn!("chunk stream requested outside the start phase; ignoring");
            return;
        }
        self.sync_phase = SyncPhase::Chunks;

        let handle_deadline = self.config.sync_timeout;
        let (provider_addr, last_key) = match self.sync_provider.as_mut() {
            Some(provider) => {
                let peer = provider.addr;
                let handle = self.timer.schedule(
                    now,
                    handle_deadline,
                    TimerEvent::SyncChunkTimeout { peer },
                );
                provider.timeout = Some(handle);
                (peer, provider.last_received_key.clone())
            }
            None => return,
        };

        let mut msg = MonSync::new(SyncOp::StartChunks);
        msg.last_key = last_key;

        self.requester_kill(RequesterKillPoint::StartChunksQueued);
        self.messenger.send(provider_addr, Message::Sync(msg));
        self.requester_kill(RequesterKillPoint::StartChunksSent);
    }

    pub(crate) fn sync_start_reply_timeout(&mut self, now: Instant) {
        if self.state != LifecycleState::Synchronizing || self.sync_phase != SyncPhase::Start {
            return;
        }
        tracing::warn!("sync leader never answered our start; restarting the sync");
        self.sync_requester_abort(now);
    }

    fn handle_sync_chunk(&mut self, from: SocketAddr, m: MonSync, now: Instant) {
        let provider_matches = self
            .sync_provider
            .as_ref()
            .map(|p| p.addr == from)
            .unwrap_or(false);
        if !self.sync_role.contains(SyncRole::REQUESTER)
            || self.sync_phase != SyncPhase::Chunks
            || !provider_matches
        {
            tracing::debug!(peer = %from, "ignoring stray chunk");
            return;
        }

        let tx = match Transaction::decode(&m.chunk) {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(%err, "undecodable chunk; aborting sync");
                self.sync_requester_abort(now);
                return;
            }
        };

        let deadline = self.config.sync_timeout;
        let crc_now = match self.sync_provider.as_mut() {
            Some(provider) => {
                if let Some(handle) = provider.timeout.take() {
                    self.timer.cancel(handle);
                }
                provider.crc = crc32c::crc32c_append(provider.crc, &m.chunk);
                provider.last_received_key = m.last_key.clone();
                let handle = self.timer.schedule(
                    now,
                    deadline,
                    TimerEvent::SyncChunkTimeout { peer: from },
                );
                provider.timeout = Some(handle);
                provider.crc
            }
            None => return,
        };

        let mut reply = MonSync::new(SyncOp::ChunkReply);
        let mut stop = false;
        if m.flags & sync_flags::LAST != 0 {
            reply.flags |= sync_flags::LAST;
            stop = true;
        }
        self.requester_kill(RequesterKillPoint::ChunkReplyQueued);
        self.messenger.send(from, Message::Sync(reply));

        if let Err(err) = self.store.apply(tx) {
            tracing::error!(%err, "failed to apply sync chunk; aborting");
            self.sync_requester_abort(now);
            return;
        }

        if m.flags & sync_flags::CRC != 0 {
            let expected = m.crc.unwrap_or(0);
            if expected != crc_now {
                let err = MonitorError::CrcMismatch {
                    expected,
                    got: crc_now,
                };
                tracing::error!(%err, "aborting sync");
                self.sync_requester_abort(now);
                return;
            }
            if let Some(provider) = self.sync_provider.as_mut() {
                provider.crc = 0;
            }
        }

        if stop {
            self.sync_stop(now);
        }
    }

    fn sync_stop(&mut self, now: Instant) {
        if !self.sync_role.contains(SyncRole::REQUESTER) || self.sync_phase != SyncPhase::Chunks {
            return;
        }
        tracing::debug!("chunk stream complete; finishing with the sync leader");
        self.sync_phase = SyncPhase::Stop;

        if let Some(provider) = self.sync_provider.take() {
            if let Some(handle) = provider.timeout {
                self.timer.cancel(handle);
            }
        }

        let deadline = self.config.sync_timeout;
        let leader_addr = match self.sync_leader.as_mut() {
            Some(leader) => {
                if let Some(handle) = leader.timeout.take() {
                    self.timer.cancel(handle);
                }
                let handle =
                    self.timer
                        .schedule(now, deadline, TimerEvent::SyncFinishReplyTimeout);
                leader.timeout = Some(handle);
                leader.addr
            }
            None => return,
        };

        self.requester_kill(RequesterKillPoint::FinishQueued);
        self.messenger
            .send(leader_addr, Message::Sync(MonSync::new(SyncOp::Finish)));
        self.requester_kill(RequesterKillPoint::FinishSent);
    }

    pub(crate) fn sync_finish_reply_timeout(&mut self, now: Instant) {
        if self.state != LifecycleState::Synchronizing || self.sync_phase != SyncPhase::Stop {
            return;
        }
        tracing::warn!("sync leader never acknowledged our finish; restarting the sync");
        self.sync_requester_abort(now);
    }

    fn handle_sync_finish_reply(&mut self, from: SocketAddr, now: Instant) {
        let leader_matches = self
            .sync_leader
            .as_ref()
            .map(|l| l.addr == from)
            .unwrap_or(false);
        if !self.sync_role.contains(SyncRole::REQUESTER)
            || self.sync_phase != SyncPhase::Stop
            || !leader_matches
        {
            tracing::debug!(peer = %from, "ignoring stray finish reply");
            return;
        }

        tracing::info!("store sync complete");
        self.sync_role.remove(SyncRole::REQUESTER);
        self.sync_phase = SyncPhase::None;

        if let Some(leader) = self.sync_leader.take() {
            if let Some(handle) = leader.timeout {
                self.timer.cancel(handle);
            }
        }

        let mut tx = Transaction::new();
        tx.erase(SYNC_PREFIX, IN_SYNC_KEY);
        if let Err(err) = self.store.apply(tx) {
            tracing::error!(%err, "failed to clear in_sync marker");
        }

        // The store now holds the provider's snapshot; reload the log from
        // it before rejoining the cluster.
        self.init_paxos();

        self.requester_kill(RequesterKillPoint::FinishAcked);

        self.bootstrap(now);
    }

    /// Abort the whole requester-side sync and start over from probing.
    pub(crate) fn sync_requester_abort(&mut self, now: Instant) {
        if self.state != LifecycleState::Synchronizing
            || !self.sync_role.contains(SyncRole::REQUESTER)
        {
            return;
        }

        if let Some(leader) = self.sync_leader.take() {
            tracing::debug!(leader = %leader.addr, "aborting sync");
            if let Some(handle) = leader.timeout {
                self.timer.cancel(handle);
            }
        }
        if let Some(provider) = self.sync_provider.take() {
            if let Some(handle) = provider.timeout {
                self.timer.cancel(handle);
            }
            self.messenger
                .send(provider.addr, Message::Sync(MonSync::new(SyncOp::Abort)));
        }

        // The store is knowingly inconsistent now; clear it.
        tracing::warn!("clearing potentially inconsistent store after sync abort");
        let mut targets = self.sync_target_prefixes();
        targets.insert(SYNC_PREFIX.to_string());
        self.store.clear_prefixes(&targets);

        tracing::debug!("no longer a sync requester");
        self.sync_role = SyncRole::none();
        self.sync_phase = SyncPhase::None;

        self.bootstrap(now);
    }

    pub(crate) fn sync_retry(&mut self, peer: SocketAddr, now: Instant) {
        if self.state != LifecycleState::Synchronizing {
            return;
        }
        tracing::debug!(peer = %peer, "back-off elapsed; retrying sync");
        if let Some(leader) = self.sync_leader.take() {
            if let Some(handle) = leader.timeout {
                self.timer.cancel(handle);
            }
        }
        self.sync_provider = None;
        self.sync_start(peer, now);
    }

    // ---- heartbeats (requester side) ------------------------------------

    pub(crate) fn sync_heartbeat_interval(&mut self, now: Instant) {
        if !self.sync_role.contains(SyncRole::REQUESTER) {
            return;
        }
        let deadline = self.config.sync_heartbeat_timeout;
        let leader_addr = match self.sync_leader.as_mut() {
            Some(leader) => {
                let handle =
                    self.timer
                        .schedule(now, deadline, TimerEvent::SyncHeartbeatTimeout);
                leader.timeout = Some(handle);
                leader.addr
            }
            None => return,
        };
        self.sync_send_heartbeat(leader_addr, false);
    }

    pub(crate) fn sync_heartbeat_timeout(&mut self, now: Instant) {
        if !self.sync_role.contains(SyncRole::REQUESTER) {
            return;
        }
        let deadline = self.config.sync_heartbeat_timeout;
        let (misses, leader_addr) = match self.sync_leader.as_mut() {
            Some(leader) => {
                leader.heartbeat_misses += 1;
                (leader.heartbeat_misses, leader.addr)
            }
            None => return,
        };
        if misses >= 3 {
            tracing::warn!("lost three heartbeats to the sync leader; aborting sync");
            self.sync_requester_abort(now);
            return;
        }
        tracing::debug!(misses, "heartbeat reply overdue; trying again");
        let handle = self
            .timer
            .schedule(now, deadline, TimerEvent::SyncHeartbeatTimeout);
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.timeout = Some(handle);
        }
        self.sync_send_heartbeat(leader_addr, false);
    }

    fn handle_sync_heartbeat_reply(&mut self, from: SocketAddr, now: Instant) {
        let leader_matches = self
            .sync_leader
            .as_ref()
            .map(|l| l.addr == from)
            .unwrap_or(false);
        if !self.sync_role.contains(SyncRole::REQUESTER)
            || self.sync_phase == SyncPhase::None
            || !leader_matches
        {
            tracing::debug!(peer = %from, "ignoring stray heartbeat reply");
            return;
        }
        let interval = self.config.sync_heartbeat_interval;
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.heartbeat_misses = 0;
            if let Some(handle) = leader.timeout.take() {
                self.timer.cancel(handle);
            }
        }
        let handle = self
            .timer
            .schedule(now, interval, TimerEvent::SyncHeartbeatInterval);
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.timeout = Some(handle);
        }
    }

    // ---- abort (any role) -----------------------------------------------

    fn handle_sync_abort(&mut self, from: SocketAddr, now: Instant) {
        let from_our_leader = self
            .sync_leader
            .as_ref()
            .map(|l| l.addr == from)
            .unwrap_or(false);
        if self.sync_role.contains(SyncRole::REQUESTER) && from_our_leader {
            // Probably a leader change; continuing would risk applying a
            // snapshot with trimming re-enabled underneath it.
            self.sync_requester_abort(now);
        } else if self.sync_role.contains(SyncRole::PROVIDER)
            && self.sync_entities.contains_key(&from)
        {
            self.sync_provider_cleanup(from);
        } else {
            tracing::debug!(peer = %from, "ignoring stray sync abort");
        }
    }
}
