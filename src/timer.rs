//! Data-tagged timer queue.
//!
//! Scheduled callbacks are plain data (a tag plus the peer it concerns), not
//! closures, so cancellation stays safe under the single-threaded dispatch
//! model. Canceling an unknown handle is a no-op.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

/// Opaque handle to one scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

/// Everything the monitor schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Periodic housekeeping.
    Tick,
    /// No probe reply arrived in time; re-bootstrap.
    ProbeTimeout,
    /// Requester: the leader never answered our sync start.
    SyncStartReplyTimeout,
    /// Chunk deadline expired for `peer` (requester or provider side).
    SyncChunkTimeout {
        /// Peer the chunk stream concerns.
        peer: SocketAddr,
    },
    /// Sync leader: requester `peer` went quiet; abort its session.
    SyncTrimTimeout {
        /// The silent requester.
        peer: SocketAddr,
    },
    /// Sync leader: grace period over, release the final trim suppression.
    SyncTrimReenable,
    /// Requester: time to send the next heartbeat.
    SyncHeartbeatInterval,
    /// Requester: a heartbeat reply is overdue.
    SyncHeartbeatTimeout,
    /// Requester: the leader never acknowledged our finish.
    SyncFinishReplyTimeout,
    /// Requester: back-off after RETRY elapsed; try `peer` again.
    SyncRetryBackoff {
        /// Peer to restart the sync against.
        peer: SocketAddr,
    },
}

/// Ordered queue of scheduled events.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_handle: u64,
    entries: BTreeMap<TimerHandle, (Instant, TimerEvent)>,
}

impl TimerQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` to fire `after` from `now`.
    pub fn schedule(&mut self, now: Instant, after: Duration, event: TimerEvent) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.entries.insert(handle, (now + after, event));
        handle
    }

    /// Cancel a scheduled event. Unknown handles are ignored.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.entries.remove(&handle);
    }

    /// Remove and return every event due at `now`, earliest first.
    pub fn due(&mut self, now: Instant) -> Vec<(TimerHandle, TimerEvent)> {
        let mut due: Vec<(TimerHandle, Instant, TimerEvent)> = self
            .entries
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(h, (d, e))| (*h, *d, *e))
            .collect();
        due.sort_by_key(|(_, deadline, _)| *deadline);
        for (h, _, _) in &due {
            self.entries.remove(h);
        }
        due.into_iter().map(|(h, _, e)| (h, e)).collect()
    }

    /// Earliest deadline, if any event is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(d, _)| *d).min()
    }

    /// Number of scheduled events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_returns_only_elapsed_events_in_deadline_order() {
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        q.schedule(t0, Duration::from_secs(2), TimerEvent::ProbeTimeout);
        q.schedule(t0, Duration::from_secs(1), TimerEvent::Tick);
        q.schedule(t0, Duration::from_secs(10), TimerEvent::SyncHeartbeatInterval);

        let due = q.due(t0 + Duration::from_secs(3));
        let events: Vec<_> = due.iter().map(|(_, e)| *e).collect();
        assert_eq!(events, vec![TimerEvent::Tick, TimerEvent::ProbeTimeout]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        let h = q.schedule(t0, Duration::from_secs(1), TimerEvent::Tick);
        q.cancel(h);
        q.cancel(h);
        assert!(q.due(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn canceled_events_never_fire() {
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        let keep = q.schedule(t0, Duration::from_secs(1), TimerEvent::Tick);
        let drop = q.schedule(t0, Duration::from_secs(1), TimerEvent::ProbeTimeout);
        q.cancel(drop);
        let due = q.due(t0 + Duration::from_secs(2));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, keep);
    }

    #[test]
    fn next_deadline_tracks_earliest() {
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        assert!(q.next_deadline().is_none());
        q.schedule(t0, Duration::from_secs(5), TimerEvent::Tick);
        let h = q.schedule(t0, Duration::from_secs(1), TimerEvent::ProbeTimeout);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(1)));
        q.cancel(h);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn handles_are_unique_across_reschedules() {
        let mut q = TimerQueue::new();
        let t0 = Instant::now();
        let a = q.schedule(t0, Duration::from_secs(1), TimerEvent::Tick);
        q.cancel(a);
        let b = q.schedule(t0, Duration::from_secs(1), TimerEvent::Tick);
        assert_ne!(a, b);
    }
}
