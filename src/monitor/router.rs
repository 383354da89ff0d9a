//! Routed requests: forwarding client state changes to the leader and
//! walking replies back along the reverse path.
//!
//! A non-leader wraps each state-changing client request in a forward
//! envelope keyed by a monitor-local tid. The leader fabricates a session
//! carrying the client's capabilities and redispatches the inner message as
//! if it had arrived directly; replies travel back as route messages. On
//! every quorum entry the outstanding table is resent to the (possibly new)
//! leader, so the client sees at-least-once delivery across leader changes.

use std::net::SocketAddr;
use std::time::Instant;

use crate::caps::CapabilityGrant;
use crate::caps::CAP_X;
use crate::messages::Forward;
use crate::messages::Message;
use crate::messages::Route;
use crate::monitor::Envelope;
use crate::monitor::Monitor;
use crate::service::ServiceKind;
use crate::session::ProxyLink;

/// One client request parked here while the leader works on it.
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    /// Monitor-local id; unique and strictly increasing process-wide.
    pub tid: u64,
    /// The client awaiting the reply.
    pub client: SocketAddr,
    /// Session that owns this request; its death drops the request.
    pub session_addr: SocketAddr,
    /// The encoded inner message, kept for resends.
    pub request: Vec<u8>,
    /// Client capabilities captured at forward time.
    pub caps: CapabilityGrant,
}

impl Monitor {
    /// Wrap a state-changing client request and send it to the leader.
    ///
    /// Called by map services when they receive a mutation while we are not
    /// the leader. Requests that already crossed one forwarding hop (their
    /// session carries a proxy link) and requests from closed sessions are
    /// dropped.
    pub fn forward_request_leader(&mut self, env: &Envelope) {
        let Some(leader_addr) = self
            .leader
            .and_then(|rank| self.peer_map.addr_of_rank(rank))
        else {
            tracing::debug!("no leader to forward to; dropping request");
            return;
        };
        let Some(session) = self.sessions.get(&env.from) else {
            tracing::debug!(from = %env.from, "no session for request; dropping");
            return;
        };
        if session.proxy.is_some() {
            tracing::debug!(from = %env.from, "refusing to double-forward a forwarded request");
            return;
        }
        if session.closed {
            tracing::debug!(from = %env.from, "session closed; dropping request");
            return;
        }
        let caps = session.caps.clone();

        self.routed_request_tid += 1;
        let tid = self.routed_request_tid;
        let request = env.msg.to_bytes();

        if let Some(session) = self.sessions.get_mut(&env.from) {
            session.routed_tids.insert(tid);
        }
        self.routed_requests.insert(
            tid,
            RoutedRequest {
                tid,
                client: env.from,
                session_addr: env.from,
                request: request.clone(),
                caps: caps.clone(),
            },
        );

        tracing::debug!(tid, client = %env.from, leader = %leader_addr, "forwarding request to leader");
        self.messenger.send(
            leader_addr,
            Message::Forward(Forward {
                tid,
                client_addr: env.from,
                client_caps: caps,
                msg: request,
            }),
        );
    }

    /// Leader side: unwrap a forwarded request and redispatch it under a
    /// fabricated session that remembers the way back.
    pub(crate) fn handle_forward(&mut self, from: SocketAddr, m: Forward, now: Instant) {
        let caps_ok = self
            .sessions
            .get(&from)
            .map(|s| s.caps.check(ServiceKind::MonMap, CAP_X))
            .unwrap_or(false);
        if !caps_ok {
            tracing::warn!(from = %from, "forward from entity with insufficient caps");
            return;
        }
        let Some(inner) = Message::from_bytes(&m.msg) else {
            tracing::warn!(from = %from, "undecodable forwarded request");
            return;
        };

        tracing::debug!(client = %m.client_addr, via = %from, tid = m.tid, "redispatching forwarded request");

        // The fabricated session stands in for the client's connection; the
        // proxy link is plain data, so there is no ownership cycle to break.
        let until = now + self.config.subscribe_interval;
        let session = self.sessions.insert(m.client_addr, false, now);
        session.caps = m.client_caps;
        session.proxy = Some(ProxyLink {
            via: from,
            tid: m.tid,
        });
        session.until = Some(until);

        self.dispatch(
            Envelope {
                from: m.client_addr,
                from_monitor: false,
                received_at: now,
                msg: inner,
            },
            now,
        );
    }

    /// Send `reply` to `to`, routing it through the forwarding monitor when
    /// the session arrived via a forward.
    pub fn send_reply(&mut self, to: SocketAddr, reply: Message) {
        let Some(session) = self.sessions.get(&to) else {
            tracing::debug!(%to, "no session; dropping reply");
            return;
        };
        match session.proxy {
            Some(link) => {
                tracing::debug!(client = %to, via = %link.via, tid = link.tid, "routing reply back");
                self.messenger.send(
                    link.via,
                    Message::Route(Route {
                        tid: Some(link.tid),
                        dest: to,
                        msg: reply.to_bytes(),
                    }),
                );
            }
            None => self.messenger.send(to, reply),
        }
    }

    /// Forwarding-monitor side: match a routed reply to its request and
    /// deliver it to the original client.
    pub(crate) fn handle_route(&mut self, from: SocketAddr, m: Route) {
        let caps_ok = self
            .sessions
            .get(&from)
            .map(|s| s.caps.check(ServiceKind::MonMap, CAP_X))
            .unwrap_or(false);
        if !caps_ok {
            tracing::warn!(from = %from, "route from entity with insufficient caps");
            return;
        }

        match m.tid {
            Some(tid) => {
                let Some(rr) = self.routed_requests.remove(&tid) else {
                    tracing::debug!(tid, "no routed request with this tid");
                    return;
                };
                // Decode and resend rather than relaying bytes: the reply's
                // encoding may depend on the receiver.
                let Some(inner) = Message::from_bytes(&m.msg) else {
                    tracing::warn!(tid, "undecodable routed reply");
                    return;
                };
                tracing::debug!(tid, client = %rr.client, "delivering routed reply");
                self.messenger.send(rr.client, inner);
                if let Some(session) = self.sessions.get_mut(&rr.session_addr) {
                    session.routed_tids.remove(&tid);
                }
            }
            None => {
                // Not a routed reply; just a relay to a known destination.
                if let Some(inner) = Message::from_bytes(&m.msg) {
                    tracing::debug!(dest = %m.dest, "relaying message");
                    self.messenger.send(m.dest, inner);
                }
            }
        }
    }

    /// Resend every outstanding routed request to the current leader.
    ///
    /// Runs on every quorum entry; duplicates are absorbed by the services'
    /// client+tid dedup.
    pub(crate) fn resend_routed_requests(&mut self) {
        if self.routed_requests.is_empty() {
            return;
        }
        let Some(leader_addr) = self
            .leader
            .and_then(|rank| self.peer_map.addr_of_rank(rank))
        else {
            return;
        };
        for rr in self.routed_requests.values() {
            tracing::debug!(tid = rr.tid, leader = %leader_addr, "resending routed request");
            self.messenger.send(
                leader_addr,
                Message::Forward(Forward {
                    tid: rr.tid,
                    client_addr: rr.client,
                    client_caps: rr.caps.clone(),
                    msg: rr.request.clone(),
                }),
            );
        }
    }
}
