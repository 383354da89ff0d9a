//! Wire messages exchanged between monitors and clients.
//!
//! Everything is postcard on the wire. The envelope enum is deliberately
//! flat: the dispatch shell routes on the variant tag and hands opaque
//! payloads to the owning module or external service.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::SocketAddr;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::caps::CapabilityGrant;
use crate::service::ServiceKind;
use crate::store::StoreKey;

/// Probe operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOp {
    /// Solicit a peer's view of the world.
    Probe,
    /// Answer to a probe.
    Reply,
}

/// Peer discovery and bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonProbe {
    /// Cluster identity; mismatches are dropped.
    pub fsid: Uuid,
    /// Probe or reply.
    pub op: ProbeOp,
    /// Sender's configured name.
    pub name: String,
    /// Whether the sender has ever been part of a quorum.
    pub has_ever_joined: bool,
    /// Sender's current quorum (ranks); empty when out of quorum.
    pub quorum: BTreeSet<u32>,
    /// Sender's encoded peer map.
    pub peer_map: Vec<u8>,
    /// Sender's first committed log version.
    pub paxos_first: u64,
    /// Sender's latest committed log version.
    pub paxos_last: u64,
}

/// Sync operations, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// Requester -> leader: open a sync session.
    Start,
    /// Leader -> requester: session accepted (or RETRY).
    StartReply,
    /// Requester -> leader: still alive, keep trim disabled.
    Heartbeat,
    /// Leader -> requester: heartbeat acknowledged.
    HeartbeatReply,
    /// Requester -> leader: all chunks applied.
    Finish,
    /// Leader -> requester: session closed.
    FinishReply,
    /// Requester -> provider: begin (or resume) the chunk stream.
    StartChunks,
    /// Provider -> requester: one chunk of encoded store state.
    Chunk,
    /// Requester -> provider: chunk applied, send the next.
    ChunkReply,
    /// Either direction: tear the session down.
    Abort,
}

/// Sync message flags.
pub mod sync_flags {
    /// Terminal chunk of the stream.
    pub const LAST: u8 = 0x01;
    /// Leader is busy; back off and retry.
    pub const RETRY: u8 = 0x02;
    /// A CRC over the bytes sent since the previous CRC is attached.
    pub const CRC: u8 = 0x04;
    /// Message was bounced through a non-leader; true sender in `reply_to`.
    pub const REPLY_TO: u8 = 0x08;
}

/// Bulk store synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonSync {
    /// Operation.
    pub op: SyncOp,
    /// Bitwise OR of [`sync_flags`].
    pub flags: u8,
    /// Provider's log version snapshot (informational).
    pub version: u64,
    /// Encoded store transaction for `Chunk` messages.
    pub chunk: Vec<u8>,
    /// First key covered by this message, when relevant.
    pub first_key: Option<StoreKey>,
    /// Last key covered; the requester resumes after it.
    pub last_key: Option<StoreKey>,
    /// Running CRC when the `CRC` flag is set.
    pub crc: Option<u32>,
    /// Original sender when the `REPLY_TO` flag is set.
    pub reply_to: Option<SocketAddr>,
}

impl MonSync {
    /// A bare message for `op` with no flags or payload.
    pub fn new(op: SyncOp) -> Self {
        Self {
            op,
            flags: 0,
            version: 0,
            chunk: Vec::new(),
            first_key: None,
            last_key: None,
            crc: None,
            reply_to: None,
        }
    }
}

/// Request to be added to the peer map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonJoin {
    /// Cluster identity.
    pub fsid: Uuid,
    /// Joiner's name.
    pub name: String,
    /// Joiner's address.
    pub addr: SocketAddr,
}

/// A client request wrapped by a non-leader and sent to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Forwarding monitor's routed-request id.
    pub tid: u64,
    /// Originating client.
    pub client_addr: SocketAddr,
    /// Client's capabilities at the forwarding monitor.
    pub client_caps: CapabilityGrant,
    /// The encoded inner [`Message`].
    pub msg: Vec<u8>,
}

/// A reply traveling the reverse path of a forwarded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Routed-request id at the forwarding monitor; `None` for a plain relay.
    pub tid: Option<u64>,
    /// Final destination.
    pub dest: SocketAddr,
    /// The encoded inner [`Message`].
    pub msg: Vec<u8>,
}

/// Operator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonCommand {
    /// Cluster identity.
    pub fsid: Uuid,
    /// Command tokens.
    pub args: Vec<String>,
}

/// Command acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonCommandAck {
    /// Echo of the command tokens.
    pub args: Vec<String>,
    /// Zero on success, negative errno-style code on failure.
    pub code: i32,
    /// Human-readable status.
    pub status: String,
    /// Optional payload (JSON documents and the like).
    pub data: Vec<u8>,
}

/// One subscription item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeItem {
    /// First version the subscriber wants.
    pub start: u64,
    /// Deliver once and forget.
    pub onetime: bool,
}

/// Map subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonSubscribe {
    /// Map name -> wanted versions.
    pub what: BTreeMap<String, SubscribeItem>,
}

/// Subscription acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonSubscribeAck {
    /// Cluster identity.
    pub fsid: Uuid,
    /// Seconds until the subscriber should renew.
    pub interval_secs: u32,
}

/// Query for a map's version range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonGetVersion {
    /// Client correlation handle.
    pub handle: u64,
    /// Map name.
    pub what: String,
}

/// Answer to [`MonGetVersion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonGetVersionReply {
    /// Echo of the correlation handle.
    pub handle: u64,
    /// Latest committed version.
    pub version: u64,
    /// Oldest retrievable version.
    pub oldest_version: u64,
}

/// Replicated-log traffic (opaque to the core beyond the epoch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosMsg {
    /// Election epoch the sender believes is current.
    pub epoch: u64,
    /// Opaque log-module payload.
    pub payload: Vec<u8>,
}

/// Election traffic (opaque to the core).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionMsg {
    /// Opaque elector payload.
    pub payload: Vec<u8>,
}

/// Everything the dispatch shell can receive or send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Peer discovery.
    Probe(MonProbe),
    /// Store synchronization.
    Sync(MonSync),
    /// Peer map join request.
    Join(MonJoin),
    /// Forwarded client request.
    Forward(Forward),
    /// Routed reply.
    Route(Route),
    /// Operator command.
    Command(MonCommand),
    /// Command acknowledgement.
    CommandAck(MonCommandAck),
    /// Map subscriptions.
    Subscribe(MonSubscribe),
    /// Subscription acknowledgement.
    SubscribeAck(MonSubscribeAck),
    /// Map version query.
    GetVersion(MonGetVersion),
    /// Map version answer.
    GetVersionReply(MonGetVersionReply),
    /// Ask for the latest peer map.
    GetMap,
    /// The latest encoded peer map.
    PeerMap(Vec<u8>),
    /// Replicated-log traffic.
    Paxos(PaxosMsg),
    /// Election traffic.
    Election(ElectionMsg),
    /// Traffic owned by a map service.
    Service {
        /// Owning service.
        kind: ServiceKind,
        /// Opaque service payload.
        payload: Vec<u8>,
    },
}

impl Message {
    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_stdvec(self).unwrap_or_default()
    }

    /// Deserialize from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        postcard::from_bytes(bytes).ok()
    }

    /// Short tag for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Probe(_) => "probe",
            Message::Sync(_) => "sync",
            Message::Join(_) => "join",
            Message::Forward(_) => "forward",
            Message::Route(_) => "route",
            Message::Command(_) => "command",
            Message::CommandAck(_) => "command_ack",
            Message::Subscribe(_) => "subscribe",
            Message::SubscribeAck(_) => "subscribe_ack",
            Message::GetVersion(_) => "get_version",
            Message::GetVersionReply(_) => "get_version_reply",
            Message::GetMap => "get_map",
            Message::PeerMap(_) => "peer_map",
            Message::Paxos(_) => "paxos",
            Message::Election(_) => "election",
            Message::Service { .. } => "service",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn probe_roundtrip() {
        let msg = Message::Probe(MonProbe {
            fsid: Uuid::new_v4(),
            op: ProbeOp::Reply,
            name: "c".to_string(),
            has_ever_joined: true,
            quorum: [0, 1].into_iter().collect(),
            peer_map: vec![1, 2, 3],
            paxos_first: 10,
            paxos_last: 42,
        });
        assert_eq!(Message::from_bytes(&msg.to_bytes()), Some(msg));
    }

    #[test]
    fn sync_chunk_roundtrip() {
        let msg = Message::Sync(MonSync {
            op: SyncOp::Chunk,
            flags: sync_flags::LAST | sync_flags::CRC,
            version: 7,
            chunk: vec![0xde, 0xad],
            first_key: None,
            last_key: Some(("paxos".to_string(), "00000042".to_string())),
            crc: Some(0xbeef),
            reply_to: None,
        });
        assert_eq!(Message::from_bytes(&msg.to_bytes()), Some(msg));
    }

    #[test]
    fn forward_and_route_roundtrip() {
        let inner = Message::Command(MonCommand {
            fsid: Uuid::new_v4(),
            args: vec!["mon_status".to_string()],
        });
        let fwd = Message::Forward(Forward {
            tid: 42,
            client_addr: addr(9000),
            client_caps: CapabilityGrant::allow_all(),
            msg: inner.to_bytes(),
        });
        let decoded = Message::from_bytes(&fwd.to_bytes()).unwrap();
        match &decoded {
            Message::Forward(f) => {
                assert_eq!(Message::from_bytes(&f.msg), Some(inner));
            }
            other => panic!("unexpected variant: {other:?}"),
        }

        let route = Message::Route(Route {
            tid: Some(42),
            dest: addr(9000),
            msg: vec![9, 9],
        });
        assert_eq!(Message::from_bytes(&route.to_bytes()), Some(route));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert_eq!(Message::from_bytes(&[0xff; 64]), None);
    }
}
