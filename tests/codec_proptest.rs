//! Wire codec laws and the capability matcher under generated inputs.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use proptest::prelude::*;

use vigil::caps::CapabilityGrant;
use vigil::messages::Forward;
use vigil::messages::Message;
use vigil::messages::MonProbe;
use vigil::messages::MonSync;
use vigil::messages::ProbeOp;
use vigil::messages::Route;
use vigil::messages::SyncOp;

fn arb_addr() -> impl Strategy<Value = SocketAddr> {
    (any::<[u8; 4]>(), any::<u16>()).prop_map(|(ip, port)| {
        SocketAddr::from((std::net::Ipv4Addr::from(ip), port))
    })
}

fn arb_sync_op() -> impl Strategy<Value = SyncOp> {
    prop_oneof![
        Just(SyncOp::Start),
        Just(SyncOp::StartReply),
        Just(SyncOp::Heartbeat),
        Just(SyncOp::HeartbeatReply),
        Just(SyncOp::Finish),
        Just(SyncOp::FinishReply),
        Just(SyncOp::StartChunks),
        Just(SyncOp::Chunk),
        Just(SyncOp::ChunkReply),
        Just(SyncOp::Abort),
    ]
}

proptest! {
    #[test]
    fn probe_messages_roundtrip(
        name in "[a-z]{1,12}",
        has_ever_joined in any::<bool>(),
        quorum in proptest::collection::btree_set(0u32..16, 0..5),
        peer_map in proptest::collection::vec(any::<u8>(), 0..256),
        first in any::<u64>(),
        last in any::<u64>(),
        op in prop_oneof![Just(ProbeOp::Probe), Just(ProbeOp::Reply)],
    ) {
        let msg = Message::Probe(MonProbe {
            fsid: uuid::Uuid::new_v4(),
            op,
            name,
            has_ever_joined,
            quorum: quorum.into_iter().collect::<BTreeSet<_>>(),
            peer_map,
            paxos_first: first,
            paxos_last: last,
        });
        prop_assert_eq!(Message::from_bytes(&msg.to_bytes()), Some(msg));
    }

    #[test]
    fn sync_messages_roundtrip(
        op in arb_sync_op(),
        flags in 0u8..16,
        version in any::<u64>(),
        chunk in proptest::collection::vec(any::<u8>(), 0..512),
        last_key in proptest::option::of(("[a-z]{1,8}", "[a-z0-9]{1,16}")),
        crc in proptest::option::of(any::<u32>()),
        reply_to in proptest::option::of(arb_addr()),
    ) {
        let msg = Message::Sync(MonSync {
            op,
            flags,
            version,
            chunk,
            first_key: None,
            last_key: last_key.map(|(p, k)| (p, k)),
            crc,
            reply_to,
        });
        prop_assert_eq!(Message::from_bytes(&msg.to_bytes()), Some(msg));
    }

    #[test]
    fn forward_and_route_roundtrip(
        tid in any::<u64>(),
        client in arb_addr(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        route_tid in proptest::option::of(any::<u64>()),
    ) {
        let fwd = Message::Forward(Forward {
            tid,
            client_addr: client,
            client_caps: CapabilityGrant::allow_all(),
            msg: payload.clone(),
        });
        prop_assert_eq!(Message::from_bytes(&fwd.to_bytes()), Some(fwd));

        let route = Message::Route(Route {
            tid: route_tid,
            dest: client,
            msg: payload,
        });
        prop_assert_eq!(Message::from_bytes(&route.to_bytes()), Some(route));
    }

    #[test]
    fn capability_matcher_never_panics_and_allow_all_wins(
        cmd in proptest::collection::vec("[a-z*.]{1,8}", 0..6),
        pattern in proptest::collection::vec("[a-z*.]{1,8}", 0..6),
    ) {
        let mut caps = CapabilityGrant::default();
        caps.allow_command(pattern);
        let _ = caps.allows_command(&cmd);

        let all = CapabilityGrant::allow_all();
        prop_assert!(all.allows_command(&cmd));
    }

    #[test]
    fn exact_prefix_lists_match_their_own_command(
        cmd in proptest::collection::vec("[a-z]{1,8}", 1..6),
    ) {
        let mut caps = CapabilityGrant::default();
        caps.allow_command(cmd.clone());
        prop_assert!(caps.allows_command(&cmd));
    }
}
