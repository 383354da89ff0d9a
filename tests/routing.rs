//! Request routing: forwarding to the leader, reply routing, resends across
//! leader changes, and session-scoped cleanup.

use std::net::SocketAddr;

use vigil::caps::CapabilityGrant;
use vigil::messages::Message;
use vigil::messages::MonCommand;
use vigil::messages::MonCommandAck;
use vigil::service::ServiceKind;
use vigil::testing::Cluster;
use vigil::Envelope;
use vigil::MonitorConfig;

fn client_addr() -> SocketAddr {
    "10.9.9.9:4000".parse().unwrap()
}

fn osd_command(cluster: &Cluster) -> Message {
    Message::Command(MonCommand {
        fsid: cluster.fsid,
        args: vec!["osd".to_string(), "set-flag".to_string(), "noout".to_string()],
    })
}

/// Three monitors in quorum with 0 leading, plus a client session on peon 1.
fn quorum_with_client(cluster: &mut Cluster) -> Envelope {
    cluster.init_all();
    cluster.pump();
    cluster.run_election(0, &[0, 1, 2]);

    let msg = osd_command(cluster);
    cluster.client_send(1, client_addr(), msg.clone());
    // The command reached the peon's OSD service; the service decides it is
    // a mutation and asks the core to forward it.
    assert_eq!(
        cluster.mons[1].services[&ServiceKind::OsdMap]
            .lock()
            .dispatched
            .len(),
        1
    );
    Envelope {
        from: client_addr(),
        from_monitor: false,
        received_at: cluster.now,
        msg,
    }
}

#[test]
fn forwarded_request_reaches_the_leader_and_reply_routes_back() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    let env = quorum_with_client(&mut cluster);

    cluster.mons[1].monitor.forward_request_leader(&env);
    assert_eq!(cluster.mons[1].monitor.routed_request_tids(), vec![1]);

    cluster.pump();

    // The leader redispatched the inner command into its own OSD service
    // under a fabricated session for the client.
    assert_eq!(
        cluster.mons[0].services[&ServiceKind::OsdMap]
            .lock()
            .dispatched
            .len(),
        1
    );
    assert!(cluster.mons[0].monitor.has_session(&client_addr()));

    // The service replies on the leader; the reply routes back through the
    // forwarding peon to the client.
    let ack = Message::CommandAck(MonCommandAck {
        args: vec!["osd".to_string()],
        code: 0,
        status: "set".to_string(),
        data: Vec::new(),
    });
    cluster.mons[0].monitor.send_reply(client_addr(), ack.clone());
    cluster.pump();

    let delivered = cluster.client_messages_to(client_addr());
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], ack);
    // The routed-request entry is consumed by the reply.
    assert_eq!(cluster.mons[1].monitor.routed_request_count(), 0);
}

#[test]
fn outstanding_requests_are_resent_to_the_new_leader() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    let env = quorum_with_client(&mut cluster);

    cluster.mons[1].monitor.forward_request_leader(&env);

    // The first leader dies with the forward in flight.
    let old_leader = cluster.addr(0);
    cluster.pump_dropping(|_, to, _| to == old_leader);
    assert_eq!(cluster.mons[1].monitor.routed_request_count(), 1);

    // A new election (without the dead leader) re-delivers the request
    // under its original tid.
    cluster.run_election(2, &[1, 2]);
    cluster.pump_dropping(|_, to, _| to == old_leader);

    assert_eq!(
        cluster.mons[2].services[&ServiceKind::OsdMap]
            .lock()
            .dispatched
            .len(),
        1
    );
    // Still outstanding until a reply consumes it: at-least-once.
    assert_eq!(cluster.mons[1].monitor.routed_request_tids(), vec![1]);

    let ack = Message::CommandAck(MonCommandAck {
        args: vec!["osd".to_string()],
        code: 0,
        status: "set".to_string(),
        data: Vec::new(),
    });
    cluster.mons[2].monitor.send_reply(client_addr(), ack);
    cluster.pump_dropping(|_, to, _| to == old_leader);

    assert_eq!(cluster.client_messages_to(client_addr()).len(), 1);
    assert_eq!(cluster.mons[1].monitor.routed_request_count(), 0);
}

#[test]
fn routed_request_tids_increase_process_wide() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    let env = quorum_with_client(&mut cluster);

    cluster.mons[1].monitor.forward_request_leader(&env);
    let second_client: SocketAddr = "10.9.9.10:4001".parse().unwrap();
    let msg = osd_command(&cluster);
    cluster.client_send(1, second_client, msg.clone());
    let env2 = Envelope {
        from: second_client,
        from_monitor: false,
        received_at: cluster.now,
        msg,
    };
    cluster.mons[1].monitor.forward_request_leader(&env2);

    assert_eq!(cluster.mons[1].monitor.routed_request_tids(), vec![1, 2]);
}

#[test]
fn forwarded_requests_are_not_forwarded_twice() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    let env = quorum_with_client(&mut cluster);

    cluster.mons[1].monitor.forward_request_leader(&env);
    cluster.pump();

    // On the leader the fabricated session marks the request as already
    // forwarded; asking the leader to forward it again is refused.
    let fabricated = Envelope {
        from: client_addr(),
        from_monitor: false,
        received_at: cluster.now,
        msg: osd_command(&cluster),
    };
    cluster.mons[0].monitor.forward_request_leader(&fabricated);
    assert_eq!(cluster.mons[0].monitor.routed_request_count(), 0);
}

#[test]
fn closing_the_owning_session_drops_its_routed_requests() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    let env = quorum_with_client(&mut cluster);

    cluster.mons[1].monitor.forward_request_leader(&env);
    assert_eq!(cluster.mons[1].monitor.routed_request_count(), 1);

    cluster.mons[1].monitor.handle_connection_reset(client_addr());

    assert!(!cluster.mons[1].monitor.has_session(&client_addr()));
    assert_eq!(cluster.mons[1].monitor.routed_request_count(), 0);
}

#[test]
fn route_from_entity_without_coordinate_caps_is_dropped() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    let env = quorum_with_client(&mut cluster);
    cluster.mons[1].monitor.forward_request_leader(&env);
    cluster.pump();

    // A client (empty caps) injecting a route message must not be able to
    // consume the routed request.
    let rogue: SocketAddr = "10.66.0.1:9999".parse().unwrap();
    let route = Message::Route(vigil::messages::Route {
        tid: Some(1),
        dest: client_addr(),
        msg: Message::GetMap.to_bytes(),
    });
    cluster.client_send(1, rogue, route);
    assert_eq!(cluster.mons[1].monitor.routed_request_count(), 1);
}

#[test]
fn client_caps_travel_with_the_forward() {
    let mut cluster = Cluster::new(3, MonitorConfig::default());
    let env = quorum_with_client(&mut cluster);

    // Give the client distinctive caps on the peon before forwarding.
    let mut caps = CapabilityGrant::default();
    caps.grant(ServiceKind::OsdMap, vigil::caps::CAP_R | vigil::caps::CAP_W);
    assert!(cluster.mons[1]
        .monitor
        .set_session_caps(&client_addr(), caps.clone()));

    cluster.mons[1].monitor.forward_request_leader(&env);
    cluster.pump();

    // The fabricated session on the leader carries the same grant: a read
    // check passes through it, a coordinate check does not.
    let doc_cmd = Message::Command(MonCommand {
        fsid: cluster.fsid,
        args: vec!["sync_status".to_string()],
    });
    cluster.client_send(0, client_addr(), doc_cmd);
    cluster.pump();
    // sync_status needs MonMap read caps, which the client lacks: denied.
    let acks = cluster.client_messages_to(client_addr());
    assert!(acks.iter().any(|m| matches!(
        m,
        Message::CommandAck(MonCommandAck { code, .. }) if *code < 0
    )));
}
