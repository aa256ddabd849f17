//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::net::Ipv4Addr;

use common::{
    AREA_ID, InFlight, Router, Topology, is_packet, is_rxmt_timer,
    nbr_timer_key, pkt_type,
};
use const_addrs::ip4;
use ipnetwork::Ipv4Network;
use ospf_adjsync::error::{Error, InterfaceCfgError};
use ospf_adjsync::interface::{
    Interface, InterfaceCfg, InterfaceType, StaticNbr,
};
use ospf_adjsync::lsdb::LSA_INIT_SEQ_NO;
use ospf_adjsync::neighbor::nsm::State;
use ospf_adjsync::network::{MulticastAddr, NetRxPacketMsg};
use ospf_adjsync::packet::lsa::{
    Lsa, LsaBody, LsaKey, LsaRouter, LsaRouterFlags, LsaRouterLinkType,
    LsaSummary, LsaTypeCode,
};
use ospf_adjsync::packet::{
    DbDesc, DbDescFlags, Hello, LsRequest, LsUpdate, Options, Packet,
    PacketHdr, PacketType,
};
use ospf_adjsync::tasks::{InterfaceTimer, NeighborTimer, TimerKey};

const RTR_A: Ipv4Addr = ip4!("1.1.1.1");
const RTR_B: Ipv4Addr = ip4!("2.2.2.2");
const RTR_C: Ipv4Addr = ip4!("3.3.3.3");

// Addresses of the link between the first two routers of a chain.
const ADDR_A: Ipv4Addr = ip4!("10.0.0.1");
const ADDR_B: Ipv4Addr = ip4!("10.0.0.2");

//
// Helper functions.
//

// Returns the interface and address of the neighbor of the given router, for
// two-router topologies.
fn peer_of(router: usize) -> (&'static str, Ipv4Addr) {
    match router {
        0 => ("eth1", ADDR_B),
        _ => ("eth0", ADDR_A),
    }
}

fn nbr_state(topo: &Topology, router: usize) -> Option<State> {
    let (ifname, addr) = peer_of(router);
    topo.routers[router].instance.nbr_state(ifname, addr)
}

fn assert_full(topo: &Topology) {
    for router in 0..2 {
        assert_eq!(nbr_state(topo, router), Some(State::Full));
    }
}

// Advances the simulation until one of the two routers sees its neighbor in
// the given state. Returns the index of that router.
fn step_until(topo: &mut Topology, target: State) -> usize {
    for _ in 0..1_000 {
        for router in 0..2 {
            if nbr_state(topo, router) == Some(target) {
                return router;
            }
        }
        if !topo.step() {
            topo.fire_hellos();
        }
    }
    panic!("neighbor never reached the {target:?} state");
}

// Advances the simulation until the next in-flight packet satisfies the given
// predicate, and removes it from the queue.
fn step_until_packet(
    topo: &mut Topology,
    pred: impl Fn(&Topology, &InFlight) -> bool,
) -> InFlight {
    for _ in 0..1_000 {
        if topo.queue.is_empty() {
            topo.collect();
        }
        if let Some(pkt) = topo.queue.front()
            && pred(topo, pkt)
        {
            return topo.queue.pop_front().unwrap();
        }
        if !topo.step() {
            topo.fire_hellos();
        }
    }
    panic!("packet never sent");
}

fn add_stub_network(topo: &mut Topology, router: usize, network: &str) {
    let network = network.parse::<Ipv4Network>().unwrap();
    let instance = &mut topo.routers[router].instance;
    instance.config.stub_networks.push(network);
    instance.originate_router_lsa();
}

fn router_lsa_key(router_id: Ipv4Addr) -> LsaKey {
    LsaKey::new(LsaTypeCode::Router.into(), router_id, router_id)
}

// Builds an LS Update packet as if it had been sent by router B.
fn lsupd_from_b(lsa: Lsa) -> NetRxPacketMsg {
    let hdr = PacketHdr {
        pkt_type: PacketType::LsUpdate,
        router_id: RTR_B,
        area_id: AREA_ID,
    };
    NetRxPacketMsg {
        ifname: "eth1".to_owned(),
        src: ADDR_B,
        dst: MulticastAddr::AllSpfRtrs.addr(),
        packet: Packet::LsUpdate(LsUpdate {
            hdr,
            lsas: vec![lsa],
        }),
    }
}

// Builds an LS Update packet as if it had been sent by router A to router B.
fn lsupd_from_a(lsa: Lsa) -> NetRxPacketMsg {
    let hdr = PacketHdr {
        pkt_type: PacketType::LsUpdate,
        router_id: RTR_A,
        area_id: AREA_ID,
    };
    NetRxPacketMsg {
        ifname: "eth0".to_owned(),
        src: ADDR_A,
        dst: MulticastAddr::AllSpfRtrs.addr(),
        packet: Packet::LsUpdate(LsUpdate {
            hdr,
            lsas: vec![lsa],
        }),
    }
}

// Builds a packet as if it had been sent by router A to router B.
fn packet_from_a(packet: Packet) -> NetRxPacketMsg {
    NetRxPacketMsg {
        ifname: "eth0".to_owned(),
        src: ADDR_A,
        dst: ADDR_B,
        packet,
    }
}

fn hdr_from_a(pkt_type: PacketType) -> PacketHdr {
    PacketHdr {
        pkt_type,
        router_id: RTR_A,
        area_id: AREA_ID,
    }
}

// Fires retransmissions until the adjacency between the first two routers
// is restored.
fn recover_full(topo: &mut Topology) {
    for _ in 0..5 {
        topo.run();
        if nbr_state(topo, 0) == Some(State::Full)
            && nbr_state(topo, 1) == Some(State::Full)
        {
            return;
        }
        topo.fire_rxmt();
    }
    assert_full(topo);
}

// Builds two routers attached to the same broadcast segment.
fn broadcast_pair() -> Topology {
    let mut routers = vec![Router::new(RTR_A), Router::new(RTR_B)];
    routers[0].add_interface("eth1", InterfaceType::Broadcast, ADDR_A, 24);
    routers[1].add_interface("eth0", InterfaceType::Broadcast, ADDR_B, 24);
    Topology {
        routers,
        links: vec![((0, "eth1"), (1, "eth0"))],
        queue: Default::default(),
    }
}

fn set_dr_bdr(
    topo: &mut Topology,
    dr: Option<Ipv4Addr>,
    bdr: Option<Ipv4Addr>,
) {
    for router in 0..2 {
        let (ifname, _) = peer_of(router);
        topo.routers[router]
            .instance
            .set_dr_bdr(ifname, dr, bdr)
            .unwrap();
    }
}

fn summary_lsa(seq_no: u32) -> Lsa {
    let body = LsaBody::SummaryNetwork(LsaSummary {
        mask: ip4!("255.255.255.0"),
        metric: 10,
    });
    Lsa::new(0, Options::E, ip4!("172.16.9.0"), ip4!("9.9.9.9"), seq_no, body)
}

//
// Tests.
//

// A freshly created interface is down and uses its configured address as the
// source of its packets.
#[test]
fn test_interface_initial_state() {
    let addr = Ipv4Network::new(ADDR_A, 30).unwrap();
    let config = InterfaceCfg::new(InterfaceType::PointToPoint, addr);
    let iface = Interface::new("eth1", config);

    assert!(!iface.is_up());
    assert_eq!(iface.state.src_addr, ADDR_A);
    assert_eq!(iface.state.dr, None);
    assert_eq!(iface.state.bdr, None);
    assert!(iface.state.nbr_ids.is_empty());
    assert!(iface.state.ls_update_list.is_empty());
    assert!(iface.neighbors.is_empty());
}

// Two routers with nothing but their own Router-LSAs form a full adjacency
// and end up with identical databases.
#[test]
fn test_bringup_empty_databases() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    assert_full(&topo);

    for router in 0..2 {
        let (ifname, addr) = peer_of(router);
        let nbr = topo.routers[router].neighbor(ifname, addr);
        assert!(!nbr.lists.requests_outstanding());
        assert!(nbr.lists.ls_rxmt.is_empty());
        assert!(nbr.lists.db_summary.is_empty());

        let timers = &topo.routers[router].timers;
        assert!(!timers.keys().iter().any(is_rxmt_timer));
    }

    let summary_a = topo.routers[0].lsdb_summary();
    let summary_b = topo.routers[1].lsdb_summary();
    assert_eq!(summary_a, summary_b);
    assert!(summary_a.contains_key(&router_lsa_key(RTR_A)));
    assert!(summary_a.contains_key(&router_lsa_key(RTR_B)));
}

// The master goes through every intermediate state exactly once, in order.
#[test]
fn test_bringup_state_sequence() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    assert_full(&topo);

    let states = topo.routers[1].changes.nbr_states(ADDR_A);
    assert_eq!(
        states,
        vec![State::Init, State::ExStart, State::Exchange, State::Full]
    );

    // The slave had to request the master's Router-LSA.
    let states = topo.routers[0].changes.nbr_states(ADDR_B);
    assert_eq!(states.first(), Some(&State::Init));
    assert_eq!(states.last(), Some(&State::Full));
    assert!(states.contains(&State::Loading));
}

// Killing a neighbor in any state tears down the adjacency completely.
#[test]
fn test_kill_from_any_state() {
    for target in [
        State::Init,
        State::ExStart,
        State::Exchange,
        State::Loading,
        State::Full,
    ] {
        let mut topo = Topology::chain(&[RTR_A, RTR_B]);
        topo.start();
        let router = step_until(&mut topo, target);
        let (ifname, addr) = peer_of(router);

        topo.routers[router]
            .instance
            .kill_neighbor(ifname, addr)
            .unwrap();

        let nbr = topo.routers[router].neighbor(ifname, addr);
        assert_eq!(nbr.state, State::Down, "killed in {target:?}");
        assert!(nbr.lists.is_empty());
        assert!(nbr.last_rcvd_dbdesc.is_none());
        assert!(nbr.last_sent_dbdesc.is_none());
        assert!(nbr.timers.is_empty());

        let timers = &topo.routers[router].timers;
        assert!(!timers.keys().iter().any(|key| matches!(
            key,
            TimerKey::Neighbor { addr: key_addr, .. } if *key_addr == addr
        )));
    }
}

// LS Updates are retransmitted unchanged until acknowledged.
#[test]
fn test_lsupd_retransmission() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    assert_full(&topo);

    // Originate a new Router-LSA while all packets from B are lost.
    add_stub_network(&mut topo, 0, "172.16.1.0/24");
    topo.run_with(|pkt| pkt.from != 1);

    let key = nbr_timer_key("eth1", ADDR_B, NeighborTimer::LsUpdateRxmt);
    assert!(topo.routers[0].timers.is_armed(&key));
    let nbr = topo.routers[0].neighbor("eth1", ADDR_B);
    assert_eq!(nbr.lists.ls_rxmt.len(), 1);
    let seq_no = nbr.lists.ls_rxmt[&router_lsa_key(RTR_A)].hdr.seq_no;

    // Every retransmission carries the same LSA instance.
    let mut sent = vec![];
    for _ in 0..3 {
        topo.routers[0].fire(key.clone());
        let msgs = topo.routers[0].net.take();
        assert_eq!(msgs.len(), 1);
        assert_eq!(pkt_type(&msgs[0]), PacketType::LsUpdate);
        sent.push(msgs[0].packet.clone());
    }
    assert!(sent.windows(2).all(|pair| pair[0] == pair[1]));
    let Packet::LsUpdate(lsupd) = &sent[0] else {
        unreachable!();
    };
    assert_eq!(lsupd.lsas.len(), 1);
    assert_eq!(lsupd.lsas[0].hdr.key(), router_lsa_key(RTR_A));
    assert_eq!(lsupd.lsas[0].hdr.seq_no, seq_no);

    // The retransmission stops once the acknowledgment gets through.
    topo.routers[0].fire(key.clone());
    topo.run();
    assert!(!topo.routers[0].timers.is_armed(&key));
    let nbr = topo.routers[0].neighbor("eth1", ADDR_B);
    assert!(nbr.lists.ls_rxmt.is_empty());
    assert_eq!(topo.routers[0].lsdb_summary(), topo.routers[1].lsdb_summary());
}

// The retransmission list holds at most one instance of each LSA.
#[test]
fn test_rxmt_list_newest_instance() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();

    add_stub_network(&mut topo, 0, "172.16.1.0/24");
    add_stub_network(&mut topo, 0, "172.16.2.0/24");
    topo.run_with(|pkt| pkt.from != 1);

    let nbr = topo.routers[0].neighbor("eth1", ADDR_B);
    assert_eq!(nbr.lists.ls_rxmt.len(), 1);
    let lsa = &nbr.lists.ls_rxmt[&router_lsa_key(RTR_A)];
    let lse = topo.routers[0]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_A))
        .unwrap();
    assert_eq!(lsa.hdr.seq_no, lse.data.hdr.seq_no);
}

// Receiving the same Hello twice has no effect on an established adjacency.
#[test]
fn test_duplicate_hello() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    assert_full(&topo);
    let changes = topo.routers[1].changes.nbr_states(ADDR_A).len();

    let key = TimerKey::Interface {
        ifname: "eth1".to_owned(),
        timer: InterfaceTimer::Hello,
    };
    topo.routers[0].fire(key);
    let msg = topo.routers[0].net.take().pop().unwrap();
    assert_eq!(pkt_type(&msg), PacketType::Hello);
    for _ in 0..2 {
        topo.deliver(InFlight {
            from: 0,
            msg: msg.clone(),
        });
    }

    assert_full(&topo);
    assert_eq!(topo.routers[1].changes.nbr_states(ADDR_A).len(), changes);
    assert!(topo.routers[1].net.take().is_empty());
    let key = nbr_timer_key("eth0", ADDR_A, NeighborTimer::Inactivity);
    assert!(topo.routers[1].timers.is_armed(&key));
}

// The master silently discards duplicate Database Description packets.
#[test]
fn test_duplicate_dbdesc_master() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.start();

    let pkt = step_until_packet(&mut topo, |topo, pkt| {
        is_packet(pkt, 0, PacketType::DbDesc)
            && nbr_state(topo, 1) == Some(State::Exchange)
    });
    topo.deliver(pkt.clone());
    topo.collect();
    topo.deliver(pkt);
    assert!(topo.routers[1].net.take().is_empty());

    topo.run();
    assert_full(&topo);
}

// The slave answers duplicate Database Description packets by repeating its
// last response.
#[test]
fn test_duplicate_dbdesc_slave() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.start();

    let pkt = step_until_packet(&mut topo, |topo, pkt| {
        is_packet(pkt, 1, PacketType::DbDesc)
            && nbr_state(topo, 0) == Some(State::Exchange)
    });
    topo.deliver(pkt.clone());
    topo.collect();
    let last_sent = topo.routers[0]
        .neighbor("eth1", ADDR_B)
        .last_sent_dbdesc
        .clone()
        .unwrap();

    topo.deliver(pkt);
    let msgs = topo.routers[0].net.take();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].packet, last_sent.packet);

    topo.run();
    assert_full(&topo);
}

// All routers of a chain learn every Router-LSA, including the stub networks
// configured on the remote routers.
#[test]
fn test_chain_convergence() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B, RTR_C]);
    let stubs = ["172.16.1.0/24", "172.16.2.0/24", "172.16.3.0/24"];
    for (router, stub) in stubs.iter().enumerate() {
        let network = stub.parse::<Ipv4Network>().unwrap();
        topo.routers[router]
            .instance
            .config
            .stub_networks
            .push(network);
    }
    topo.converge();

    assert!(topo.routers[0].instance.is_adjacency_full("eth1", ADDR_B));
    assert!(topo.routers[1].instance.is_adjacency_full("eth0", ADDR_A));
    assert!(
        topo.routers[1]
            .instance
            .is_adjacency_full("eth1", ip4!("10.0.1.2"))
    );
    assert!(
        topo.routers[2]
            .instance
            .is_adjacency_full("eth0", ip4!("10.0.1.1"))
    );

    let summary = topo.routers[0].lsdb_summary();
    assert_eq!(summary.len(), 3);
    for router in &topo.routers[1..] {
        assert_eq!(router.lsdb_summary(), summary);
    }

    // Router C's stub network is known by router A.
    let lse = topo.routers[0]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_C))
        .unwrap();
    let LsaBody::Router(lsa_body) = &lse.data.body else {
        unreachable!();
    };
    assert!(lsa_body.links.iter().any(|link| {
        link.link_type == LsaRouterLinkType::StubNetwork
            && link.link_id == ip4!("172.16.3.0")
    }));
}

// Lost LS Updates are recovered through retransmissions.
#[test]
fn test_lost_lsupd_recovery() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B, RTR_C]);
    topo.converge();

    add_stub_network(&mut topo, 2, "172.16.3.0/24");
    topo.run_with(|pkt| pkt.msg.packet.hdr().pkt_type != PacketType::LsUpdate);
    assert_ne!(topo.routers[0].lsdb_summary(), topo.routers[2].lsdb_summary());

    // Retransmissions go through once the network stops losing updates.
    topo.fire_rxmt();
    topo.run();

    let summary = topo.routers[2].lsdb_summary();
    assert_eq!(topo.routers[0].lsdb_summary(), summary);
    assert_eq!(topo.routers[1].lsdb_summary(), summary);
    for router in &topo.routers {
        assert!(!router.timers.keys().iter().any(|key| matches!(
            key,
            TimerKey::Neighbor {
                timer: NeighborTimer::LsUpdateRxmt,
                ..
            }
        )));
    }
}

// A router receiving a more recent instance of its own Router-LSA originates
// a new instance with a higher sequence number.
#[test]
fn test_self_originated_newer_instance() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();

    let seq_no = LSA_INIT_SEQ_NO + 10;
    let body = LsaBody::Router(LsaRouter {
        flags: LsaRouterFlags::empty(),
        links: vec![],
    });
    let lsa = Lsa::new(0, Options::E, RTR_A, RTR_A, seq_no, body);
    topo.routers[0]
        .instance
        .process_packet(lsupd_from_b(lsa))
        .unwrap();

    let lse = topo.routers[0]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_A))
        .unwrap();
    assert_eq!(lse.data.hdr.seq_no, seq_no + 1);
    let LsaBody::Router(lsa_body) = &lse.data.body else {
        unreachable!();
    };
    assert!(!lsa_body.links.is_empty());

    topo.run();
    assert_eq!(topo.routers[0].lsdb_summary(), topo.routers[1].lsdb_summary());
}

// Self-originated LSAs that the router no longer originates are flushed and
// later removed from the database.
#[test]
fn test_self_originated_flush() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();

    let lsa_id = ip4!("172.16.9.0");
    let body = LsaBody::SummaryNetwork(LsaSummary {
        mask: ip4!("255.255.255.0"),
        metric: 10,
    });
    let lsa = Lsa::new(0, Options::E, lsa_id, RTR_A, LSA_INIT_SEQ_NO, body);
    let lsa_key = lsa.hdr.key();
    topo.routers[0]
        .instance
        .process_packet(lsupd_from_b(lsa))
        .unwrap();

    // Prematurely aged.
    let lse = topo.routers[0].instance.lsdb().get(&lsa_key).unwrap();
    assert!(lse.data.hdr.is_maxage());
    assert!(topo.routers[0].instance.lsdb().maxage_lsas.contains(&lsa_key));

    // Removed by the MaxAge sweep once acknowledged.
    topo.run();
    assert!(
        topo.routers[0]
            .neighbor("eth1", ADDR_B)
            .lists
            .ls_rxmt
            .is_empty()
    );
    topo.routers[0].fire(TimerKey::LsdbMaxAgeSweep);
    assert!(topo.routers[0].instance.lsdb().get(&lsa_key).is_none());
    assert!(topo.routers[0].timers.is_armed(&TimerKey::LsdbMaxAgeSweep));
    assert!(topo.routers[1].instance.lsdb().get(&lsa_key).is_none());
}

// Database changes are reported only when LSA contents change.
#[test]
fn test_database_change_notifications() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    topo.routers[1].changes.take_lsas();

    add_stub_network(&mut topo, 0, "172.16.1.0/24");
    topo.run();
    let lsas = topo.routers[1].changes.take_lsas();
    assert_eq!(lsas.len(), 1);
    assert_eq!(lsas[0].hdr.key(), router_lsa_key(RTR_A));

    // Requesting a new origination without changes is a no-op.
    topo.routers[0].instance.originate_router_lsa();
    topo.run();
    assert!(topo.routers[1].changes.take_lsas().is_empty());
    let lse = topo.routers[1]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_A))
        .unwrap();
    assert_eq!(*lse.data, lsas[0]);
}

// Hellos with mismatching parameters are rejected without creating neighbors.
#[test]
fn test_hello_sanity_checks() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.start();
    topo.routers[0].net.take();

    let hello = |router_id, hello_interval, dead_interval| {
        let hdr = PacketHdr {
            pkt_type: PacketType::Hello,
            router_id,
            area_id: AREA_ID,
        };
        NetRxPacketMsg {
            ifname: "eth1".to_owned(),
            src: ADDR_B,
            dst: MulticastAddr::AllSpfRtrs.addr(),
            packet: Packet::Hello(Hello {
                hdr,
                network_mask: ip4!("255.255.255.252"),
                hello_interval,
                options: Options::E,
                priority: 1,
                dead_interval,
                dr: None,
                bdr: None,
                neighbors: Default::default(),
            }),
        }
    };

    let instance = &mut topo.routers[0].instance;
    let error = instance.process_packet(hello(RTR_B, 5, 40)).unwrap_err();
    assert!(matches!(
        error,
        Error::InterfaceCfgError(
            _,
            _,
            PacketType::Hello,
            InterfaceCfgError::HelloIntervalMismatch(5, 10)
        )
    ));
    let error = instance.process_packet(hello(RTR_B, 10, 20)).unwrap_err();
    assert!(matches!(
        error,
        Error::InterfaceCfgError(
            _,
            _,
            _,
            InterfaceCfgError::DeadIntervalMismatch(20, 40)
        )
    ));
    let error = instance.process_packet(hello(RTR_A, 10, 40)).unwrap_err();
    assert!(matches!(
        error,
        Error::InterfaceCfgError(
            _,
            _,
            _,
            InterfaceCfgError::DuplicateRouterId(RTR_A)
        )
    ));
    assert!(instance.neighbor("eth1", ADDR_B).is_none());
    assert!(topo.routers[0].net.take().is_empty());

    // A valid Hello creates the neighbor.
    let instance = &mut topo.routers[0].instance;
    instance.process_packet(hello(RTR_B, 10, 40)).unwrap();
    assert_eq!(instance.nbr_state("eth1", ADDR_B), Some(State::Init));
}

// Packets other than Hellos are only accepted from known neighbors.
#[test]
fn test_unknown_neighbor() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.start();

    let lsa = topo.routers[1]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_B))
        .unwrap()
        .data
        .as_ref()
        .clone();
    let error = topo.routers[0]
        .instance
        .process_packet(lsupd_from_b(lsa))
        .unwrap_err();
    assert!(matches!(error, Error::UnknownNeighbor(ADDR_B, RTR_B)));
    assert!(
        topo.routers[0]
            .instance
            .lsdb()
            .get(&router_lsa_key(RTR_B))
            .is_none()
    );
}

// A Database Description packet that doesn't follow the exchange restarts it.
#[test]
fn test_seq_no_mismatch_in_exchange() {
    let corruptions: [fn(&mut DbDesc); 3] = [
        |dbdesc| dbdesc.dd_seq_no = dbdesc.dd_seq_no.wrapping_add(5),
        |dbdesc| dbdesc.dd_flags.insert(DbDescFlags::I),
        |dbdesc| dbdesc.options.remove(Options::E),
    ];
    for corrupt in corruptions {
        let mut topo = Topology::chain(&[RTR_A, RTR_B]);
        topo.start();

        let mut pkt = step_until_packet(&mut topo, |topo, pkt| {
            is_packet(pkt, 0, PacketType::DbDesc)
                && nbr_state(topo, 1) == Some(State::Exchange)
        });
        let Packet::DbDesc(dbdesc) = &mut pkt.msg.packet else {
            unreachable!();
        };
        corrupt(dbdesc);
        topo.deliver(pkt);
        assert_eq!(nbr_state(&topo, 1), Some(State::ExStart));

        recover_full(&mut topo);
        let states = topo.routers[1].changes.nbr_states(ADDR_A);
        assert_eq!(
            states.iter().filter(|state| **state == State::ExStart).count(),
            2
        );
    }
}

// A new Database Description packet received once the exchange is over
// restarts it.
#[test]
fn test_seq_no_mismatch_after_exchange() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    assert_full(&topo);

    let packet = Packet::DbDesc(DbDesc {
        hdr: hdr_from_a(PacketType::DbDesc),
        mtu: 1500,
        options: Options::E,
        dd_flags: DbDescFlags::empty(),
        dd_seq_no: 0x1234,
        lsa_hdrs: vec![],
    });
    topo.routers[1]
        .instance
        .process_packet(packet_from_a(packet))
        .unwrap();
    assert_eq!(nbr_state(&topo, 1), Some(State::ExStart));
    let nbr = topo.routers[1].neighbor("eth0", ADDR_A);
    assert!(nbr.lists.is_empty());
    assert!(nbr.dd_flags.contains(DbDescFlags::I | DbDescFlags::MS));

    recover_full(&mut topo);
    assert_eq!(topo.routers[0].lsdb_summary(), topo.routers[1].lsdb_summary());
}

// Requesting an LSA that isn't in the database restarts the exchange.
#[test]
fn test_bad_ls_request() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    assert_full(&topo);

    let packet = Packet::LsRequest(LsRequest {
        hdr: hdr_from_a(PacketType::LsRequest),
        entries: vec![router_lsa_key(ip4!("9.9.9.9"))],
    });
    topo.routers[1]
        .instance
        .process_packet(packet_from_a(packet))
        .unwrap();
    assert_eq!(nbr_state(&topo, 1), Some(State::ExStart));
    assert!(topo.routers[1].neighbor("eth0", ADDR_A).lists.is_empty());

    recover_full(&mut topo);
    let states = topo.routers[1].changes.nbr_states(ADDR_A);
    assert_eq!(states.last(), Some(&State::Full));
    assert_eq!(topo.routers[0].lsdb_summary(), topo.routers[1].lsdb_summary());
}

// Bringing an interface down kills its neighbors and withdraws the link from
// the Router-LSA.
#[test]
fn test_interface_down() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);
    topo.converge();
    assert_full(&topo);

    topo.routers[0].instance.interface_down("eth1").unwrap();
    assert!(!topo.routers[0].instance.interfaces["eth1"].is_up());

    let nbr = topo.routers[0].neighbor("eth1", ADDR_B);
    assert_eq!(nbr.state, State::Down);
    assert!(nbr.lists.is_empty());
    assert!(nbr.timers.is_empty());
    let hello_key = TimerKey::Interface {
        ifname: "eth1".to_owned(),
        timer: InterfaceTimer::Hello,
    };
    let timers = &topo.routers[0].timers;
    assert!(!timers.is_armed(&hello_key));
    assert!(
        !timers
            .keys()
            .iter()
            .any(|key| matches!(key, TimerKey::Neighbor { .. }))
    );

    let lse = topo.routers[0]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_A))
        .unwrap();
    let LsaBody::Router(lsa_body) = &lse.data.body else {
        unreachable!();
    };
    assert!(lsa_body.links.is_empty());

    // Nothing leaves a down interface.
    topo.collect();
    assert!(topo.queue.iter().all(|pkt| pkt.from != 0));

    // The remote router notices once its Inactivity Timer expires.
    let key = nbr_timer_key("eth0", ADDR_A, NeighborTimer::Inactivity);
    topo.routers[1].fire(key);
    assert_eq!(nbr_state(&topo, 1), Some(State::Down));
    let lse = topo.routers[1]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_B))
        .unwrap();
    let LsaBody::Router(lsa_body) = &lse.data.body else {
        unreachable!();
    };
    assert!(
        lsa_body
            .links
            .iter()
            .all(|link| link.link_type != LsaRouterLinkType::PointToPoint)
    );
}

// Lost LS Requests are retransmitted until answered.
#[test]
fn test_lsreq_retransmission() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B]);

    // Router A's requests are lost, and so is everything router B floods.
    let lossy = |pkt: &InFlight| {
        !is_packet(pkt, 0, PacketType::LsRequest)
            && !is_packet(pkt, 1, PacketType::LsUpdate)
    };
    topo.start();
    topo.run_with(lossy);
    topo.fire_hellos();
    topo.run_with(lossy);

    assert_eq!(nbr_state(&topo, 0), Some(State::Loading));
    let key = nbr_timer_key("eth1", ADDR_B, NeighborTimer::LsRequestRxmt);
    assert!(topo.routers[0].timers.is_armed(&key));
    let nbr = topo.routers[0].neighbor("eth1", ADDR_B);
    assert!(
        nbr.lists
            .ls_request_pending
            .contains_key(&router_lsa_key(RTR_B))
    );

    // The retransmission requests the same LSA again.
    topo.routers[0].fire(key.clone());
    let msgs = topo.routers[0].net.take();
    assert_eq!(msgs.len(), 1);
    let Packet::LsRequest(ls_req) = &msgs[0].packet else {
        unreachable!();
    };
    assert_eq!(ls_req.entries, vec![router_lsa_key(RTR_B)]);
    assert!(topo.routers[0].timers.is_armed(&key));

    for msg in msgs {
        topo.queue.push_back(InFlight { from: 0, msg });
    }
    topo.run();
    assert_full(&topo);
    assert!(!topo.routers[0].timers.is_armed(&key));
}

fn nbma_nbr_state(router: &Router) -> Option<State> {
    router.instance.nbr_state("eth0", ip4!("10.0.0.2"))
}

// Statically configured NBMA neighbors are polled while dead.
#[test]
fn test_nbma_poll() {
    let nbr_addr = ip4!("10.0.0.2");
    let mut router = Router::new(RTR_A);
    let iface = router.add_interface(
        "eth0",
        InterfaceType::NonBroadcast,
        ip4!("10.0.0.1"),
        24,
    );
    let snbr = StaticNbr {
        priority: 1,
        poll_interval: Some(60),
    };
    iface.config.static_nbrs.insert(nbr_addr, snbr);
    router.instance.start();

    // Started neighbors are sent a Hello right away.
    assert_eq!(nbma_nbr_state(&router), Some(State::Attempt));
    let msgs = router.net.take();
    assert_eq!(msgs.len(), 1);
    assert_eq!(pkt_type(&msgs[0]), PacketType::Hello);
    assert_eq!(msgs[0].dst.addrs.as_slice(), &[nbr_addr]);

    let inactivity_key =
        nbr_timer_key("eth0", nbr_addr, NeighborTimer::Inactivity);
    let poll_key = nbr_timer_key("eth0", nbr_addr, NeighborTimer::Poll);
    router.fire(inactivity_key.clone());
    assert_eq!(nbma_nbr_state(&router), Some(State::Down));
    assert!(router.timers.is_armed(&poll_key));

    // Dead neighbors are left out of the regular Hellos.
    router.fire(TimerKey::Interface {
        ifname: "eth0".to_owned(),
        timer: InterfaceTimer::Hello,
    });
    assert!(router.net.take().is_empty());

    // Each poll sends a unicast Hello and schedules the next one.
    router.fire(poll_key.clone());
    let msgs = router.net.take();
    assert_eq!(msgs.len(), 1);
    assert_eq!(pkt_type(&msgs[0]), PacketType::Hello);
    assert_eq!(msgs[0].dst.addrs.as_slice(), &[nbr_addr]);
    assert!(router.timers.is_armed(&poll_key));

    // Polling stops once the neighbor is heard from.
    let hello = NetRxPacketMsg {
        ifname: "eth0".to_owned(),
        src: nbr_addr,
        dst: ip4!("10.0.0.1"),
        packet: Packet::Hello(Hello {
            hdr: PacketHdr {
                pkt_type: PacketType::Hello,
                router_id: RTR_B,
                area_id: AREA_ID,
            },
            network_mask: ip4!("255.255.255.0"),
            hello_interval: 10,
            options: Options::E,
            priority: 1,
            dead_interval: 40,
            dr: None,
            bdr: None,
            neighbors: Default::default(),
        }),
    };
    router.instance.process_packet(hello).unwrap();
    assert_eq!(nbma_nbr_state(&router), Some(State::Init));
    assert!(!router.timers.is_armed(&poll_key));

    // Dead again: polling resumes.
    router.fire(inactivity_key.clone());
    assert_eq!(nbma_nbr_state(&router), Some(State::Down));
    assert!(router.timers.is_armed(&poll_key));

    // Killed neighbors are left alone until heard from again.
    router.instance.kill_neighbor("eth0", nbr_addr).unwrap();
    assert_eq!(nbma_nbr_state(&router), Some(State::Down));
    assert!(!router.timers.is_armed(&poll_key));
    assert!(!router.timers.is_armed(&inactivity_key));
}

// On broadcast segments only the DR and the BDR form adjacencies, and the DR
// describes the segment in a Network-LSA.
#[test]
fn test_broadcast_dr_adjacency() {
    let mut topo = broadcast_pair();
    topo.converge();
    for router in 0..2 {
        assert_eq!(nbr_state(&topo, router), Some(State::TwoWay));
    }

    set_dr_bdr(&mut topo, Some(ADDR_B), Some(ADDR_A));
    recover_full(&mut topo);

    let summary = topo.routers[0].lsdb_summary();
    assert_eq!(summary, topo.routers[1].lsdb_summary());
    let network_key =
        LsaKey::new(LsaTypeCode::Network.into(), RTR_B, ADDR_B);
    let lse = topo.routers[0].instance.lsdb().get(&network_key).unwrap();
    let LsaBody::Network(lsa_body) = &lse.data.body else {
        unreachable!();
    };
    assert!(lsa_body.attached_rtrs.contains(&RTR_A));
    assert!(lsa_body.attached_rtrs.contains(&RTR_B));

    let lse = topo.routers[1]
        .instance
        .lsdb()
        .get(&router_lsa_key(RTR_A))
        .unwrap();
    let LsaBody::Router(lsa_body) = &lse.data.body else {
        unreachable!();
    };
    assert!(lsa_body.links.iter().any(|link| {
        link.link_type == LsaRouterLinkType::TransitNetwork
            && link.link_id == ADDR_B
    }));

    // Neither router is DR or BDR anymore: the adjacency is torn down.
    set_dr_bdr(&mut topo, Some(ip4!("10.0.0.3")), None);
    for router in 0..2 {
        assert_eq!(nbr_state(&topo, router), Some(State::TwoWay));
        let (ifname, addr) = peer_of(router);
        assert!(topo.routers[router].neighbor(ifname, addr).lists.is_empty());
    }
    let lse = topo.routers[1].instance.lsdb().get(&network_key).unwrap();
    assert!(lse.data.hdr.is_maxage());
}

// A newer instance of an LSA with unchanged contents replaces the older one
// on the retransmission lists, so it still reaches every neighbor.
#[test]
fn test_rxmt_list_unchanged_newer_instance() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B, RTR_C]);
    topo.converge();
    let addr_c = ip4!("10.0.1.2");

    // Router B learns the LSA while its updates to router C are lost.
    let lsa = summary_lsa(LSA_INIT_SEQ_NO);
    let lsa_key = lsa.hdr.key();
    topo.routers[1]
        .instance
        .process_packet(lsupd_from_a(lsa))
        .unwrap();
    topo.run_with(|pkt| !is_packet(pkt, 1, PacketType::LsUpdate));
    let nbr = topo.routers[1].neighbor("eth1", addr_c);
    assert_eq!(nbr.lists.ls_rxmt[&lsa_key].hdr.seq_no, LSA_INIT_SEQ_NO);
    assert!(topo.routers[2].instance.lsdb().get(&lsa_key).is_none());

    // A refresh with the same contents isn't flooded.
    topo.routers[1]
        .instance
        .process_packet(lsupd_from_a(summary_lsa(LSA_INIT_SEQ_NO + 1)))
        .unwrap();
    topo.collect();
    assert!(
        !topo
            .queue
            .iter()
            .any(|pkt| is_packet(pkt, 1, PacketType::LsUpdate))
    );
    let nbr = topo.routers[1].neighbor("eth1", addr_c);
    assert_eq!(nbr.lists.ls_rxmt[&lsa_key].hdr.seq_no, LSA_INIT_SEQ_NO + 1);
    let key = nbr_timer_key("eth1", addr_c, NeighborTimer::LsUpdateRxmt);
    assert!(topo.routers[1].timers.is_armed(&key));

    // The retransmission delivers the newest instance.
    topo.run();
    topo.fire_rxmt();
    topo.run();
    let lse = topo.routers[2].instance.lsdb().get(&lsa_key).unwrap();
    assert_eq!(lse.data.hdr.seq_no, LSA_INIT_SEQ_NO + 1);
    assert!(topo.routers[1].neighbor("eth1", addr_c).lists.ls_rxmt.is_empty());
    assert_eq!(topo.routers[1].lsdb_summary(), topo.routers[2].lsdb_summary());
}

// LSA ages only grow by InfTransDelay on every hop, no matter how long the
// LSAs stay in the database.
#[test]
fn test_lsa_age_per_hop() {
    let mut topo = Topology::chain(&[RTR_A, RTR_B, RTR_C]);
    topo.converge();

    let ages = topo
        .routers
        .iter()
        .map(|router| {
            router
                .instance
                .lsdb()
                .get(&router_lsa_key(RTR_A))
                .unwrap()
                .data
                .hdr
                .age
        })
        .collect::<Vec<_>>();
    assert_eq!(ages, vec![0, 1, 2]);

    // Retransmissions add InfTransDelay to the stored age.
    add_stub_network(&mut topo, 0, "172.16.1.0/24");
    topo.run_with(|pkt| pkt.from != 1);
    let key = nbr_timer_key("eth1", ADDR_B, NeighborTimer::LsUpdateRxmt);
    topo.routers[0].fire(key);
    let msgs = topo.routers[0].net.take();
    let Packet::LsUpdate(lsupd) = &msgs[0].packet else {
        unreachable!();
    };
    assert_eq!(lsupd.lsas[0].hdr.age, 1);
}
