//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use const_addrs::ip4;
use ipnetwork::Ipv4Network;
use ospf_adjsync::instance::{Instance, InstanceCfg, InstanceTx};
use ospf_adjsync::interface::{Interface, InterfaceCfg, InterfaceType};
use ospf_adjsync::neighbor::{Neighbor, nsm};
use ospf_adjsync::network::{NetRxPacketMsg, NetTxPacketMsg, Transport};
use ospf_adjsync::notification::{LsdbObserver, NbrStateChange};
use ospf_adjsync::packet::lsa::{Lsa, LsaKey};
use ospf_adjsync::packet::PacketType;
use ospf_adjsync::tasks::{
    InterfaceTimer, NeighborTimer, TimerKey, TimerService,
};

pub const AREA_ID: Ipv4Addr = ip4!("0.0.0.0");

//
// Collaborators.
//

// Transport that records all outgoing packets.
#[derive(Clone, Debug, Default)]
pub struct Recorder(Arc<Mutex<Vec<NetTxPacketMsg>>>);

// Timer service that only keeps track of the armed timers. Tests fire them
// explicitly.
#[derive(Clone, Debug, Default)]
pub struct ManualTimers(Arc<Mutex<BTreeMap<TimerKey, Duration>>>);

// Observer that records all notifications.
#[derive(Clone, Debug, Default)]
pub struct Changes {
    pub lsas: Arc<Mutex<Vec<Lsa>>>,
    pub nbrs: Arc<Mutex<Vec<NbrStateChange>>>,
}

impl Recorder {
    pub fn take(&self) -> Vec<NetTxPacketMsg> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Transport for Recorder {
    fn send_packet(&self, msg: NetTxPacketMsg) {
        self.0.lock().unwrap().push(msg);
    }
}

impl ManualTimers {
    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.0.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<TimerKey> {
        self.0.lock().unwrap().keys().cloned().collect()
    }
}

impl TimerService for ManualTimers {
    fn start_timer(&self, key: TimerKey, timeout: Duration) {
        self.0.lock().unwrap().insert(key, timeout);
    }

    fn clear_timer(&self, key: &TimerKey) {
        self.0.lock().unwrap().remove(key);
    }
}

impl Changes {
    pub fn take_lsas(&self) -> Vec<Lsa> {
        std::mem::take(&mut *self.lsas.lock().unwrap())
    }

    // Returns the sequence of states the given neighbor went through.
    pub fn nbr_states(&self, addr: Ipv4Addr) -> Vec<nsm::State> {
        self.nbrs
            .lock()
            .unwrap()
            .iter()
            .filter(|change| change.addr == addr)
            .map(|change| change.new_state)
            .collect()
    }
}

impl LsdbObserver for Changes {
    fn database_changed(&self, lsa: &Lsa) {
        self.lsas.lock().unwrap().push(lsa.clone());
    }

    fn nbr_state_change(&self, change: &NbrStateChange) {
        self.nbrs.lock().unwrap().push(change.clone());
    }
}

//
// Routers.
//

pub struct Router {
    pub instance: Instance,
    pub net: Recorder,
    pub timers: ManualTimers,
    pub changes: Changes,
}

impl Router {
    pub fn new(router_id: Ipv4Addr) -> Router {
        let net = Recorder::default();
        let timers = ManualTimers::default();
        let changes = Changes::default();
        let tx = InstanceTx {
            net: Box::new(net.clone()),
            timers: Box::new(timers.clone()),
            observer: Box::new(changes.clone()),
        };
        let config = InstanceCfg::new(router_id, AREA_ID);
        Router {
            instance: Instance::new(config, tx),
            net,
            timers,
            changes,
        }
    }

    pub fn router_id(&self) -> Ipv4Addr {
        self.instance.config.router_id
    }

    pub fn add_interface(
        &mut self,
        ifname: &str,
        if_type: InterfaceType,
        addr: Ipv4Addr,
        prefixlen: u8,
    ) -> &mut Interface {
        let addr = Ipv4Network::new(addr, prefixlen).unwrap();
        let config = InterfaceCfg::new(if_type, addr);
        self.instance.add_interface(Interface::new(ifname, config));
        self.instance.interfaces.get_mut(ifname).unwrap()
    }

    pub fn neighbor(&self, ifname: &str, addr: Ipv4Addr) -> &Neighbor {
        self.instance.neighbor(ifname, addr).unwrap()
    }

    pub fn fire(&mut self, key: TimerKey) {
        assert!(self.timers.is_armed(&key), "timer not armed: {key:?}");
        self.timers.clear_timer(&key);
        let _ = self.instance.process_timer(key);
    }

    // Fires all armed timers matching the given predicate.
    pub fn fire_all(&mut self, filter: impl Fn(&TimerKey) -> bool) {
        for key in self.timers.keys().into_iter().filter(|key| filter(key)) {
            // Processing a timer might clear other timers.
            if self.timers.is_armed(&key) {
                self.fire(key);
            }
        }
    }

    // Summary of the LSDB contents: instance identification of every LSA.
    pub fn lsdb_summary(&self) -> BTreeMap<LsaKey, (u32, u16)> {
        self.instance
            .lsdb()
            .iter()
            .map(|(key, lse)| {
                (*key, (lse.data.hdr.seq_no, lse.data.hdr.cksum))
            })
            .collect()
    }
}

pub fn nbr_timer_key(
    ifname: &str,
    addr: Ipv4Addr,
    timer: NeighborTimer,
) -> TimerKey {
    TimerKey::Neighbor {
        ifname: ifname.to_owned(),
        addr,
        timer,
    }
}

pub fn is_hello_timer(key: &TimerKey) -> bool {
    matches!(
        key,
        TimerKey::Interface {
            timer: InterfaceTimer::Hello,
            ..
        }
    )
}

pub fn is_rxmt_timer(key: &TimerKey) -> bool {
    matches!(
        key,
        TimerKey::Neighbor {
            timer: NeighborTimer::DbDescRxmt
                | NeighborTimer::LsRequestRxmt
                | NeighborTimer::LsUpdateRxmt,
            ..
        }
    )
}

pub fn pkt_type(msg: &NetTxPacketMsg) -> PacketType {
    msg.packet.hdr().pkt_type
}

//
// Topology.
//

// Endpoint of a link: router index and interface name.
pub type Endpoint = (usize, &'static str);

// Packet in flight.
#[derive(Clone, Debug)]
pub struct InFlight {
    pub from: usize,
    pub msg: NetTxPacketMsg,
}

// Set of routers interconnected by point-to-point links.
pub struct Topology {
    pub routers: Vec<Router>,
    pub links: Vec<(Endpoint, Endpoint)>,
    pub queue: VecDeque<InFlight>,
}

impl Topology {
    // Builds a chain of routers connected by point-to-point links. The
    // interface of router `i` towards router `i + 1` is named "eth1" and uses
    // the address 10.0.i.1/30; the opposite interface is "eth0" with address
    // 10.0.i.2/30.
    pub fn chain(router_ids: &[Ipv4Addr]) -> Topology {
        let mut routers = router_ids
            .iter()
            .map(|router_id| Router::new(*router_id))
            .collect::<Vec<_>>();
        let mut links = vec![];
        for i in 0..routers.len().saturating_sub(1) {
            let net = i as u8;
            routers[i].add_interface(
                "eth1",
                InterfaceType::PointToPoint,
                Ipv4Addr::new(10, 0, net, 1),
                30,
            );
            routers[i + 1].add_interface(
                "eth0",
                InterfaceType::PointToPoint,
                Ipv4Addr::new(10, 0, net, 2),
                30,
            );
            links.push(((i, "eth1"), (i + 1, "eth0")));
        }
        Topology {
            routers,
            links,
            queue: Default::default(),
        }
    }

    pub fn start(&mut self) {
        for router in &mut self.routers {
            router.instance.start();
        }
    }

    // Moves all packets sent by the routers into the in-flight queue.
    pub fn collect(&mut self) {
        for (from, router) in self.routers.iter().enumerate() {
            for msg in router.net.take() {
                self.queue.push_back(InFlight { from, msg });
            }
        }
    }

    fn peer(&self, from: usize, ifname: &str) -> Option<Endpoint> {
        self.links.iter().find_map(|(a, b)| {
            if a.0 == from && a.1 == ifname {
                Some(*b)
            } else if b.0 == from && b.1 == ifname {
                Some(*a)
            } else {
                None
            }
        })
    }

    // Delivers a packet to the router at the other end of the link.
    pub fn deliver(&mut self, pkt: InFlight) {
        let Some((to, ifname)) = self.peer(pkt.from, &pkt.msg.dst.ifname)
        else {
            return;
        };
        let router = &mut self.routers[to];
        let local_addr = router.instance.interfaces[ifname].state.src_addr;
        for dst in &pkt.msg.dst.addrs {
            if !dst.is_multicast() && *dst != local_addr {
                continue;
            }
            let msg = NetRxPacketMsg {
                ifname: ifname.to_owned(),
                src: pkt.msg.src,
                dst: *dst,
                packet: pkt.msg.packet.clone(),
            };
            let _ = router.instance.process_packet(msg);
        }
    }

    // Delivers a single in-flight packet. Returns false when there's nothing
    // left to deliver.
    pub fn step(&mut self) -> bool {
        if self.queue.is_empty() {
            self.collect();
        }
        match self.queue.pop_front() {
            Some(pkt) => {
                self.deliver(pkt);
                true
            }
            None => false,
        }
    }

    // Delivers packets until the network becomes quiet, dropping those
    // rejected by the given filter.
    pub fn run_with(&mut self, mut keep: impl FnMut(&InFlight) -> bool) {
        for _ in 0..10_000 {
            if self.queue.is_empty() {
                self.collect();
            }
            let Some(pkt) = self.queue.pop_front() else {
                return;
            };
            if keep(&pkt) {
                self.deliver(pkt);
            }
        }
        panic!("network didn't become quiet");
    }

    pub fn run(&mut self) {
        self.run_with(|_| true);
    }

    pub fn fire_hellos(&mut self) {
        for router in &mut self.routers {
            router.fire_all(is_hello_timer);
        }
    }

    pub fn fire_rxmt(&mut self) {
        for router in &mut self.routers {
            router.fire_all(is_rxmt_timer);
        }
    }

    // Starts all routers and exchanges packets until all adjacencies are
    // formed.
    pub fn converge(&mut self) {
        self.start();
        self.run();
        self.fire_hellos();
        self.run();
    }
}

// Checks whether the in-flight packet was sent by the given router and is of
// the given type.
pub fn is_packet(pkt: &InFlight, from: usize, pkt_type: PacketType) -> bool {
    pkt.from == from && pkt.msg.packet.hdr().pkt_type == pkt_type
}
