//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::InstanceUpView;
use crate::neighbor::{Neighbor, nsm};
use crate::network::{IPV4_HDR_LENGTH, NetTxPacketMsg};
use crate::output;
use crate::packet::lsa::{Lsa, LsaKey};
use crate::tasks::{InterfaceTimer, TimerKey};

pub type Interfaces = BTreeMap<String, Interface>;

#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub config: InterfaceCfg,
    pub state: InterfaceState,
    pub neighbors: BTreeMap<Ipv4Addr, Neighbor>,
}

// Interface data that neighbor operations need access to, borrowed separately
// from the interface's neighbors.
#[derive(Debug)]
pub struct InterfaceView<'a> {
    pub name: &'a str,
    pub config: &'a InterfaceCfg,
    pub state: &'a mut InterfaceState,
}

#[derive(Clone, Debug)]
pub struct InterfaceCfg {
    pub if_type: InterfaceType,
    pub addr: Ipv4Network,
    pub cost: u16,
    pub priority: u8,
    pub hello_interval: u16,
    pub dead_interval: u16,
    pub retransmit_interval: u16,
    pub poll_interval: u16,
    pub transmit_delay: u16,
    pub mtu: u16,
    pub mtu_ignore: bool,
    pub static_nbrs: BTreeMap<Ipv4Addr, StaticNbr>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceType {
    #[default]
    Broadcast,
    NonBroadcast,
    PointToMultipoint,
    PointToPoint,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct StaticNbr {
    pub priority: u8,
    pub poll_interval: Option<u16>,
}

#[derive(Debug)]
pub struct InterfaceState {
    // Whether the interface is operational.
    pub up: bool,
    // Address used as the source of all packets sent on this interface.
    pub src_addr: Ipv4Addr,
    // DR and BDR, as determined by the interface collaborator.
    pub dr: Option<Ipv4Addr>,
    pub bdr: Option<Ipv4Addr>,
    // Router IDs of neighbors in state Init or greater.
    pub nbr_ids: BTreeSet<Ipv4Addr>,
    // LSAs enqueued for flooding out this interface.
    pub ls_update_list: BTreeMap<LsaKey, Arc<Lsa>>,
}

// ===== impl Interface =====

impl Interface {
    pub fn new(name: impl Into<String>, config: InterfaceCfg) -> Interface {
        let state = InterfaceState {
            up: false,
            src_addr: config.addr.ip(),
            dr: None,
            bdr: None,
            nbr_ids: Default::default(),
            ls_update_list: Default::default(),
        };
        Interface {
            name: name.into(),
            config,
            state,
            neighbors: Default::default(),
        }
    }

    // Splits the interface into its own data and its neighbors, so both can be
    // borrowed mutably at the same time.
    pub(crate) fn split(
        &mut self,
    ) -> (InterfaceView<'_>, &mut BTreeMap<Ipv4Addr, Neighbor>) {
        let view = InterfaceView {
            name: &self.name,
            config: &self.config,
            state: &mut self.state,
        };
        (view, &mut self.neighbors)
    }

    pub(crate) fn start(&mut self, instance: &mut InstanceUpView<'_>) {
        if self.state.up {
            return;
        }

        Debug::InterfaceStart(&self.name).log();
        self.state.up = true;

        let (mut iface, neighbors) = self.split();

        // Start sending Hello packets.
        output::send_hello(&iface, neighbors, instance);
        iface.hello_timer_start(instance);

        // Statically configured NBMA neighbors are created right away.
        let (ifname, config) = (iface.name, iface.config);
        if config.if_type == InterfaceType::NonBroadcast {
            for (addr, snbr) in &config.static_nbrs {
                let nbr = neighbors.entry(*addr).or_insert_with(|| {
                    Neighbor::new(ifname, Ipv4Addr::UNSPECIFIED, *addr)
                });
                nbr.priority = snbr.priority;
                nbr.fsm(&mut iface, instance, nsm::Event::Start);
            }
        }
    }

    pub(crate) fn stop(&mut self, instance: &mut InstanceUpView<'_>) {
        if !self.state.up {
            return;
        }

        Debug::InterfaceStop(&self.name).log();

        // Kill all neighbors.
        let (mut iface, neighbors) = self.split();
        for nbr in neighbors.values_mut() {
            nbr.fsm(&mut iface, instance, nsm::Event::LinkDown);
        }

        iface.state.up = false;
        iface.state.ls_update_list.clear();
        instance.tx.timers.clear_timer(&iface.hello_timer_key());
    }

    // Updates the DR and BDR of the attached network.
    pub(crate) fn set_dr_bdr(
        &mut self,
        instance: &mut InstanceUpView<'_>,
        dr: Option<Ipv4Addr>,
        bdr: Option<Ipv4Addr>,
    ) {
        if self.state.dr == dr && self.state.bdr == bdr {
            return;
        }

        Debug::InterfaceDrChange(&self.name, dr, bdr).log();
        self.state.dr = dr;
        self.state.bdr = bdr;

        // Adjacencies might need to be formed or torn down.
        let (mut iface, neighbors) = self.split();
        for nbr in neighbors
            .values_mut()
            .filter(|nbr| nbr.state >= nsm::State::TwoWay)
        {
            nbr.fsm(&mut iface, instance, nsm::Event::AdjOk);
        }

        // The Router-LSA depends on the DR.
        instance.state.orig_pending = true;
    }

    pub fn is_up(&self) -> bool {
        self.state.up
    }
}

// ===== impl InterfaceView =====

impl InterfaceView<'_> {
    // Checks whether an adjacency should be established with the neighbor.
    pub(crate) fn need_adjacency(&self, nbr: &Neighbor) -> bool {
        match self.config.if_type {
            InterfaceType::PointToPoint | InterfaceType::PointToMultipoint => {
                true
            }
            InterfaceType::Broadcast | InterfaceType::NonBroadcast => {
                self.is_dr_or_backup()
                    || self.state.dr == Some(nbr.src)
                    || self.state.bdr == Some(nbr.src)
            }
        }
    }

    pub(crate) fn is_dr_or_backup(&self) -> bool {
        let src_addr = Some(self.state.src_addr);
        self.state.dr == src_addr || self.state.bdr == src_addr
    }

    pub(crate) fn is_dr(&self) -> bool {
        self.state.dr == Some(self.state.src_addr)
    }

    pub(crate) fn is_backup(&self) -> bool {
        self.state.bdr == Some(self.state.src_addr)
    }

    pub(crate) fn is_broadcast_or_nbma(&self) -> bool {
        matches!(
            self.config.if_type,
            InterfaceType::Broadcast | InterfaceType::NonBroadcast
        )
    }

    // Maximum size of an OSPF packet, IP header excluded.
    pub(crate) fn max_packet_size(&self) -> u16 {
        self.config.mtu.saturating_sub(IPV4_HDR_LENGTH)
    }

    pub(crate) fn rxmt_interval(&self) -> Duration {
        Duration::from_secs(self.config.retransmit_interval.into())
    }

    pub(crate) fn hello_timer_key(&self) -> TimerKey {
        TimerKey::Interface {
            ifname: self.name.to_owned(),
            timer: InterfaceTimer::Hello,
        }
    }

    pub(crate) fn hello_timer_start(&self, instance: &InstanceUpView<'_>) {
        let timeout = Duration::from_secs(self.config.hello_interval.into());
        instance.tx.timers.start_timer(self.hello_timer_key(), timeout);
    }

    pub(crate) fn send_packet(
        &self,
        instance: &InstanceUpView<'_>,
        msg: NetTxPacketMsg,
    ) {
        Debug::PacketTx(self.name, &msg.dst.addrs, &msg.packet).log();
        instance.tx.net.send_packet(msg);
    }
}

// ===== impl InterfaceCfg =====

impl InterfaceCfg {
    pub fn new(if_type: InterfaceType, addr: Ipv4Network) -> InterfaceCfg {
        InterfaceCfg {
            if_type,
            addr,
            cost: 10,
            priority: 1,
            hello_interval: 10,
            dead_interval: 40,
            retransmit_interval: 5,
            poll_interval: 120,
            transmit_delay: 1,
            mtu: 1500,
            mtu_ignore: false,
            static_nbrs: Default::default(),
        }
    }
}

// ===== global functions =====

// Looks up the given neighbor, returning it along with its interface.
pub(crate) fn neighbor_get_mut<'a>(
    interfaces: &'a mut Interfaces,
    ifname: &str,
    addr: Ipv4Addr,
) -> Result<(InterfaceView<'a>, &'a mut Neighbor), Error> {
    let iface = interfaces
        .get_mut(ifname)
        .ok_or_else(|| Error::InterfaceNotFound(ifname.to_owned()))?;
    let (iface, neighbors) = iface.split();
    let nbr = neighbors
        .get_mut(&addr)
        .ok_or_else(|| Error::NeighborNotFound(ifname.to_owned(), addr))?;
    Ok((iface, nbr))
}
