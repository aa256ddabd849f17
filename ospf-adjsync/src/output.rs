//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::net::Ipv4Addr;
use std::sync::Arc;

use smallvec::{SmallVec, smallvec};

use crate::instance::InstanceUpView;
use crate::interface::{InterfaceType, InterfaceView, Interfaces};
use crate::lsdb;
use crate::neighbor::{Neighbor, nsm};
use crate::network::{MulticastAddr, NetTxPacketMsg, SendDestination};
use crate::packet::lsa::{Lsa, LsaHdr, LsaKey};
use crate::packet::{
    DbDesc, DbDescFlags, Hello, LsAck, LsRequest, LsUpdate, Options, Packet,
    PacketHdr, PacketType,
};
use crate::tasks::NeighborTimer;

// ===== Hello Packets =====

pub(crate) fn send_hello(
    iface: &InterfaceView<'_>,
    neighbors: &BTreeMap<Ipv4Addr, Neighbor>,
    instance: &InstanceUpView<'_>,
) {
    let addrs: SmallVec<[Ipv4Addr; 4]> = match iface.config.if_type {
        InterfaceType::NonBroadcast => {
            // Neighbors in the Down state are polled separately.
            neighbors
                .values()
                .filter(|nbr| nbr.state > nsm::State::Down)
                .map(|nbr| nbr.src)
                .collect()
        }
        _ => smallvec![MulticastAddr::AllSpfRtrs.addr()],
    };
    if addrs.is_empty() {
        return;
    }

    // Enqueue packet for network transmission.
    let msg = NetTxPacketMsg {
        packet: hello_generate(iface, instance),
        src: iface.state.src_addr,
        dst: SendDestination::new(iface.name.to_owned(), addrs),
    };
    iface.send_packet(instance, msg);
}

pub(crate) fn send_hello_nbr(
    nbr: &Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) {
    let msg = NetTxPacketMsg {
        packet: hello_generate(iface, instance),
        src: iface.state.src_addr,
        dst: SendDestination::new(iface.name.to_owned(), smallvec![nbr.src]),
    };
    iface.send_packet(instance, msg);
}

fn hello_generate(
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) -> Packet {
    Packet::Hello(Hello {
        hdr: packet_hdr(instance, PacketType::Hello),
        network_mask: iface.config.addr.mask(),
        hello_interval: iface.config.hello_interval,
        options: Options::E,
        priority: iface.config.priority,
        dead_interval: iface.config.dead_interval.into(),
        dr: iface.state.dr,
        bdr: iface.state.bdr,
        neighbors: iface.state.nbr_ids.clone(),
    })
}

// ===== Database Description Packets =====

// Sends the next Database Description packet of the exchange, describing as
// many entries of the neighbor's summary list as fit in one packet.
pub(crate) fn send_dbdesc(
    nbr: &mut Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) {
    let budget = payload_budget(iface, DbDesc::BASE_LENGTH);
    let summary = &mut nbr.lists.db_summary;
    let lsa_hdrs: Vec<LsaHdr> = std::iter::from_fn(|| summary.pop())
        .take(usize::from(budget / LsaHdr::LENGTH))
        .map(|lsa| lsa.hdr)
        .collect();

    // Our side of the exchange is over once the summary list drains.
    if !nbr.dd_flags.contains(DbDescFlags::I) && nbr.lists.db_summary.is_empty()
    {
        nbr.dd_flags.remove(DbDescFlags::M);
    }

    let packet = Packet::DbDesc(DbDesc {
        hdr: packet_hdr(instance, PacketType::DbDesc),
        mtu: iface.config.mtu,
        options: Options::E,
        dd_flags: nbr.dd_flags,
        dd_seq_no: nbr.dd_seq_no,
        lsa_hdrs,
    });
    let msg = nbr_msg(nbr, iface, packet);
    nbr.last_sent_dbdesc = Some(msg.clone());
    iface.send_packet(instance, msg);

    // Only the master and a router still negotiating the exchange (I-bit)
    // retransmit Database Description packets.
    if nbr.dd_flags.intersects(DbDescFlags::MS | DbDescFlags::I) {
        let timeout = iface.rxmt_interval();
        nbr.timer_start(instance, NeighborTimer::DbDescRxmt, timeout);
    }
}

pub(crate) fn rxmt_dbdesc(
    nbr: &Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) {
    if let Some(msg) = &nbr.last_sent_dbdesc {
        iface.send_packet(instance, msg.clone());
    }
}

// ===== LS Request Packets =====

// Moves entries from the neighbor's request list to the set of outstanding
// requests, up to what a single packet holds, then requests the whole set.
pub(crate) fn send_lsreq(
    nbr: &mut Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) {
    let capacity =
        usize::from(payload_budget(iface, 0) / LsRequest::ENTRY_LENGTH);
    let lists = &mut nbr.lists;
    while lists.ls_request_pending.len() < capacity {
        let Some((lsa_key, lsa_hdr)) = lists.ls_request.pop_first() else {
            break;
        };
        lists.ls_request_pending.insert(lsa_key, lsa_hdr);
    }

    rxmt_lsreq(nbr, iface, instance);

    let timeout = iface.rxmt_interval();
    nbr.timer_start(instance, NeighborTimer::LsRequestRxmt, timeout);
}

// Requests all outstanding LSAs again.
pub(crate) fn rxmt_lsreq(
    nbr: &Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) {
    let packet = Packet::LsRequest(LsRequest {
        hdr: packet_hdr(instance, PacketType::LsRequest),
        entries: nbr.lists.ls_request_pending.keys().copied().collect(),
    });
    iface.send_packet(instance, nbr_msg(nbr, iface, packet));
}

// ===== LS Update Packets =====

// Sends all LSAs enqueued for flooding out the given interface.
pub(crate) fn send_lsupd_iface(
    iface: &mut InterfaceView<'_>,
    neighbors: &BTreeMap<Ipv4Addr, Neighbor>,
    instance: &InstanceUpView<'_>,
) {
    let ls_update_list = std::mem::take(&mut iface.state.ls_update_list);
    if ls_update_list.is_empty() {
        return;
    }

    let dst = send_dest_iface(iface, neighbors);
    if dst.addrs.is_empty() {
        return;
    }
    send_lsupd(iface, instance, dst, ls_update_list);
}

// Sends all LSAs enqueued for transmission to the given neighbor.
pub(crate) fn send_lsupd_nbr(
    nbr: &mut Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) {
    let ls_update_list = std::mem::take(&mut nbr.lists.ls_update);
    if ls_update_list.is_empty() {
        return;
    }

    let dst = send_dest_nbr(nbr, iface);
    send_lsupd(iface, instance, dst, ls_update_list);
}

// Sends all pending LS Updates of every interface and neighbor.
pub(crate) fn send_lsupd_pending(
    instance: &InstanceUpView<'_>,
    interfaces: &mut Interfaces,
) {
    for iface in interfaces.values_mut().filter(|iface| iface.is_up()) {
        let (mut iface, neighbors) = iface.split();
        send_lsupd_iface(&mut iface, neighbors, instance);
        for nbr in neighbors.values_mut() {
            send_lsupd_nbr(nbr, &iface, instance);
        }
    }
}

// Floods the given LSAs, using as many LS Updates as the interface MTU
// requires.
fn send_lsupd(
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
    dst: SendDestination,
    ls_update_list: BTreeMap<LsaKey, Arc<Lsa>>,
) {
    let budget = payload_budget(iface, LsUpdate::BASE_LENGTH);
    let mut pending = ls_update_list.into_values().peekable();
    while pending.peek().is_some() {
        let lsas = lsupd_batch(&mut pending, budget, iface);
        let msg = NetTxPacketMsg {
            packet: lsupd_packet(instance, lsas),
            src: iface.state.src_addr,
            dst: dst.clone(),
        };
        iface.send_packet(instance, msg);
    }
}

// Retransmits the LSAs not yet acknowledged by the neighbor. Whatever doesn't
// fit in one packet waits for the next retransmission.
pub(crate) fn rxmt_lsupd(
    nbr: &Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
) {
    let budget = payload_budget(iface, LsUpdate::BASE_LENGTH);
    let mut pending = nbr.lists.ls_rxmt.values().peekable();
    let lsas = lsupd_batch(&mut pending, budget, iface);
    let packet = lsupd_packet(instance, lsas);
    iface.send_packet(instance, nbr_msg(nbr, iface, packet));
}

// Takes LSAs off `pending` until the next one would overflow `budget`. An LSA
// larger than the budget is sent alone and left to IP fragmentation.
fn lsupd_batch<I, L>(
    pending: &mut Peekable<I>,
    budget: u16,
    iface: &InterfaceView<'_>,
) -> Vec<Lsa>
where
    I: Iterator<Item = L>,
    L: AsRef<Lsa>,
{
    let mut total: u16 = 0;
    let mut lsas = vec![];
    while let Some(lsa) = pending.next_if(|lsa| {
        total == 0 || total.saturating_add(lsa.as_ref().hdr.length) <= budget
    }) {
        let lsa = lsa.as_ref();
        total = total.saturating_add(lsa.hdr.length);
        lsas.push(lsa_tx_copy(lsa, iface));
    }
    lsas
}

fn lsupd_packet(instance: &InstanceUpView<'_>, lsas: Vec<Lsa>) -> Packet {
    Packet::LsUpdate(LsUpdate {
        hdr: packet_hdr(instance, PacketType::LsUpdate),
        lsas,
    })
}

// ===== LS Ack Packets =====

pub(crate) fn send_lsack_direct(
    nbr: &Neighbor,
    iface: &InterfaceView<'_>,
    instance: &InstanceUpView<'_>,
    lsa_hdr: &LsaHdr,
) {
    let packet = Packet::LsAck(LsAck {
        hdr: packet_hdr(instance, PacketType::LsAck),
        lsa_hdrs: vec![*lsa_hdr],
    });
    iface.send_packet(instance, nbr_msg(nbr, iface, packet));
}

// ===== helper functions =====

// Space left for LSA headers, request entries or LSAs once the OSPF header
// and the fixed part of the packet are accounted for.
fn payload_budget(iface: &InterfaceView<'_>, fixed_length: u16) -> u16 {
    iface
        .max_packet_size()
        .saturating_sub(PacketHdr::LENGTH + fixed_length)
}

fn packet_hdr(
    instance: &InstanceUpView<'_>,
    pkt_type: PacketType,
) -> PacketHdr {
    PacketHdr::generate(
        pkt_type,
        instance.state.router_id,
        instance.config.area_id,
    )
}

// Addresses a packet to the given neighbor.
fn nbr_msg(
    nbr: &Neighbor,
    iface: &InterfaceView<'_>,
    packet: Packet,
) -> NetTxPacketMsg {
    NetTxPacketMsg {
        packet,
        src: iface.state.src_addr,
        dst: send_dest_nbr(nbr, iface),
    }
}

// Returns a copy of the LSA with its age incremented by InfTransDelay.
fn lsa_tx_copy(lsa: &Lsa, iface: &InterfaceView<'_>) -> Lsa {
    let mut lsa = lsa.clone();
    let age = std::cmp::min(
        lsa.hdr.age.saturating_add(iface.config.transmit_delay),
        lsdb::LSA_MAX_AGE,
    );
    lsa.set_age(age);
    lsa
}

// Returns destination used to send a packet directly to the given neighbor.
fn send_dest_nbr(
    nbr: &Neighbor,
    iface: &InterfaceView<'_>,
) -> SendDestination {
    let addr = if iface.config.if_type == InterfaceType::PointToPoint {
        MulticastAddr::AllSpfRtrs.addr()
    } else {
        nbr.src
    };
    SendDestination::new(iface.name.to_owned(), smallvec![addr])
}

// Returns a destination used to send a packet to all adjacent neighbors
// associated with the given interface.
fn send_dest_iface(
    iface: &InterfaceView<'_>,
    neighbors: &BTreeMap<Ipv4Addr, Neighbor>,
) -> SendDestination {
    let addrs: SmallVec<[Ipv4Addr; 4]> = match iface.config.if_type {
        InterfaceType::Broadcast => {
            let addr = if iface.is_dr_or_backup() {
                MulticastAddr::AllSpfRtrs
            } else {
                MulticastAddr::AllDrRtrs
            };
            smallvec![addr.addr()]
        }
        InterfaceType::NonBroadcast | InterfaceType::PointToMultipoint => {
            // On non-broadcast networks, separate LS Update packets must be
            // sent, as unicasts, to each adjacent neighbor.
            neighbors
                .values()
                .filter(|nbr| nbr.state >= nsm::State::Exchange)
                .map(|nbr| nbr.src)
                .collect()
        }
        InterfaceType::PointToPoint => {
            smallvec![MulticastAddr::AllSpfRtrs.addr()]
        }
    };
    SendDestination::new(iface.name.to_owned(), addrs)
}
