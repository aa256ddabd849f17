//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::btree_map;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::debug::{Debug, SeqNoMismatchReason};
use crate::error::{Error, InterfaceCfgError};
use crate::flood::{flood, request_lists_update};
use crate::instance::InstanceUpView;
use crate::interface::{self, Interface, Interfaces};
use crate::lsdb::{self, LsaEntryFlags, lsa_compare};
use crate::neighbor::{LastDbDesc, Neighbor, nsm};
use crate::network::{MulticastAddr, NetRxPacketMsg};
use crate::output;
use crate::packet::lsa::Lsa;
use crate::packet::{
    DbDesc, DbDescFlags, Hello, LsAck, LsRequest, LsUpdate, Packet, PacketType,
};
use crate::tasks::{InterfaceTimer, NeighborTimer, TimerKey};

// ===== Neighbor FSM event =====

pub(crate) fn process_nsm_event(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifname: &str,
    addr: Ipv4Addr,
    event: nsm::Event,
) -> Result<(), Error> {
    // Lookup interface and neighbor.
    let (mut iface, nbr) =
        interface::neighbor_get_mut(interfaces, ifname, addr)?;

    // Invoke FSM event.
    nbr.fsm(&mut iface, instance, event);

    Ok(())
}

// ===== Network packet receipt =====

pub(crate) fn process_packet(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    msg: NetRxPacketMsg,
) -> Result<(), Error> {
    let NetRxPacketMsg {
        ifname,
        src,
        dst,
        packet,
    } = msg;

    // Lookup interface.
    let iface = interfaces
        .get_mut(&ifname)
        .ok_or_else(|| Error::InterfaceNotFound(ifname.clone()))?;

    // Ignore packets received on inoperational interfaces.
    if !iface.is_up() {
        return Ok(());
    }

    // Check for Area ID mismatch.
    let pkt_type = packet.hdr().pkt_type;
    let router_id = packet.hdr().router_id;
    if packet.hdr().area_id != instance.config.area_id {
        return Err(Error::InterfaceCfgError(
            ifname,
            src,
            pkt_type,
            InterfaceCfgError::AreaIdMismatch(
                packet.hdr().area_id,
                instance.config.area_id,
            ),
        ));
    }

    // Packets sent to AllDRouters are only of interest to the DR and BDR.
    let (iface_view, _) = iface.split();
    if dst == MulticastAddr::AllDrRtrs.addr() && !iface_view.is_dr_or_backup()
    {
        return Ok(());
    }

    // Log received packet.
    Debug::PacketRx(&ifname, &src, &dst, &packet).log();

    if let Packet::Hello(pkt) = packet {
        return process_packet_hello(iface, instance, src, pkt);
    }

    // Non-Hello packets not matching any active neighbor are discarded.
    if !iface.neighbors.contains_key(&src) {
        return Err(Error::UnknownNeighbor(src, router_id));
    }

    match packet {
        Packet::Hello(_) => Ok(()),
        Packet::DbDesc(pkt) => {
            process_packet_dbdesc(instance, interfaces, &ifname, src, pkt)
        }
        Packet::LsRequest(pkt) => {
            process_packet_lsreq(instance, interfaces, &ifname, src, pkt)
        }
        Packet::LsUpdate(pkt) => {
            process_packet_lsupd(instance, interfaces, &ifname, src, pkt)
        }
        Packet::LsAck(pkt) => {
            process_packet_lsack(instance, interfaces, &ifname, src, pkt)
        }
    }
}

fn process_packet_hello(
    iface: &mut Interface,
    instance: &mut InstanceUpView<'_>,
    src: Ipv4Addr,
    hello: Hello,
) -> Result<(), Error> {
    // Perform all the required sanity checks.
    process_packet_hello_sanity_checks(iface, instance, &hello).map_err(
        |error| {
            Error::InterfaceCfgError(
                iface.name.clone(),
                src,
                PacketType::Hello,
                error,
            )
        },
    )?;

    // Find or create new neighbor.
    let (mut iface, neighbors) = iface.split();
    let is_broadcast_or_nbma = iface.is_broadcast_or_nbma();
    let ifname = iface.name;
    let nbr = neighbors.entry(src).or_insert_with(|| {
        let mut nbr = Neighbor::new(ifname, hello.hdr.router_id, src);

        // Initialize neighbor values.
        nbr.priority = hello.priority;
        if is_broadcast_or_nbma {
            nbr.dr = hello.dr;
            nbr.bdr = hello.bdr;
        }
        nbr
    });

    // Statically configured neighbors learn their Router ID from the first
    // Hello packet.
    nbr.router_id = hello.hdr.router_id;

    // Trigger the HelloReceived event.
    nbr.fsm(&mut iface, instance, nsm::Event::HelloRcvd);

    // Trigger the 1-WayReceived or the 2-WayReceived event.
    if hello.neighbors.contains(&instance.state.router_id) {
        nbr.fsm(&mut iface, instance, nsm::Event::TwoWayRcvd);
    } else {
        nbr.fsm(&mut iface, instance, nsm::Event::OneWayRcvd);
    }

    // Examine rest of the Hello Packet (ignore Point-to-MultiPoint interfaces
    // as per errata 4022 of RFC 2328).
    if is_broadcast_or_nbma {
        nbr.priority = hello.priority;
        nbr.dr = hello.dr;
        nbr.bdr = hello.bdr;
    }

    Ok(())
}

fn process_packet_hello_sanity_checks(
    iface: &Interface,
    instance: &InstanceUpView<'_>,
    hello: &Hello,
) -> Result<(), InterfaceCfgError> {
    // Check for network mask mismatch.
    if matches!(
        iface.config.if_type,
        interface::InterfaceType::Broadcast
            | interface::InterfaceType::NonBroadcast
    ) && hello.network_mask != iface.config.addr.mask()
    {
        return Err(InterfaceCfgError::HelloMaskMismatch(
            hello.network_mask,
            iface.config.addr.mask(),
        ));
    }

    // Check for HelloInterval mismatch.
    if hello.hello_interval != iface.config.hello_interval {
        return Err(InterfaceCfgError::HelloIntervalMismatch(
            hello.hello_interval,
            iface.config.hello_interval,
        ));
    }

    // Check for RouterDeadInterval mismatch.
    if hello.dead_interval != iface.config.dead_interval as u32 {
        return Err(InterfaceCfgError::DeadIntervalMismatch(
            hello.dead_interval,
            iface.config.dead_interval as u32,
        ));
    }

    // Check for duplicate Router ID.
    if hello.hdr.router_id == instance.state.router_id {
        return Err(InterfaceCfgError::DuplicateRouterId(hello.hdr.router_id));
    }

    Ok(())
}

fn process_packet_dbdesc(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifname: &str,
    src: Ipv4Addr,
    dbdesc: DbDesc,
) -> Result<(), Error> {
    // Lookup interface and neighbor.
    let (mut iface, nbr) =
        interface::neighbor_get_mut(interfaces, ifname, src)?;

    // MTU mismatch check.
    if !iface.config.mtu_ignore && dbdesc.mtu > iface.config.mtu {
        return Err(Error::InterfaceCfgError(
            ifname.to_owned(),
            src,
            PacketType::DbDesc,
            InterfaceCfgError::MtuMismatch(dbdesc.mtu),
        ));
    }

    // Further processing depends on the neighbor's state.
    match nbr.state {
        nsm::State::Down | nsm::State::Attempt | nsm::State::TwoWay => {
            return Err(Error::DbDescReject(nbr.router_id, nbr.state));
        }
        nsm::State::Init | nsm::State::ExStart => {
            if nbr.state == nsm::State::Init {
                let event = nsm::Event::TwoWayRcvd;
                nbr.fsm(&mut iface, instance, event);
                if nbr.state != nsm::State::ExStart {
                    return Ok(());
                }
                // Fall through to the ExStart case.
            }

            if dbdesc
                .dd_flags
                .contains(DbDescFlags::I | DbDescFlags::M | DbDescFlags::MS)
                && dbdesc.lsa_hdrs.is_empty()
                && dbdesc.hdr.router_id > instance.state.router_id
            {
                // Set the master/slave bit to slave, and set the neighbor data
                // structure's DD sequence number to that specified by the
                // master.
                nbr.dd_flags.remove(DbDescFlags::MS);
                nbr.dd_seq_no = dbdesc.dd_seq_no;
            } else if !dbdesc
                .dd_flags
                .intersects(DbDescFlags::I | DbDescFlags::MS)
                && dbdesc.dd_seq_no == nbr.dd_seq_no
                && dbdesc.hdr.router_id < instance.state.router_id
            {
                // In this case the router is Master.
            } else {
                // Ignore the packet.
                return Ok(());
            }

            nbr.options = Some(dbdesc.options);
            let event = nsm::Event::NegotiationDone;
            nbr.fsm(&mut iface, instance, event);
        }
        nsm::State::Exchange => {
            // Check for duplicate packet.
            if nbr.dbdesc_is_dup(&dbdesc) {
                // The slave needs to retransmit the last Database Description
                // packet that it had sent.
                if !nbr.dd_flags.contains(DbDescFlags::MS) {
                    output::rxmt_dbdesc(nbr, &iface, instance);
                }

                return Ok(());
            }

            // Sanity checks.
            let Some(last_rcvd_dbdesc) = nbr.last_rcvd_dbdesc else {
                let reason = SeqNoMismatchReason::UnexpectedDbDesc;
                let event = nsm::Event::SeqNoMismatch(reason);
                nbr.fsm(&mut iface, instance, event);
                return Ok(());
            };
            if dbdesc.dd_flags.contains(DbDescFlags::I)
                || dbdesc.dd_flags.contains(DbDescFlags::MS)
                    != last_rcvd_dbdesc.dd_flags.contains(DbDescFlags::MS)
            {
                let reason = SeqNoMismatchReason::InconsistentFlags;
                let event = nsm::Event::SeqNoMismatch(reason);
                nbr.fsm(&mut iface, instance, event);
                return Ok(());
            }
            if dbdesc.options != last_rcvd_dbdesc.options {
                let reason = SeqNoMismatchReason::InconsistentOptions;
                let event = nsm::Event::SeqNoMismatch(reason);
                nbr.fsm(&mut iface, instance, event);
                return Ok(());
            }
            if (nbr.dd_flags.contains(DbDescFlags::MS)
                && dbdesc.dd_seq_no != nbr.dd_seq_no)
                || (!nbr.dd_flags.contains(DbDescFlags::MS)
                    && dbdesc.dd_seq_no != nbr.dd_seq_no.wrapping_add(1))
            {
                let reason = SeqNoMismatchReason::InconsistentSeqNo;
                let event = nsm::Event::SeqNoMismatch(reason);
                nbr.fsm(&mut iface, instance, event);
                return Ok(());
            }
        }
        nsm::State::Loading | nsm::State::Full => {
            // Check for duplicate packet.
            if nbr.dbdesc_is_dup(&dbdesc) {
                // The slave must respond to duplicates by repeating the last
                // Database Description packet that it had sent.
                if !nbr.dd_flags.contains(DbDescFlags::MS) {
                    output::rxmt_dbdesc(nbr, &iface, instance);
                }

                return Ok(());
            }

            let reason = SeqNoMismatchReason::UnexpectedDbDesc;
            let event = nsm::Event::SeqNoMismatch(reason);
            nbr.fsm(&mut iface, instance, event);
            return Ok(());
        }
    }

    // If we got this far it means the packet was accepted. Stop the
    // retransmission interval in case it's active.
    nbr.timer_stop(instance, NeighborTimer::DbDescRxmt);

    // Now iterate over all LSA headers.
    for lsa_hdr in &dbdesc.lsa_hdrs {
        // Check if the LSA type is valid.
        if lsa_hdr.lsa_type.type_code().is_none() {
            let reason = SeqNoMismatchReason::InvalidLsaType;
            let event = nsm::Event::SeqNoMismatch(reason);
            nbr.fsm(&mut iface, instance, event);
            return Ok(());
        }

        // RFC 5243 says:
        // "If the Database summary list contains an instance of the LSA that is
        // the same as or less recent than the listed LSA, the LSA is removed
        // from the Database summary list".
        let lsa_key = lsa_hdr.key();
        if let Some(db_summ_lsa) = nbr.lists.db_summary.get(&lsa_key)
            && lsa_compare(&db_summ_lsa.hdr, lsa_hdr) != Ordering::Greater
        {
            nbr.lists.db_summary.remove(&lsa_key);
        }

        // Put the LSA on the Link state request list if it's not present on the
        // LSDB, or if the local copy is less recent than the received one.
        if let Some(lse) = instance.state.lsdb.get(&lsa_key)
            && lsa_compare(&lse.data.hdr, lsa_hdr) != Ordering::Less
        {
            continue;
        }
        nbr.lists.ls_request.insert(lsa_key, *lsa_hdr);
    }

    // Start sending Link State Request packets.
    if !nbr.lists.ls_request.is_empty()
        && nbr.lists.ls_request_pending.is_empty()
    {
        output::send_lsreq(nbr, &iface, instance);
    }

    // Further processing depends on whether the router is master or slave.
    let mut exchange_done = false;
    if nbr.dd_flags.contains(DbDescFlags::MS) {
        nbr.dd_seq_no = nbr.dd_seq_no.wrapping_add(1);

        if !nbr.dd_flags.contains(DbDescFlags::M)
            && !dbdesc.dd_flags.contains(DbDescFlags::M)
        {
            exchange_done = true;
        } else {
            output::send_dbdesc(nbr, &iface, instance);
        }
    } else {
        nbr.dd_seq_no = dbdesc.dd_seq_no;

        output::send_dbdesc(nbr, &iface, instance);

        if !nbr.dd_flags.contains(DbDescFlags::M)
            && !dbdesc.dd_flags.contains(DbDescFlags::M)
        {
            exchange_done = true;
        }
    }
    if exchange_done {
        nbr.fsm(&mut iface, instance, nsm::Event::ExchangeDone);

        // The slave must wait RouterDeadInterval seconds before freeing the
        // last Database Description packet. Reception of a Database Description
        // packet from the master after this interval will generate a
        // SeqNumberMismatch neighbor event.
        if !nbr.dd_flags.contains(DbDescFlags::MS) {
            let timeout =
                Duration::from_secs(iface.config.dead_interval.into());
            nbr.timer_start(instance, NeighborTimer::DbDescFree, timeout);
        }
    }

    // Save last received Database Description packet.
    nbr.last_rcvd_dbdesc = Some(LastDbDesc {
        options: dbdesc.options,
        dd_flags: dbdesc.dd_flags,
        dd_seq_no: dbdesc.dd_seq_no,
    });

    Ok(())
}

fn process_packet_lsreq(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifname: &str,
    src: Ipv4Addr,
    ls_req: LsRequest,
) -> Result<(), Error> {
    // Lookup interface and neighbor.
    let (mut iface, nbr) =
        interface::neighbor_get_mut(interfaces, ifname, src)?;

    if nbr.state < nsm::State::Exchange {
        Debug::PacketRxIgnore(nbr.router_id, &nbr.state).log();
        return Ok(());
    }

    // Iterate over all request entries.
    for lsa_key in &ls_req.entries {
        if let Some(lse) = instance.state.lsdb.get(lsa_key) {
            // Copy LSA for transmission to the neighbor.
            let lsa = lse.data.clone();
            nbr.lists.ls_update.insert(*lsa_key, lsa);
        } else {
            // Something has gone wrong with the Database Exchange process.
            nbr.fsm(&mut iface, instance, nsm::Event::BadLsReq);
            return Ok(());
        }
    }

    Ok(())
}

fn process_packet_lsupd(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifname: &str,
    src: Ipv4Addr,
    ls_upd: LsUpdate,
) -> Result<(), Error> {
    // Lookup interface and neighbor.
    let (_, nbr) = interface::neighbor_get_mut(interfaces, ifname, src)?;

    if nbr.state < nsm::State::Exchange {
        Debug::PacketRxIgnore(nbr.router_id, &nbr.state).log();
        return Ok(());
    }

    // Process all LSAs contained in the packet.
    for lsa in ls_upd.lsas {
        let stop =
            process_packet_lsupd_lsa(instance, interfaces, ifname, src, lsa)?;
        if stop {
            break;
        }
    }

    Ok(())
}

// Processes a single LSA received in an LS Update packet.
//
// Returns whether processing of the remaining LSAs should stop.
fn process_packet_lsupd_lsa(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifname: &str,
    src: Ipv4Addr,
    #[allow(unused_mut)] mut lsa: Lsa,
) -> Result<bool, Error> {
    let nbr_router_id = {
        let (_, nbr) = interface::neighbor_get_mut(interfaces, ifname, src)?;
        nbr.router_id
    };

    // Generate raw data that might be missing for LSAs received in testing
    // mode.
    #[cfg(feature = "testing")]
    if lsa.raw.is_empty() {
        lsa.encode();
    }

    // (1) Validate the LSA (not only the checksum as specified by the RFC).
    if let Err(error) = lsa.validate() {
        // Log why the LSA is being discarded.
        Debug::LsaDiscard(nbr_router_id, &lsa.hdr, &error).log();

        // Examine the next LSA.
        return Ok(false);
    }

    // (2-3) Check if the LSA type is known.
    if lsa.hdr.lsa_type.type_code().is_none() {
        // Examine the next LSA.
        return Ok(false);
    }

    // (5) Find the instance of this LSA that is currently contained in the
    // router's link state database.
    let lsa_key = lsa.hdr.key();
    let lse = instance.state.lsdb.get(&lsa_key);
    let lse_data = lse.map(|lse| lse.data.clone());
    let lse_min_arrival = lse.is_some_and(lsdb::lsa_min_arrival_check);

    // (4) If the LSA's LS age is equal to MaxAge, and there is currently no
    // instance of the LSA in the router's link state database, and none of
    // router's neighbors are in states Exchange or Loading.
    if lsa.hdr.is_maxage()
        && lse_data.is_none()
        && !interfaces
            .values()
            .flat_map(|iface| iface.neighbors.values())
            .any(|nbr| {
                matches!(nbr.state, nsm::State::Exchange | nsm::State::Loading)
            })
    {
        // Acknowledge the receipt of the LSA.
        let (iface, nbr) =
            interface::neighbor_get_mut(interfaces, ifname, src)?;
        output::send_lsack_direct(nbr, &iface, instance, &lsa.hdr);

        // Examine the next LSA.
        return Ok(false);
    }

    // (5 cont.) There is no database copy, or the received LSA is more
    // recent than the database copy.
    let lsa_cmp = lse_data
        .as_ref()
        .map(|lse_data| lsa_compare(&lse_data.hdr, &lsa.hdr));
    if matches!(lsa_cmp, None | Some(Ordering::Less)) {
        // (5.a) MinLSArrival check.
        if lse_min_arrival {
            // Log why the LSA is being discarded.
            Debug::LsaMinArrivalDiscard(nbr_router_id, &lsa.hdr).log();

            // Examine the next LSA.
            return Ok(false);
        }

        // Move LSA into a reference-counting pointer.
        let lsa = Arc::new(lsa);

        // (5.c-d) Install the new LSA in the link state database (replacing
        // the current database copy). The installation process also updates
        // older copies found on Link state retransmission lists.
        let changed = lsdb::install(instance, interfaces, lsa.clone());
        let mut self_originated = false;
        if let Some(lse) = instance.state.lsdb.get_mut(&lsa_key) {
            lse.flags.insert(LsaEntryFlags::RECEIVED);
            self_originated =
                lse.flags.contains(LsaEntryFlags::SELF_ORIGINATED);
        }

        // Update statistics.
        instance.state.rx_lsa_count += 1;
        instance.state.discontinuity_time = Utc::now();

        // The sending neighbor already holds this instance.
        {
            let (_, nbr) =
                interface::neighbor_get_mut(interfaces, ifname, src)?;
            if nbr.lists.ls_rxmt.remove(&lsa_key).is_some() {
                nbr.rxmt_lsupd_stop_check(instance);
            }
        }

        // Adjacencies still loading might be waiting for this LSA.
        request_lists_update(instance, interfaces, &lsa);

        // (5.b) Flood the new LSA out some subset of the router's interfaces,
        // but only when its contents have changed.
        let flooded_back = changed
            && flood(instance, interfaces, &lsa, Some((ifname, src)));

        // (5.e) Possibly acknowledge the receipt of the LSA.
        let (iface, nbr) =
            interface::neighbor_get_mut(interfaces, ifname, src)?;
        if !flooded_back
            && (!iface.is_backup() || iface.state.dr == Some(nbr.src))
        {
            output::send_lsack_direct(nbr, &iface, instance, &lsa.hdr);
        }

        // (5.f) Check if this is a self-originated LSA.
        if self_originated {
            Debug::LsaSelfOriginated(nbr_router_id, &lsa.hdr).log();

            // (Re)originate or flush self-originated LSA.
            instance.state.orig_pending = true;
        }

        // Examine the next LSA.
        return Ok(false);
    }

    // (6 - errata 3974) Check if the received LSA is the same instance as
    // the database copy (i.e., neither one is more recent).
    let (mut iface, nbr) =
        interface::neighbor_get_mut(interfaces, ifname, src)?;
    if lsa_cmp == Some(Ordering::Equal) {
        // Check if this LSA can be handled as an implied acknowledgment.
        if let btree_map::Entry::Occupied(o) = nbr.lists.ls_rxmt.entry(lsa_key)
        {
            o.remove();
            nbr.rxmt_lsupd_stop_check(instance);

            if iface.is_backup() && iface.state.dr == Some(nbr.src) {
                output::send_lsack_direct(nbr, &iface, instance, &lsa.hdr);
            }
        } else {
            // Send direct ack.
            output::send_lsack_direct(nbr, &iface, instance, &lsa.hdr);
        }

        // Examine the next LSA.
        return Ok(false);
    }

    // (7 - errata 3974) If there is an instance of the LSA on the sending
    // neighbor's Link state request list, an error has occurred in the
    // Database Exchange process.
    if nbr.lists.ls_request.contains_key(&lsa_key)
        || nbr.lists.ls_request_pending.contains_key(&lsa_key)
    {
        // Restart the Database Exchange process.
        nbr.fsm(&mut iface, instance, nsm::Event::BadLsReq);

        // Stop processing the Link State Update packet.
        return Ok(true);
    }

    // (8) The database copy is more recent.
    //
    // If the database copy has LS age equal to MaxAge and LS sequence
    // number equal to MaxSequenceNumber, simply discard the received LSA
    // without acknowledging it.
    let Some(lse_data) = lse_data else {
        return Ok(false);
    };
    if lse_data.hdr.is_maxage() && lse_data.hdr.seq_no == lsdb::LSA_MAX_SEQ_NO
    {
        // Examine the next LSA.
        return Ok(false);
    }
    if !lse_min_arrival {
        // Send the database copy back to the sending neighbor, encapsulated
        // within a Link State Update Packet.
        nbr.lists.ls_update.insert(lsa_key, lse_data);
    } else {
        // Log why the LSA is being discarded.
        Debug::LsaMinArrivalDiscard(nbr.router_id, &lsa.hdr).log();
    }

    // Examine the next LSA.
    Ok(false)
}

fn process_packet_lsack(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    ifname: &str,
    src: Ipv4Addr,
    ls_ack: LsAck,
) -> Result<(), Error> {
    // Lookup interface and neighbor.
    let (_, nbr) = interface::neighbor_get_mut(interfaces, ifname, src)?;

    if nbr.state < nsm::State::Exchange {
        Debug::PacketRxIgnore(nbr.router_id, &nbr.state).log();
        return Ok(());
    }

    // Iterate over all LSA headers.
    for lsa_hdr in &ls_ack.lsa_hdrs {
        let lsa_key = lsa_hdr.key();
        if let btree_map::Entry::Occupied(o) = nbr.lists.ls_rxmt.entry(lsa_key)
        {
            let lsa = o.get();
            if lsa_compare(&lsa.hdr, lsa_hdr) == Ordering::Equal {
                o.remove();
                nbr.rxmt_lsupd_stop_check(instance);
            } else {
                Debug::QuestionableAck(nbr.router_id, lsa_hdr).log();
            }
        }
    }

    Ok(())
}

// ===== Timer expiry =====

pub(crate) fn process_timer(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    key: TimerKey,
) -> Result<(), Error> {
    match key {
        TimerKey::Interface {
            ifname,
            timer: InterfaceTimer::Hello,
        } => {
            let iface = interfaces
                .get_mut(&ifname)
                .ok_or(Error::InterfaceNotFound(ifname))?;
            if !iface.is_up() {
                return Ok(());
            }

            // Send Hello and schedule the next one.
            let (iface, neighbors) = iface.split();
            output::send_hello(&iface, neighbors, instance);
            iface.hello_timer_start(instance);
        }
        TimerKey::Neighbor {
            ifname,
            addr,
            timer,
        } => {
            let (mut iface, nbr) =
                interface::neighbor_get_mut(interfaces, &ifname, addr)?;

            // Ignore timers that were cleared after having fired.
            if !nbr.timer_is_active(timer) {
                return Ok(());
            }
            nbr.timers.remove(timer.into());

            process_nbr_timer(nbr, &mut iface, instance, timer);
        }
        TimerKey::LsdbMaxAgeSweep => {
            lsdb::maxage_sweep(instance, interfaces);

            // Schedule the next sweep.
            let timeout = Duration::from_secs(
                instance.config.lsdb_maxage_sweep_interval.into(),
            );
            instance
                .tx
                .timers
                .start_timer(TimerKey::LsdbMaxAgeSweep, timeout);
        }
    }

    Ok(())
}

fn process_nbr_timer(
    nbr: &mut Neighbor,
    iface: &mut interface::InterfaceView<'_>,
    instance: &mut InstanceUpView<'_>,
    timer: NeighborTimer,
) {
    match timer {
        NeighborTimer::Inactivity => {
            nbr.fsm(iface, instance, nsm::Event::InactivityTimer);
        }
        NeighborTimer::Poll => {
            nbr.fsm(iface, instance, nsm::Event::PollTimer);
        }
        NeighborTimer::DbDescRxmt => {
            nbr.fsm(iface, instance, nsm::Event::DbDescRxmtTimer);
        }
        NeighborTimer::LsRequestRxmt => {
            if !nbr.lists.ls_request_pending.is_empty() {
                output::rxmt_lsreq(nbr, iface, instance);
                nbr.timer_start(instance, timer, iface.rxmt_interval());
            }
        }
        NeighborTimer::LsUpdateRxmt => {
            // Resend everything that wasn't acknowledged yet. There's no
            // retry limit: only the Inactivity Timer gives up on a neighbor.
            if !nbr.lists.ls_rxmt.is_empty() {
                output::rxmt_lsupd(nbr, iface, instance);
                nbr.timer_start(instance, timer, iface.rxmt_interval());
            }
        }
        NeighborTimer::DbDescFree => {
            // Free last sent/received Database Description packets.
            nbr.last_rcvd_dbdesc = None;
            nbr.last_sent_dbdesc = None;
        }
    }
}
