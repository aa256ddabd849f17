//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::btree_map;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::instance::InstanceUpView;
use crate::interface::Interfaces;
use crate::lsdb;
use crate::neighbor::nsm;
use crate::packet::lsa::Lsa;

// ===== global functions =====

// Floods the LSA out every interface of the area.
//
// The source, when present, identifies the interface and the neighbor the LSA
// was received from. Returns whether the LSA was flooded back out the
// receiving interface.
pub(crate) fn flood(
    instance: &InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    lsa: &Arc<Lsa>,
    src: Option<(&str, Ipv4Addr)>,
) -> bool {
    let lsa_key = lsa.hdr.key();

    // Keep track that this LSA was flooded back out the receiving interface.
    // This information is relevant when deciding whether or not to send a
    // direct ack later.
    let mut flooded_back = false;

    for iface in interfaces.values_mut().filter(|iface| iface.is_up()) {
        let (iface, neighbors) = iface.split();
        let src_nbr = src
            .filter(|(ifname, _)| *ifname == iface.name)
            .map(|(_, addr)| addr);

        // 1) Each of the neighbors attached to this interface are examined.
        let mut rxmt_added = false;
        for nbr in neighbors.values_mut() {
            // 1.a) Skip neighbors in a lesser state than Exchange.
            if nbr.state < nsm::State::Exchange {
                continue;
            }

            // 1.b) Request lists were already reconciled with this LSA, so any
            // instance still listed is more recent than this one.
            if nbr.state != nsm::State::Full
                && (nbr.lists.ls_request.contains_key(&lsa_key)
                    || nbr.lists.ls_request_pending.contains_key(&lsa_key))
            {
                continue;
            }

            // 1.c) If the new LSA was received from this neighbor, examine the
            // next neighbor.
            if src_nbr == Some(nbr.src) {
                continue;
            }

            // 1.d) Add LSA to the neighbor's rxmt list (or update the old
            // version).
            nbr.lists.ls_rxmt.insert(lsa_key, lsa.clone());
            nbr.rxmt_lsupd_start_check(&iface, instance);
            rxmt_added = true;
        }

        // 2) If in the previous step, the LSA was NOT added to any of the Link
        // state retransmission lists, there is no need to flood the LSA out the
        // interface and the next interface should be examined.
        if !rxmt_added {
            continue;
        }

        if let Some(src_nbr) = src_nbr {
            // 3) If the new LSA was received on this interface, and it was
            // received from either the DR or the BDR, chances are
            // that all the neighbors have received the LSA already.
            // Therefore, examine the next interface.
            if iface.state.dr == Some(src_nbr)
                || iface.state.bdr == Some(src_nbr)
            {
                continue;
            }

            // 4) If the new LSA was received on this interface, and the
            // interface state is BDR, examine the next interface.
            if iface.is_backup() {
                continue;
            }

            flooded_back = true;
        }

        // Flood the LSA out the interface. Transmission takes place once the
        // current event is fully processed, grouping as many LSAs as possible
        // into the same message.
        iface.state.ls_update_list.insert(lsa_key, lsa.clone());
    }

    flooded_back
}

// Removes same or older instances of the LSA from the Link state request lists
// of all adjacencies that aren't full yet.
pub(crate) fn request_lists_update(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    lsa: &Lsa,
) {
    use btree_map::Entry::Occupied;

    let lsa_key = lsa.hdr.key();
    for iface in interfaces.values_mut() {
        let (mut iface, neighbors) = iface.split();
        for nbr in neighbors.values_mut().filter(|nbr| {
            nbr.state >= nsm::State::Exchange && nbr.state != nsm::State::Full
        }) {
            match (
                nbr.lists.ls_request.entry(lsa_key),
                nbr.lists.ls_request_pending.entry(lsa_key),
            ) {
                (Occupied(o), _) | (_, Occupied(o)) => {
                    let req = o.get();
                    if lsdb::lsa_compare(&lsa.hdr, req) == Ordering::Less {
                        continue;
                    }

                    // Delete the LSA from the Link state request list.
                    o.remove();

                    // Check if the neighbor can transition to Full.
                    nbr.loading_done_check(&mut iface, instance);
                }
                _ => (),
            }
        }
    }
}
