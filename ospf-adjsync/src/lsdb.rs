//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, btree_map};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use chrono::Utc;

use crate::debug::{Debug, LsaFlushReason};
use crate::flood::flood;
use crate::instance::InstanceUpView;
use crate::interface::Interfaces;
use crate::neighbor::nsm;
use crate::packet::Options;
use crate::packet::lsa::{Lsa, LsaBody, LsaHdr, LsaKey};

// Architectural Constants.
pub const LSA_MAX_AGE: u16 = 3600;
pub const LSA_MAX_AGE_DIFF: u16 = 900;
pub const LSA_INIT_SEQ_NO: u32 = 0x80000001;
pub const LSA_MAX_SEQ_NO: u32 = 0x7fffffff;
pub const LSA_RESERVED_SEQ_NO: u32 = 0x80000000;
pub const LSA_MIN_ARRIVAL: u64 = 1;

#[derive(Debug)]
pub struct LsaEntry {
    // LSA data.
    pub data: Arc<Lsa>,
    // Time the current instance was installed.
    pub install_time: Instant,
    // Cached next-hops computed from this LSA. Invalidated whenever the LSA
    // contents change.
    pub next_hops: Option<BTreeSet<Ipv4Addr>>,
    // LSA entry flags.
    pub flags: LsaEntryFlags,
    // Insertion position in the LSDB.
    pos: u64,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct LsaEntryFlags: u8 {
        const RECEIVED = 0x01;
        const SELF_ORIGINATED = 0x02;
    }
}

// Link-state database of a single area.
//
// At most one entry exists per LSA key. Entries are only created or modified
// through `upsert`, which applies the content comparison rules used to decide
// whether the new instance must be flooded.
#[derive(Debug, Default)]
pub struct Lsdb {
    entries: BTreeMap<LsaKey, LsaEntry>,
    insertion_order: BTreeMap<u64, LsaKey>,
    next_pos: u64,
    // MaxAge LSAs waiting to be removed from the LSDB.
    pub maxage_lsas: BTreeSet<LsaKey>,
    // Self-originated LSAs waiting for the old instance to be flushed before
    // being originated with the initial sequence number.
    pub seqno_wrapping: HashMap<LsaKey, Lsa>,
}

// ===== impl LsaEntry =====

impl LsaEntry {
    pub fn new(data: Arc<Lsa>) -> LsaEntry {
        LsaEntry {
            data,
            install_time: Instant::now(),
            next_hops: None,
            flags: Default::default(),
            pos: 0,
        }
    }

    // Replaces the stored LSA with the provided instance.
    //
    // Returns whether the new instance differs from the previous one, in which
    // case it must be flooded.
    pub fn update(&mut self, data: Arc<Lsa>) -> bool {
        let differs = lsa_differs_from(&self.data, &data);
        self.data = data;
        self.install_time = Instant::now();
        self.flags = LsaEntryFlags::empty();
        if differs {
            self.next_hops = None;
        }
        differs
    }

    pub fn set_next_hops(&mut self, next_hops: BTreeSet<Ipv4Addr>) {
        self.next_hops = Some(next_hops);
    }
}

// ===== impl Lsdb =====

impl Lsdb {
    pub fn get(&self, key: &LsaKey) -> Option<&LsaEntry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &LsaKey) -> Option<&mut LsaEntry> {
        self.entries.get_mut(key)
    }

    // Inserts the LSA in the LSDB, or updates the existing instance.
    //
    // Returns true when the LSA is new or its contents differ from the
    // previous instance.
    pub fn upsert(&mut self, lsa: Arc<Lsa>) -> bool {
        let key = lsa.hdr.key();
        if lsa.hdr.is_maxage() {
            self.maxage_lsas.insert(key);
        } else {
            self.maxage_lsas.remove(&key);
        }

        match self.entries.entry(key) {
            btree_map::Entry::Occupied(mut o) => o.get_mut().update(lsa),
            btree_map::Entry::Vacant(v) => {
                let pos = self.next_pos;
                self.next_pos += 1;
                let mut lse = LsaEntry::new(lsa);
                lse.pos = pos;
                v.insert(lse);
                self.insertion_order.insert(pos, key);
                true
            }
        }
    }

    pub fn remove(&mut self, key: &LsaKey) -> Option<LsaEntry> {
        let lse = self.entries.remove(key)?;
        self.insertion_order.remove(&lse.pos);
        self.maxage_lsas.remove(key);
        Some(lse)
    }

    // Returns an iterator over all LSAs ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (&LsaKey, &LsaEntry)> + '_ {
        self.entries.iter()
    }

    // Returns an iterator over all LSAs in the order they were first inserted.
    pub fn iter_by_insertion(&self) -> impl Iterator<Item = &LsaEntry> + '_ {
        self.insertion_order
            .values()
            .filter_map(|key| self.entries.get(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ===== global functions =====

// Compares which LSA is more recent according to the rules specified in Section
// 13.1 of RFC 2328.
//
// Returns:
// - Ordering::Greater when `a` is more recent
// - Ordering::Less when `b` is more recent
// - Ordering::Equal when the two LSAs are considered to be identical
pub fn lsa_compare(a: &LsaHdr, b: &LsaHdr) -> Ordering {
    let a_seq_no = a.seq_no as i32;
    let b_seq_no = b.seq_no as i32;
    let cmp = a_seq_no.cmp(&b_seq_no);
    if cmp != Ordering::Equal {
        return cmp;
    }

    let cmp = a.cksum.cmp(&b.cksum);
    if cmp != Ordering::Equal {
        return cmp;
    }

    if a.is_maxage() && !b.is_maxage() {
        return Ordering::Greater;
    } else if !a.is_maxage() && b.is_maxage() {
        return Ordering::Less;
    }

    if a.age.abs_diff(b.age) > LSA_MAX_AGE_DIFF {
        return b.age.cmp(&a.age);
    }

    Ordering::Equal
}

// Checks whether the contents of the incoming LSA differ from the current
// instance, as described in Section 13.2 of RFC 2328.
//
// Header fields are examined first. When they already differ, the bodies
// aren't looked at.
pub fn lsa_differs_from(current: &Lsa, incoming: &Lsa) -> bool {
    if current.hdr.options != incoming.hdr.options {
        return true;
    }

    if current.hdr.is_maxage() ^ incoming.hdr.is_maxage() {
        return true;
    }

    if current.hdr.length != incoming.hdr.length {
        return true;
    }

    lsa_body_differs_from(&current.body, &incoming.body)
}

fn lsa_body_differs_from(current: &LsaBody, incoming: &LsaBody) -> bool {
    match (current, incoming) {
        (LsaBody::Router(a), LsaBody::Router(b)) => {
            a.flags != b.flags
                || a.links.len() != b.links.len()
                || a.links.iter().zip(&b.links).any(|(a, b)| a != b)
        }
        (LsaBody::Network(a), LsaBody::Network(b)) => {
            a.mask != b.mask
                || a.attached_rtrs.len() != b.attached_rtrs.len()
                || a.attached_rtrs
                    .iter()
                    .zip(&b.attached_rtrs)
                    .any(|(a, b)| a != b)
        }
        (LsaBody::SummaryNetwork(a), LsaBody::SummaryNetwork(b))
        | (LsaBody::SummaryRouter(a), LsaBody::SummaryRouter(b)) => {
            a.mask != b.mask || a.metric != b.metric
        }
        (LsaBody::AsExternal(a), LsaBody::AsExternal(b)) => {
            a.mask != b.mask
                || a.flags != b.flags
                || a.metric != b.metric
                || a.fwd_addr != b.fwd_addr
                || a.tag != b.tag
        }
        (LsaBody::Unknown(a), LsaBody::Unknown(b)) => {
            a.lsa_type != b.lsa_type || a.data != b.data
        }
        _ => true,
    }
}

// Checks if the given LSA was received via flooding less than MinLSArrival
// seconds ago.
pub(crate) fn lsa_min_arrival_check(lse: &LsaEntry) -> bool {
    if !lse.flags.contains(LsaEntryFlags::RECEIVED) {
        return false;
    }

    #[cfg(feature = "deterministic")]
    {
        false
    }
    #[cfg(not(feature = "deterministic"))]
    {
        lse.install_time.elapsed().as_secs() < LSA_MIN_ARRIVAL
    }
}

// Installs the provided LSA in the LSDB.
//
// Returns whether the LSA contents have changed. Only in that case the LSA
// should be flooded.
pub(crate) fn install(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    lsa: Arc<Lsa>,
) -> bool {
    Debug::LsaInstall(&lsa.hdr).log();

    // Add or update LSA entry.
    let lsa_key = lsa.hdr.key();
    let changed = instance.state.lsdb.upsert(lsa.clone());

    // Update old instances (if any) on all neighbors' Link state
    // retransmission lists.
    rxmt_lists_update(instance, interfaces, &lsa, changed);

    let lsdb = &mut instance.state.lsdb;

    // Check if the LSA is self-originated and mark it as such.
    if lsa.hdr.adv_rtr == instance.state.router_id
        && let Some(lse) = lsdb.get_mut(&lsa_key)
    {
        lse.flags.insert(LsaEntryFlags::SELF_ORIGINATED);
    }

    // Notify interested parties only when the LSA contents have changed.
    if changed {
        instance.tx.observer.database_changed(&lsa);
    }

    changed
}

// Originates the provided LSA.
pub(crate) fn originate(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    lsa: Lsa,
) {
    // When an attempt is made to increment the sequence number past the
    // maximum value of MaxSequenceNumber, the current instance of the LSA
    // must first be flushed from the routing domain. This is done by
    // prematurely aging the LSA and reflooding it. As soon as this flood
    // has been acknowledged by all adjacent neighbors, a new instance can
    // be originated with sequence number of InitialSequenceNumber.
    let lsa_key = lsa.hdr.key();
    if lsa.hdr.seq_no == LSA_RESERVED_SEQ_NO
        && instance.state.lsdb.get(&lsa_key).is_some()
    {
        instance.state.lsdb.seqno_wrapping.insert(lsa_key, lsa);
        flush(instance, interfaces, &lsa_key, LsaFlushReason::SeqNoWrapping);
        return;
    }

    Debug::LsaOriginate(&lsa.hdr).log();

    let lsa = Arc::new(lsa);
    if install(instance, interfaces, lsa.clone()) {
        flood(instance, interfaces, &lsa, None);
    }

    // Update statistics.
    instance.state.orig_lsa_count += 1;
    instance.state.discontinuity_time = Utc::now();
}

// Attempts to originate the provided LSA, but only if its contents differ from
// the current database copy.
pub(crate) fn originate_check(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    lsa_id: Ipv4Addr,
    lsa_body: LsaBody,
) {
    let adv_rtr = instance.state.router_id;
    let lsa_key = LsaKey::new(lsa_body.lsa_type(), adv_rtr, lsa_id);
    let old_lse = instance.state.lsdb.get(&lsa_key);

    // Get next sequence number.
    let seq_no = old_lse
        .map(|old_lse| old_lse.data.hdr.seq_no.wrapping_add(1))
        .unwrap_or(LSA_INIT_SEQ_NO);

    // Make new LSA.
    let lsa = Lsa::new(0, Options::E, lsa_id, adv_rtr, seq_no, lsa_body);

    // If an LSA with identical contents already exists in the LSDB, skip
    // originating a new one (as per section 12.4 of RFC 2328).
    if let Some(old_lse) = old_lse
        && !lsa_differs_from(&old_lse.data, &lsa)
    {
        return;
    }

    // Skip origination while the previous instance is being flushed due to
    // sequence number wrapping.
    if instance.state.lsdb.seqno_wrapping.contains_key(&lsa_key) {
        instance.state.lsdb.seqno_wrapping.insert(lsa_key, lsa);
        return;
    }

    // Effectively originate the LSA.
    originate(instance, interfaces, lsa);
}

// Flushes LSA from the LSDB.
pub(crate) fn flush(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    lsa_key: &LsaKey,
    reason: LsaFlushReason,
) {
    let Some(lse) = instance.state.lsdb.get(lsa_key) else {
        return;
    };

    // Do not flush the same LSA more than once.
    if lse.data.hdr.is_maxage() {
        return;
    }

    Debug::LsaFlush(&lse.data.hdr, reason).log();

    // Set the LSA age to MaxAge.
    let mut lsa = (*lse.data).clone();
    lsa.set_maxage();
    let lsa = Arc::new(lsa);

    // Install updated LSA to clear rxmt lists and reflood it.
    if install(instance, interfaces, lsa.clone()) {
        flood(instance, interfaces, &lsa, None);
    }
}

// Removes MaxAge LSAs that are no longer contained on any neighbor's Link state
// retransmission list.
pub(crate) fn maxage_sweep(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
) {
    // Skip discarding MaxAge LSAs if any of the router's neighbors are in
    // states Exchange or Loading.
    if interfaces
        .values()
        .flat_map(|iface| iface.neighbors.values())
        .any(|nbr| {
            matches!(nbr.state, nsm::State::Exchange | nsm::State::Loading)
        })
    {
        return;
    }

    let lsa_keys = instance
        .state
        .lsdb
        .maxage_lsas
        .iter()
        .filter(|lsa_key| {
            !interfaces
                .values()
                .flat_map(|iface| iface.neighbors.values())
                .any(|nbr| nbr.lists.ls_rxmt.contains_key(lsa_key))
        })
        .copied()
        .collect::<Vec<_>>();

    for lsa_key in lsa_keys {
        // Delete or originate new instance of the LSA depending whether it's
        // wrapping its sequence number.
        let lsdb = &mut instance.state.lsdb;
        if let Some(lse) = lsdb.remove(&lsa_key) {
            Debug::LsaRemove(&lse.data.hdr).log();
        }
        if let Some(lsa) = lsdb.seqno_wrapping.remove(&lsa_key) {
            let lsa = Lsa::new(
                0,
                lsa.hdr.options,
                lsa.hdr.lsa_id,
                lsa.hdr.adv_rtr,
                LSA_INIT_SEQ_NO,
                lsa.body,
            );
            originate(instance, interfaces, lsa);
        }
    }
}

// ===== helper functions =====

// Handles older instances of the given LSA found on neighbors' Link state
// retransmission lists.
//
// When the contents have changed, the new instance is going to be flooded and
// the old ones are simply removed. Otherwise nothing is flooded, so the old
// instances are replaced by the new one and remain subject to retransmission.
fn rxmt_lists_update(
    instance: &InstanceUpView<'_>,
    interfaces: &mut Interfaces,
    lsa: &Arc<Lsa>,
    changed: bool,
) {
    for iface in interfaces.values_mut() {
        for nbr in iface.neighbors.values_mut() {
            let btree_map::Entry::Occupied(mut o) =
                nbr.lists.ls_rxmt.entry(lsa.hdr.key())
            else {
                continue;
            };
            if lsa_compare(&o.get().hdr, &lsa.hdr) != Ordering::Less {
                continue;
            }

            if changed {
                o.remove();
                nbr.rxmt_lsupd_stop_check(instance);
            } else {
                o.insert(lsa.clone());
            }
        }
    }
}
