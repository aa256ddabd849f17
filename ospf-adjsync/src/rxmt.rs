//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::packet::lsa::{Lsa, LsaHdr, LsaKey};

// Per-neighbor LSA lists used during database synchronization and reliable
// flooding.
#[derive(Debug, Default)]
pub struct NeighborLsaLists {
    // LSAs enqueued for transmission in LS Update packets.
    pub ls_update: BTreeMap<LsaKey, Arc<Lsa>>,
    // LSAs waiting to be acknowledged.
    pub ls_rxmt: BTreeMap<LsaKey, Arc<Lsa>>,
    // LSA headers enqueued for transmission in Database Description packets.
    pub db_summary: SummaryList,
    // LSAs that need to be received from this neighbor.
    pub ls_request: BTreeMap<LsaKey, LsaHdr>,
    // LSAs that were requested but not received yet.
    pub ls_request_pending: BTreeMap<LsaKey, LsaHdr>,
}

// Database summary list.
//
// LSAs are consumed in the order they were enqueued, but can also be removed
// by key when the neighbor advertises an instance that is at least as recent.
#[derive(Debug, Default)]
pub struct SummaryList {
    order: VecDeque<LsaKey>,
    lsas: HashMap<LsaKey, Arc<Lsa>>,
}

// ===== impl NeighborLsaLists =====

impl NeighborLsaLists {
    // Returns whether there are LSAs left to be requested or received.
    pub fn requests_outstanding(&self) -> bool {
        !self.ls_request.is_empty() || !self.ls_request_pending.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.ls_update.is_empty()
            && self.ls_rxmt.is_empty()
            && self.db_summary.is_empty()
            && !self.requests_outstanding()
    }
}

// ===== impl SummaryList =====

impl SummaryList {
    // Enqueues an LSA. If an instance of the LSA is already present, it's
    // replaced while keeping its original position.
    pub fn push(&mut self, lsa: Arc<Lsa>) {
        let lsa_key = lsa.hdr.key();
        if self.lsas.insert(lsa_key, lsa).is_none() {
            self.order.push_back(lsa_key);
        }
    }

    // Dequeues the oldest enqueued LSA.
    pub fn pop(&mut self) -> Option<Arc<Lsa>> {
        while let Some(lsa_key) = self.order.pop_front() {
            if let Some(lsa) = self.lsas.remove(&lsa_key) {
                return Some(lsa);
            }
        }
        None
    }

    pub fn get(&self, lsa_key: &LsaKey) -> Option<&Arc<Lsa>> {
        self.lsas.get(lsa_key)
    }

    pub fn remove(&mut self, lsa_key: &LsaKey) -> Option<Arc<Lsa>> {
        let lsa = self.lsas.remove(lsa_key)?;
        self.order.retain(|key| key != lsa_key);
        Some(lsa)
    }

    pub fn contains(&self, lsa_key: &LsaKey) -> bool {
        self.lsas.contains_key(lsa_key)
    }

    pub fn len(&self) -> usize {
        self.lsas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lsas.is_empty()
    }

    // Returns an iterator over the enqueued LSAs in transmission order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Lsa>> + '_ {
        self.order.iter().filter_map(|key| self.lsas.get(key))
    }
}
