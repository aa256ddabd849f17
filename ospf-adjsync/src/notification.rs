//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::instance::InstanceUpView;
use crate::neighbor::{Neighbor, nsm};
use crate::packet::lsa::Lsa;

// Receiver of LSDB and adjacency change notifications.
pub trait LsdbObserver: Send + Sync {
    // Called once for every installed LSA whose contents have changed.
    fn database_changed(&self, lsa: &Lsa);

    // Called whenever a neighbor transitions to a different state.
    fn nbr_state_change(&self, _change: &NbrStateChange) {}
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct NbrStateChange {
    pub ifname: String,
    pub router_id: Ipv4Addr,
    pub addr: Ipv4Addr,
    pub old_state: nsm::State,
    pub new_state: nsm::State,
}

// Notification relayed through a channel.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum ObserverMsg {
    DatabaseChanged(Arc<Lsa>),
    NbrStateChange(NbrStateChange),
}

// Observer that relays notifications to another task.
#[derive(Clone, Debug)]
pub struct ObserverTx(pub UnboundedSender<ObserverMsg>);

// ===== impl ObserverTx =====

impl LsdbObserver for ObserverTx {
    fn database_changed(&self, lsa: &Lsa) {
        let msg = ObserverMsg::DatabaseChanged(Arc::new(lsa.clone()));
        let _ = self.0.send(msg);
    }

    fn nbr_state_change(&self, change: &NbrStateChange) {
        let _ = self.0.send(ObserverMsg::NbrStateChange(change.clone()));
    }
}

// ===== blanket implementations =====

impl<T> LsdbObserver for Arc<T>
where
    T: LsdbObserver + ?Sized,
{
    fn database_changed(&self, lsa: &Lsa) {
        (**self).database_changed(lsa)
    }

    fn nbr_state_change(&self, change: &NbrStateChange) {
        (**self).nbr_state_change(change)
    }
}

// ===== global functions =====

pub(crate) fn nbr_state_change(
    instance: &InstanceUpView<'_>,
    nbr: &Neighbor,
    old_state: nsm::State,
) {
    let change = NbrStateChange {
        ifname: nbr.ifname.clone(),
        router_id: nbr.router_id,
        addr: nbr.src,
        old_state,
        new_state: nbr.state,
    };
    instance.tx.observer.nbr_state_change(&change);
}
