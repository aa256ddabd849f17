//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use nsm::{Action, Conditions, Event, State};
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::instance::InstanceUpView;
use crate::interface::{InterfaceType, InterfaceView};
use crate::network::NetTxPacketMsg;
use crate::notification;
use crate::output;
use crate::packet::{DbDesc, DbDescFlags, Options};
use crate::rxmt::NeighborLsaLists;
use crate::tasks::{NeighborTimer, TimerKey};

#[derive(Debug)]
pub struct Neighbor {
    pub ifname: String,
    pub router_id: Ipv4Addr,
    pub src: Ipv4Addr,
    pub dr: Option<Ipv4Addr>,
    pub bdr: Option<Ipv4Addr>,
    pub priority: u8,
    pub state: State,

    pub options: Option<Options>,
    pub dd_flags: DbDescFlags,
    pub dd_seq_no: u32,
    pub last_rcvd_dbdesc: Option<LastDbDesc>,
    pub last_sent_dbdesc: Option<NetTxPacketMsg>,

    pub event_count: u32,
    pub discontinuity_time: DateTime<Utc>,

    pub lists: NeighborLsaLists,
    pub timers: NeighborTimers,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LastDbDesc {
    pub options: Options,
    pub dd_flags: DbDescFlags,
    pub dd_seq_no: u32,
}

// Timers currently armed for a neighbor.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct NeighborTimers: u8 {
        const INACTIVITY = 0x01;
        const POLL = 0x02;
        const DBDESC_RXMT = 0x04;
        const LSREQ_RXMT = 0x08;
        const LSUPD_RXMT = 0x10;
        const DBDESC_FREE = 0x20;
    }
}

// Neighbor state machine.
//
// The transition table is a pure function of the current state, the event
// and a few conditions owned by other components. It returns the next state
// (if any) along with the actions that need to be performed by the caller.
pub mod nsm {
    use serde::{Deserialize, Serialize};
    use smallvec::{SmallVec, smallvec};

    use crate::debug::SeqNoMismatchReason;

    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    pub enum State {
        #[default]
        Down,
        Attempt,
        Init,
        TwoWay,
        ExStart,
        Exchange,
        Loading,
        Full,
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    pub enum Event {
        HelloRcvd,
        Start,
        TwoWayRcvd,
        NegotiationDone,
        ExchangeDone,
        BadLsReq,
        LoadingDone,
        AdjOk,
        SeqNoMismatch(SeqNoMismatchReason),
        OneWayRcvd,
        DbDescRxmtTimer,
        InactivityTimer,
        PollTimer,
        Kill,
        LinkDown,
    }

    // Inputs of the transition function that aren't part of the neighbor
    // state itself.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Conditions {
        // Whether an adjacency should be established with the neighbor.
        pub need_adjacency: bool,
        // Whether there are LSAs left to request or receive.
        pub requests_outstanding: bool,
        // Whether the neighbor is a statically configured NBMA neighbor.
        pub poll_configured: bool,
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    pub enum Action {
        InactivityTimerReset,
        InactivityTimerStop,
        PollTimerStart,
        PollTimerStop,
        SendHello,
        ExStartEnter,
        SummaryListBuild,
        ResetAdjacency,
        DbDescRxmt,
    }

    #[derive(Clone, Debug, Default, Eq, PartialEq)]
    pub struct Transition {
        pub next: Option<State>,
        pub actions: SmallVec<[Action; 4]>,
    }

    // All states, ordered from Down to Full.
    pub const STATES: [State; 8] = [
        State::Down,
        State::Attempt,
        State::Init,
        State::TwoWay,
        State::ExStart,
        State::Exchange,
        State::Loading,
        State::Full,
    ];

    // ===== impl Transition =====

    impl Transition {
        fn new(next: Option<State>, actions: &[Action]) -> Transition {
            Transition {
                next,
                actions: SmallVec::from_slice(actions),
            }
        }

        fn ignore() -> Transition {
            Transition::default()
        }

        // Returns whether the event has no effect at all.
        pub fn is_ignored(&self) -> bool {
            self.next.is_none() && self.actions.is_empty()
        }
    }

    // ===== global functions =====

    pub fn transition(
        state: State,
        event: &Event,
        cond: &Conditions,
    ) -> Transition {
        match (state, event) {
            // NSM (state, event) -> (Action, new state)
            (State::Down, Event::Start) => Transition::new(
                Some(State::Attempt),
                &[Action::SendHello, Action::InactivityTimerReset],
            ),
            // NSM (state, event) -> (Action, new state)
            (State::Down | State::Attempt, Event::HelloRcvd) => Transition::new(
                Some(State::Init),
                &[Action::InactivityTimerReset, Action::PollTimerStop],
            ),
            // NSM (state, event) -> (Action, new state)
            (_, Event::HelloRcvd) => {
                Transition::new(None, &[Action::InactivityTimerReset])
            }
            // NSM (state, event) -> (Action, new state)
            (State::Init | State::TwoWay, Event::TwoWayRcvd)
            | (State::TwoWay, Event::AdjOk) => {
                if cond.need_adjacency {
                    Transition::new(
                        Some(State::ExStart),
                        &[Action::ExStartEnter],
                    )
                } else {
                    Transition::new(Some(State::TwoWay), &[])
                }
            }
            // NSM (state, event) -> (Action, new state)
            (State::ExStart, Event::NegotiationDone) => Transition::new(
                Some(State::Exchange),
                &[Action::SummaryListBuild],
            ),
            // NSM (state, event) -> (Action, new state)
            (State::Exchange, Event::ExchangeDone) => {
                if cond.requests_outstanding {
                    // Wait for outstanding LS Requests to be responded.
                    Transition::new(Some(State::Loading), &[])
                } else {
                    Transition::new(Some(State::Full), &[])
                }
            }
            // NSM (state, event) -> (Action, new state)
            (State::Loading, Event::LoadingDone) => {
                Transition::new(Some(State::Full), &[])
            }
            // NSM (state, event) -> (Action, new state)
            (
                State::ExStart | State::Exchange | State::Loading | State::Full,
                Event::AdjOk,
            ) => {
                if cond.need_adjacency {
                    Transition::ignore()
                } else {
                    Transition::new(
                        Some(State::TwoWay),
                        &[Action::ResetAdjacency],
                    )
                }
            }
            // NSM (state, event) -> (Action, new state)
            (
                State::Attempt
                | State::Init
                | State::TwoWay
                | State::ExStart
                | State::Exchange
                | State::Loading
                | State::Full,
                Event::SeqNoMismatch(_) | Event::BadLsReq,
            ) => Transition::new(
                Some(State::ExStart),
                &[Action::ResetAdjacency, Action::ExStartEnter],
            ),
            // NSM (state, event) -> (Action, new state)
            (
                State::TwoWay
                | State::ExStart
                | State::Exchange
                | State::Loading
                | State::Full,
                Event::OneWayRcvd,
            ) => Transition::new(Some(State::Init), &[Action::ResetAdjacency]),
            // NSM (state, event) -> (Action, new state)
            //
            // Polling only survives inactivity. Killed neighbors and neighbors
            // on a down interface are left alone until heard from again.
            (_, Event::Kill | Event::LinkDown) => Transition {
                next: Some(State::Down),
                actions: smallvec![
                    Action::ResetAdjacency,
                    Action::InactivityTimerStop,
                    Action::PollTimerStop,
                ],
            },
            // NSM (state, event) -> (Action, new state)
            (_, Event::InactivityTimer) => {
                // Dead NBMA neighbors keep being polled at the reduced rate
                // PollInterval.
                let poll = if cond.poll_configured {
                    Action::PollTimerStart
                } else {
                    Action::PollTimerStop
                };
                Transition {
                    next: Some(State::Down),
                    actions: smallvec![
                        Action::ResetAdjacency,
                        Action::InactivityTimerStop,
                        poll,
                    ],
                }
            }
            // NSM (state, event) -> (Action, new state)
            (State::Down, Event::PollTimer) if cond.poll_configured => {
                Transition::new(
                    None,
                    &[Action::SendHello, Action::PollTimerStart],
                )
            }
            // NSM (state, event) -> (Action, new state)
            (State::ExStart | State::Exchange, Event::DbDescRxmtTimer) => {
                Transition::new(None, &[Action::DbDescRxmt])
            }
            // Everything else is absorbed without any effect.
            _ => Transition::ignore(),
        }
    }
}

// ===== impl Neighbor =====

impl Neighbor {
    pub(crate) fn new(
        ifname: &str,
        router_id: Ipv4Addr,
        src: Ipv4Addr,
    ) -> Neighbor {
        Debug::NeighborCreate(router_id, src).log();

        // Initialize the DD Sequence Number.
        let dd_seq_no = {
            #[cfg(not(feature = "deterministic"))]
            {
                use rand::RngCore;

                // Random value.
                rand::rng().next_u32()
            }
            #[cfg(feature = "deterministic")]
            {
                // Fixed value for deterministic test results.
                src.into()
            }
        };

        Neighbor {
            ifname: ifname.to_owned(),
            router_id,
            src,
            dr: None,
            bdr: None,
            priority: 0,
            state: State::Down,
            options: None,
            dd_flags: DbDescFlags::empty(),
            dd_seq_no,
            last_rcvd_dbdesc: None,
            last_sent_dbdesc: None,
            event_count: 0,
            discontinuity_time: Utc::now(),
            lists: Default::default(),
            timers: Default::default(),
        }
    }

    pub(crate) fn fsm(
        &mut self,
        iface: &mut InterfaceView<'_>,
        instance: &mut InstanceUpView<'_>,
        event: Event,
    ) {
        Debug::NsmEvent(self.router_id, &self.state, &event).log();

        let cond = Conditions {
            need_adjacency: iface.need_adjacency(self),
            requests_outstanding: self.lists.requests_outstanding(),
            poll_configured: self.poll_interval(iface).is_some(),
        };
        let transition = nsm::transition(self.state, &event, &cond);

        for action in &transition.actions {
            self.fsm_action(iface, instance, *action);
        }

        // Check for FSM state change.
        if let Some(new_state) = transition.next
            && new_state != self.state
        {
            self.fsm_state_change(iface, instance, new_state);
        }
    }

    fn fsm_action(
        &mut self,
        iface: &mut InterfaceView<'_>,
        instance: &mut InstanceUpView<'_>,
        action: Action,
    ) {
        match action {
            Action::InactivityTimerReset => {
                let timeout =
                    Duration::from_secs(iface.config.dead_interval.into());
                self.timer_start(instance, NeighborTimer::Inactivity, timeout);
            }
            Action::InactivityTimerStop => {
                self.timer_stop(instance, NeighborTimer::Inactivity);
            }
            Action::PollTimerStart => {
                if let Some(interval) = self.poll_interval(iface) {
                    let timeout = Duration::from_secs(interval.into());
                    self.timer_start(instance, NeighborTimer::Poll, timeout);
                }
            }
            Action::PollTimerStop => {
                self.timer_stop(instance, NeighborTimer::Poll);
            }
            Action::SendHello => {
                output::send_hello_nbr(self, iface, instance);
            }
            Action::ExStartEnter => {
                self.dd_seq_no = self.dd_seq_no.wrapping_add(1);
                self.dd_flags
                    .insert(DbDescFlags::I | DbDescFlags::M | DbDescFlags::MS);
                output::send_dbdesc(self, iface, instance);
            }
            Action::SummaryListBuild => {
                // List the contents of the entire LSDB in the summary list.
                for lse in instance.state.lsdb.iter_by_insertion() {
                    let lsa_key = lse.data.hdr.key();
                    if lse.data.hdr.is_maxage() {
                        self.lists.ls_rxmt.insert(lsa_key, lse.data.clone());
                    } else {
                        self.lists.db_summary.push(lse.data.clone());
                    }
                }
                self.rxmt_lsupd_start_check(iface, instance);
                self.dd_flags.remove(DbDescFlags::I);
            }
            Action::ResetAdjacency => {
                self.reset_adjacency(instance);
            }
            Action::DbDescRxmt => {
                // Only the master retransmits, except for the initial packet.
                if self.dd_flags.intersects(DbDescFlags::MS | DbDescFlags::I) {
                    output::rxmt_dbdesc(self, iface, instance);
                    let timeout = iface.rxmt_interval();
                    let timer = NeighborTimer::DbDescRxmt;
                    self.timer_start(instance, timer, timeout);
                }
            }
        }
    }

    fn fsm_state_change(
        &mut self,
        iface: &mut InterfaceView<'_>,
        instance: &mut InstanceUpView<'_>,
        new_state: State,
    ) {
        // Check if the neighbor changed to/from the FULL state.
        if new_state == State::Full || self.state == State::Full {
            // (Re)originate LSAs that might have been affected.
            instance.state.orig_pending = true;
        }

        // Keep track of the neighbors advertised in our Hello packets.
        if new_state >= State::Init {
            iface.state.nbr_ids.insert(self.router_id);
        } else {
            iface.state.nbr_ids.remove(&self.router_id);
        }

        // Effectively transition to the new FSM state.
        Debug::NsmTransition(self.router_id, &self.state, &new_state).log();
        let old_state = std::mem::replace(&mut self.state, new_state);
        notification::nbr_state_change(instance, self, old_state);

        // Update statistics.
        self.event_count += 1;
        self.discontinuity_time = Utc::now();
    }

    pub(crate) fn loading_done_check(
        &mut self,
        iface: &mut InterfaceView<'_>,
        instance: &mut InstanceUpView<'_>,
    ) {
        // Check if all pending LSA requests were received.
        if self.lists.ls_request_pending.is_empty() {
            // Stop the LS Request rxmt timer.
            self.timer_stop(instance, NeighborTimer::LsRequestRxmt);

            // Check if there are new LSAs to request.
            if !self.lists.ls_request.is_empty() {
                output::send_lsreq(self, iface, instance);
            } else if self.state == State::Loading {
                // Database loading has completed.
                self.fsm(iface, instance, Event::LoadingDone);
            }
        }
    }

    // Clears all adjacency state, including every list and every
    // adjacency-related timer.
    fn reset_adjacency(&mut self, instance: &InstanceUpView<'_>) {
        self.options = None;
        self.last_rcvd_dbdesc = None;
        self.last_sent_dbdesc = None;
        self.lists = Default::default();
        for timer in [
            NeighborTimer::DbDescRxmt,
            NeighborTimer::LsRequestRxmt,
            NeighborTimer::LsUpdateRxmt,
            NeighborTimer::DbDescFree,
        ] {
            self.timer_stop(instance, timer);
        }
    }

    pub(crate) fn dbdesc_is_dup(&self, dbdesc: &DbDesc) -> bool {
        if let Some(last_rcvd_dbdesc) = &self.last_rcvd_dbdesc
            && last_rcvd_dbdesc.options == dbdesc.options
            && last_rcvd_dbdesc.dd_flags == dbdesc.dd_flags
            && last_rcvd_dbdesc.dd_seq_no == dbdesc.dd_seq_no
        {
            return true;
        }

        false
    }

    // Returns the poll interval of statically configured NBMA neighbors.
    fn poll_interval(&self, iface: &InterfaceView<'_>) -> Option<u16> {
        if iface.config.if_type != InterfaceType::NonBroadcast {
            return None;
        }
        iface
            .config
            .static_nbrs
            .get(&self.src)
            .map(|snbr| {
                snbr.poll_interval.unwrap_or(iface.config.poll_interval)
            })
    }

    pub(crate) fn timer_key(&self, timer: NeighborTimer) -> TimerKey {
        TimerKey::Neighbor {
            ifname: self.ifname.clone(),
            addr: self.src,
            timer,
        }
    }

    // Arms the given timer, restarting it if it's already running.
    pub(crate) fn timer_start(
        &mut self,
        instance: &InstanceUpView<'_>,
        timer: NeighborTimer,
        timeout: Duration,
    ) {
        self.timers.insert(timer.into());
        instance.tx.timers.start_timer(self.timer_key(timer), timeout);
    }

    pub(crate) fn timer_stop(
        &mut self,
        instance: &InstanceUpView<'_>,
        timer: NeighborTimer,
    ) {
        if self.timers.contains(timer.into()) {
            self.timers.remove(timer.into());
            instance.tx.timers.clear_timer(&self.timer_key(timer));
        }
    }

    pub fn timer_is_active(&self, timer: NeighborTimer) -> bool {
        self.timers.contains(timer.into())
    }

    pub(crate) fn rxmt_lsupd_start_check(
        &mut self,
        iface: &InterfaceView<'_>,
        instance: &InstanceUpView<'_>,
    ) {
        if !self.lists.ls_rxmt.is_empty()
            && !self.timer_is_active(NeighborTimer::LsUpdateRxmt)
        {
            let timeout = iface.rxmt_interval();
            self.timer_start(instance, NeighborTimer::LsUpdateRxmt, timeout);
        }
    }

    pub(crate) fn rxmt_lsupd_stop_check(
        &mut self,
        instance: &InstanceUpView<'_>,
    ) {
        if self.lists.ls_rxmt.is_empty() {
            self.timer_stop(instance, NeighborTimer::LsUpdateRxmt);
        }
    }
}

// ===== impl NeighborTimers =====

impl From<NeighborTimer> for NeighborTimers {
    fn from(timer: NeighborTimer) -> NeighborTimers {
        match timer {
            NeighborTimer::Inactivity => NeighborTimers::INACTIVITY,
            NeighborTimer::Poll => NeighborTimers::POLL,
            NeighborTimer::DbDescRxmt => NeighborTimers::DBDESC_RXMT,
            NeighborTimer::LsRequestRxmt => NeighborTimers::LSREQ_RXMT,
            NeighborTimer::LsUpdateRxmt => NeighborTimers::LSUPD_RXMT,
            NeighborTimer::DbDescFree => NeighborTimers::DBDESC_FREE,
        }
    }
}
