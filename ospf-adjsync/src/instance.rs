//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug_span;

use crate::debug::{Debug, LsaFlushReason};
use crate::error::Error;
use crate::events;
use crate::interface::{Interface, InterfaceType, Interfaces};
use crate::lsdb::{self, Lsdb};
use crate::neighbor::{Neighbor, nsm};
use crate::network::{NetRxPacketMsg, Transport};
use crate::notification::LsdbObserver;
use crate::output;
use crate::packet::lsa::{
    LsaBody, LsaKey, LsaNetwork, LsaRouter, LsaRouterFlags, LsaRouterLink,
    LsaRouterLinkType, LsaTypeCode,
};
use crate::tasks::{TimerExpiry, TimerKey, TimerService};

// Interval between two consecutive MaxAge LSA sweeps, in seconds.
pub const LSDB_MAXAGE_SWEEP_INTERVAL: u16 = 5;

#[derive(Debug)]
pub struct Instance {
    // Instance configuration data.
    pub config: InstanceCfg,
    // Instance state data.
    pub state: InstanceState,
    // Instance interfaces, indexed by name.
    pub interfaces: Interfaces,
    // Instance Tx collaborators.
    pub tx: InstanceTx,
}

#[derive(Clone, Debug)]
pub struct InstanceCfg {
    pub router_id: Ipv4Addr,
    pub area_id: Ipv4Addr,
    // Networks advertised as stub links in the Router-LSA.
    pub stub_networks: Vec<Ipv4Network>,
    pub lsdb_maxage_sweep_interval: u16,
}

#[derive(Debug)]
pub struct InstanceState {
    // Instance Router ID.
    pub router_id: Ipv4Addr,
    // Area LSDB.
    pub lsdb: Lsdb,
    // Whether the self-originated LSAs need to be checked at the end of the
    // current event.
    pub orig_pending: bool,
    // Statistics.
    pub orig_lsa_count: u32,
    pub rx_lsa_count: u32,
    pub discontinuity_time: DateTime<Utc>,
}

// Collaborators used to interact with the outside world.
pub struct InstanceTx {
    pub net: Box<dyn Transport>,
    pub timers: Box<dyn TimerService>,
    pub observer: Box<dyn LsdbObserver>,
}

pub struct InstanceUpView<'a> {
    pub config: &'a InstanceCfg,
    pub state: &'a mut InstanceState,
    pub tx: &'a InstanceTx,
}

// Control messages accepted by the instance event loop.
#[derive(Clone, Debug)]
pub enum InstanceCtlMsg {
    InterfaceDown(String),
    KillNeighbor(String, Ipv4Addr),
    SetDrBdr(String, Option<Ipv4Addr>, Option<Ipv4Addr>),
    Stop,
}

// Input of the instance event loop.
enum InstanceInput {
    NetRxPacket(NetRxPacketMsg),
    Timer(TimerExpiry),
    Ctl(InstanceCtlMsg),
}

// ===== impl Instance =====

impl Instance {
    pub fn new(config: InstanceCfg, tx: InstanceTx) -> Instance {
        let state = InstanceState::new(config.router_id);
        Instance {
            config,
            state,
            interfaces: Default::default(),
            tx,
        }
    }

    pub fn add_interface(&mut self, iface: Interface) {
        self.interfaces.insert(iface.name.clone(), iface);
    }

    // Starts all interfaces and originates the initial Router-LSA.
    pub fn start(&mut self) {
        self.process(|instance, interfaces| {
            Debug::InstanceStart.log();

            for iface in interfaces.values_mut() {
                iface.start(instance);
            }

            // Start the MaxAge sweep timer.
            let timeout = Duration::from_secs(
                instance.config.lsdb_maxage_sweep_interval.into(),
            );
            instance
                .tx
                .timers
                .start_timer(TimerKey::LsdbMaxAgeSweep, timeout);

            instance.state.orig_pending = true;
            Ok(())
        })
        .unwrap_or_else(|error| error.log());
    }

    pub fn process_nsm_event(
        &mut self,
        ifname: &str,
        addr: Ipv4Addr,
        event: nsm::Event,
    ) -> Result<(), Error> {
        self.process(|instance, interfaces| {
            events::process_nsm_event(instance, interfaces, ifname, addr, event)
        })
    }

    pub fn process_packet(&mut self, msg: NetRxPacketMsg) -> Result<(), Error> {
        self.process(|instance, interfaces| {
            events::process_packet(instance, interfaces, msg)
        })
    }

    pub fn process_timer(&mut self, key: TimerKey) -> Result<(), Error> {
        self.process(|instance, interfaces| {
            events::process_timer(instance, interfaces, key)
        })
    }

    // Brings the interface down, killing all of its neighbors.
    pub fn interface_down(&mut self, ifname: &str) -> Result<(), Error> {
        self.process(|instance, interfaces| {
            let iface = interfaces
                .get_mut(ifname)
                .ok_or_else(|| Error::InterfaceNotFound(ifname.to_owned()))?;
            iface.stop(instance);
            instance.state.orig_pending = true;
            Ok(())
        })
    }

    pub fn kill_neighbor(
        &mut self,
        ifname: &str,
        addr: Ipv4Addr,
    ) -> Result<(), Error> {
        self.process_nsm_event(ifname, addr, nsm::Event::Kill)
    }

    // Updates the DR and BDR elected on the given interface.
    pub fn set_dr_bdr(
        &mut self,
        ifname: &str,
        dr: Option<Ipv4Addr>,
        bdr: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        self.process(|instance, interfaces| {
            let iface = interfaces
                .get_mut(ifname)
                .ok_or_else(|| Error::InterfaceNotFound(ifname.to_owned()))?;
            iface.set_dr_bdr(instance, dr, bdr);
            Ok(())
        })
    }

    // Requests the Router-LSA to be rebuilt, originating a new instance if its
    // contents have changed.
    pub fn originate_router_lsa(&mut self) {
        self.process(|instance, _| {
            instance.state.orig_pending = true;
            Ok(())
        })
        .unwrap_or_else(|error| error.log());
    }

    pub fn neighbor(&self, ifname: &str, addr: Ipv4Addr) -> Option<&Neighbor> {
        self.interfaces
            .get(ifname)
            .and_then(|iface| iface.neighbors.get(&addr))
    }

    pub fn nbr_state(
        &self,
        ifname: &str,
        addr: Ipv4Addr,
    ) -> Option<nsm::State> {
        self.neighbor(ifname, addr).map(|nbr| nbr.state)
    }

    pub fn is_adjacency_full(&self, ifname: &str, addr: Ipv4Addr) -> bool {
        self.nbr_state(ifname, addr) == Some(nsm::State::Full)
    }

    pub fn lsdb(&self) -> &Lsdb {
        &self.state.lsdb
    }

    // Runs the instance event loop until a stop request is received or the
    // control channel is closed.
    pub async fn run(
        mut self,
        mut net_rx: UnboundedReceiver<NetRxPacketMsg>,
        mut timer_rx: UnboundedReceiver<TimerExpiry>,
        mut ctl_rx: UnboundedReceiver<InstanceCtlMsg>,
    ) -> Instance {
        let router_id = self.config.router_id;
        let span = debug_span!("ospf-instance", %router_id);
        span.in_scope(|| self.start());

        loop {
            let input = tokio::select! {
                Some(msg) = net_rx.recv() => InstanceInput::NetRxPacket(msg),
                Some(expiry) = timer_rx.recv() => InstanceInput::Timer(expiry),
                msg = ctl_rx.recv() => match msg {
                    Some(InstanceCtlMsg::Stop) | None => break,
                    Some(msg) => InstanceInput::Ctl(msg),
                },
            };

            span.in_scope(|| {
                if let Err(error) = self.process_input(input) {
                    error.log();
                }
            });
        }

        self
    }

    fn process_input(&mut self, input: InstanceInput) -> Result<(), Error> {
        match input {
            InstanceInput::NetRxPacket(msg) => self.process_packet(msg),
            InstanceInput::Timer(expiry) => {
                // The timer might have been restarted or cleared while its
                // expiry was queued.
                if !self.tx.timers.expire(&expiry) {
                    Debug::TimerStale(&expiry.key).log();
                    return Ok(());
                }
                self.process_timer(expiry.key)
            }
            InstanceInput::Ctl(InstanceCtlMsg::InterfaceDown(ifname)) => {
                self.interface_down(&ifname)
            }
            InstanceInput::Ctl(InstanceCtlMsg::KillNeighbor(ifname, addr)) => {
                self.kill_neighbor(&ifname, addr)
            }
            InstanceInput::Ctl(InstanceCtlMsg::SetDrBdr(ifname, dr, bdr)) => {
                self.set_dr_bdr(&ifname, dr, bdr)
            }
            InstanceInput::Ctl(InstanceCtlMsg::Stop) => Ok(()),
        }
    }

    // Runs one processing step to completion.
    //
    // Once the step is over, pending LSA originations are carried out and all
    // queued LS Updates are sent.
    fn process<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(
            &mut InstanceUpView<'_>,
            &mut Interfaces,
        ) -> Result<(), Error>,
    {
        let (mut instance, interfaces) = self.as_up();
        let result = f(&mut instance, interfaces);

        if instance.state.orig_pending {
            instance.state.orig_pending = false;
            lsa_orig_check(&mut instance, interfaces);
        }
        output::send_lsupd_pending(&instance, interfaces);

        result
    }

    pub(crate) fn as_up(&mut self) -> (InstanceUpView<'_>, &mut Interfaces) {
        let instance = InstanceUpView {
            config: &self.config,
            state: &mut self.state,
            tx: &self.tx,
        };
        (instance, &mut self.interfaces)
    }
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    pub fn new(router_id: Ipv4Addr, area_id: Ipv4Addr) -> InstanceCfg {
        InstanceCfg {
            router_id,
            area_id,
            stub_networks: Default::default(),
            lsdb_maxage_sweep_interval: LSDB_MAXAGE_SWEEP_INTERVAL,
        }
    }
}

// ===== impl InstanceState =====

impl InstanceState {
    fn new(router_id: Ipv4Addr) -> InstanceState {
        InstanceState {
            router_id,
            lsdb: Default::default(),
            orig_pending: false,
            orig_lsa_count: 0,
            rx_lsa_count: 0,
            discontinuity_time: Utc::now(),
        }
    }
}

// ===== impl InstanceTx =====

impl std::fmt::Debug for InstanceTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceTx").finish_non_exhaustive()
    }
}

// ===== helper functions =====

// Checks which LSAs this router should be originating, (re)originating those
// whose contents have changed and flushing the ones that are no longer needed.
fn lsa_orig_check(
    instance: &mut InstanceUpView<'_>,
    interfaces: &mut Interfaces,
) {
    let router_id = instance.state.router_id;
    let mut expected = BTreeSet::new();

    // Router-LSA.
    let body = lsa_orig_router(instance, interfaces);
    expected.insert(LsaKey::new(
        LsaTypeCode::Router.into(),
        router_id,
        router_id,
    ));
    lsdb::originate_check(instance, interfaces, router_id, body);

    // Network-LSAs of the segments where this router is the DR.
    for (lsa_id, body) in lsa_orig_networks(instance, interfaces) {
        expected.insert(LsaKey::new(
            LsaTypeCode::Network.into(),
            router_id,
            lsa_id,
        ));
        lsdb::originate_check(instance, interfaces, lsa_id, body);
    }

    // Flush self-originated LSAs that shouldn't exist anymore, including
    // stale instances originated before a restart.
    let stale = instance
        .state
        .lsdb
        .iter()
        .filter(|(lsa_key, lse)| {
            lsa_key.adv_rtr == router_id
                && !lse.data.hdr.is_maxage()
                && !expected.contains(*lsa_key)
        })
        .map(|(lsa_key, _)| *lsa_key)
        .collect::<Vec<_>>();
    for lsa_key in stale {
        lsdb::flush(
            instance,
            interfaces,
            &lsa_key,
            LsaFlushReason::PrematureAging,
        );
    }
}

fn lsa_orig_router(
    instance: &InstanceUpView<'_>,
    interfaces: &Interfaces,
) -> LsaBody {
    let mut links = vec![];

    for iface in interfaces.values().filter(|iface| iface.is_up()) {
        let addr = iface.config.addr;
        let cost = iface.config.cost;
        let full_nbrs = || {
            iface
                .neighbors
                .values()
                .filter(|nbr| nbr.state == nsm::State::Full)
        };

        match iface.config.if_type {
            InterfaceType::PointToPoint => {
                // Add a Type 1 link (point-to-point) for the fully adjacent
                // neighbor.
                for nbr in full_nbrs() {
                    links.push(LsaRouterLink::new(
                        LsaRouterLinkType::PointToPoint,
                        nbr.router_id,
                        addr.ip(),
                        cost,
                    ));
                }

                // Add a Type 3 link (stub network) for the subnet.
                links.push(LsaRouterLink::new(
                    LsaRouterLinkType::StubNetwork,
                    addr.network(),
                    addr.mask(),
                    cost,
                ));
            }
            InterfaceType::PointToMultipoint => {
                // Add a Type 1 link for each fully adjacent neighbor.
                for nbr in full_nbrs() {
                    links.push(LsaRouterLink::new(
                        LsaRouterLinkType::PointToPoint,
                        nbr.router_id,
                        addr.ip(),
                        cost,
                    ));
                }

                // Add a Type 3 link for the interface address itself.
                links.push(LsaRouterLink::new(
                    LsaRouterLinkType::StubNetwork,
                    addr.ip(),
                    Ipv4Addr::BROADCAST,
                    0,
                ));
            }
            InterfaceType::Broadcast | InterfaceType::NonBroadcast => {
                let src_addr = iface.state.src_addr;
                let is_dr = iface.state.dr == Some(src_addr);

                // The segment is a transit network when this router is fully
                // adjacent to the DR, or is the DR and fully adjacent to at
                // least one other router.
                let transit = match iface.state.dr {
                    Some(_) if is_dr => full_nbrs().next().is_some(),
                    Some(dr) => full_nbrs().any(|nbr| nbr.src == dr),
                    None => false,
                };
                match iface.state.dr {
                    Some(dr) if transit => {
                        links.push(LsaRouterLink::new(
                            LsaRouterLinkType::TransitNetwork,
                            dr,
                            src_addr,
                            cost,
                        ));
                    }
                    _ => {
                        links.push(LsaRouterLink::new(
                            LsaRouterLinkType::StubNetwork,
                            addr.network(),
                            addr.mask(),
                            cost,
                        ));
                    }
                }
            }
        }
    }

    // Add configured stub networks.
    for network in &instance.config.stub_networks {
        links.push(LsaRouterLink::new(
            LsaRouterLinkType::StubNetwork,
            network.network(),
            network.mask(),
            0,
        ));
    }

    LsaBody::Router(LsaRouter {
        flags: LsaRouterFlags::empty(),
        links,
    })
}

fn lsa_orig_networks(
    instance: &InstanceUpView<'_>,
    interfaces: &Interfaces,
) -> BTreeMap<Ipv4Addr, LsaBody> {
    interfaces
        .values()
        .filter(|iface| iface.is_up())
        .filter(|iface| {
            matches!(
                iface.config.if_type,
                InterfaceType::Broadcast | InterfaceType::NonBroadcast
            )
        })
        .filter(|iface| iface.state.dr == Some(iface.state.src_addr))
        .filter_map(|iface| {
            let mut attached_rtrs = iface
                .neighbors
                .values()
                .filter(|nbr| nbr.state == nsm::State::Full)
                .map(|nbr| nbr.router_id)
                .collect::<BTreeSet<_>>();
            if attached_rtrs.is_empty() {
                return None;
            }
            attached_rtrs.insert(instance.state.router_id);

            let body = LsaBody::Network(LsaNetwork {
                mask: iface.config.addr.mask(),
                attached_rtrs,
            });
            Some((iface.state.src_addr, body))
        })
        .collect()
}
