//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::sync::Arc;

use derive_new::new;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc::UnboundedSender;

use crate::packet::Packet;

// Length of the IPv4 header that precedes every OSPF packet.
pub const IPV4_HDR_LENGTH: u16 = 20;

#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct SendDestination {
    pub ifname: String,
    pub addrs: SmallVec<[Ipv4Addr; 4]>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MulticastAddr {
    AllSpfRtrs,
    AllDrRtrs,
}

// Outgoing packet.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct NetTxPacketMsg {
    pub packet: Packet,
    pub src: Ipv4Addr,
    pub dst: SendDestination,
}

// Incoming packet.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct NetRxPacketMsg {
    pub ifname: String,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub packet: Packet,
}

// Packet transmission collaborator.
//
// Sending never blocks and never fails from the point of view of the protocol:
// packets are handed off and may be silently lost.
pub trait Transport: Send + Sync {
    fn send_packet(&self, msg: NetTxPacketMsg);
}

// Transport that relays outgoing packets through a channel.
#[derive(Clone, Debug)]
pub struct NetTx(pub UnboundedSender<NetTxPacketMsg>);

// ===== impl MulticastAddr =====

impl MulticastAddr {
    pub const fn addr(&self) -> Ipv4Addr {
        match self {
            MulticastAddr::AllSpfRtrs => Ipv4Addr::new(224, 0, 0, 5),
            MulticastAddr::AllDrRtrs => Ipv4Addr::new(224, 0, 0, 6),
        }
    }
}

// ===== impl NetTx =====

impl Transport for NetTx {
    fn send_packet(&self, msg: NetTxPacketMsg) {
        let _ = self.0.send(msg);
    }
}

// ===== blanket implementations =====

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn send_packet(&self, msg: NetTxPacketMsg) {
        (**self).send_packet(msg)
    }
}
