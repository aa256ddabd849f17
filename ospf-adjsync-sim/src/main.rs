//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod config;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use config::{Config, LoggingFmtStyle};
use ospf_adjsync::instance::{
    Instance, InstanceCfg, InstanceCtlMsg, InstanceTx,
};
use ospf_adjsync::interface::{Interface, InterfaceCfg};
use ospf_adjsync::network::{NetRxPacketMsg, NetTx, NetTxPacketMsg};
use ospf_adjsync::notification::{ObserverMsg, ObserverTx};
use ospf_adjsync::task::Task;
use ospf_adjsync::tasks::TimerTasks;
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::level_filters::LevelFilter;
use tracing::{Instrument, debug, debug_span, info, warn};
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;

// Router interface attached to a simulated link.
#[derive(Debug)]
struct Attachment {
    router: usize,
    ifname: String,
    addr: Ipv4Addr,
    net_rx_tx: UnboundedSender<NetRxPacketMsg>,
}

// Simulated link.
#[derive(Debug)]
struct SimLink {
    config: config::Link,
    attachments: Vec<Attachment>,
}

type SimLinks = Arc<BTreeMap<String, SimLink>>;

// ===== impl SimLink =====

impl SimLink {
    // Hands the packet over to the given attachment, subject to the link
    // impairments.
    fn transmit(&self, peer: &Attachment, msg: NetRxPacketMsg) {
        let mut rng = rand::rng();
        if rng.random_bool(self.config.loss.clamp(0.0, 1.0)) {
            debug!(ifname = %peer.ifname, src = %msg.src, "packet lost");
            return;
        }
        let duplicate = self.config.duplicate.clamp(0.0, 1.0);
        let copies = if rng.random_bool(duplicate) { 2 } else { 1 };

        let delay = Duration::from_millis(self.config.delay);
        for _ in 0..copies {
            let net_rx_tx = peer.net_rx_tx.clone();
            let msg = msg.clone();
            let mut task = Task::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = net_rx_tx.send(msg);
            });
            task.detach();
        }
    }
}

// ===== helper functions =====

fn init_tracing(config: &config::Logging) {
    let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(config.show_thread_id)
        .with_file(config.show_source)
        .with_line_number(config.show_source)
        .with_ansi(config.colors);
    let layer = match config.style {
        LoggingFmtStyle::Compact => layer.compact().boxed(),
        LoggingFmtStyle::Full => layer.boxed(),
        LoggingFmtStyle::Json => layer.json().boxed(),
        LoggingFmtStyle::Pretty => layer.pretty().boxed(),
    };
    let stdout = layer.with_filter(log_level_filter);

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("ospf_adjsync=debug".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .init();
}

// Relays the packets sent by a router to the other routers attached to the
// same links.
async fn relay(
    router: usize,
    ifaces: BTreeMap<String, String>,
    links: SimLinks,
    mut net_tx_rx: UnboundedReceiver<NetTxPacketMsg>,
) {
    while let Some(msg) = net_tx_rx.recv().await {
        let Some(link) = ifaces
            .get(&msg.dst.ifname)
            .and_then(|link_name| links.get(link_name))
        else {
            continue;
        };

        for peer in link.attachments.iter().filter(|peer| peer.router != router)
        {
            for dst in &msg.dst.addrs {
                if !dst.is_multicast() && *dst != peer.addr {
                    continue;
                }
                let rx_msg = NetRxPacketMsg {
                    ifname: peer.ifname.clone(),
                    src: msg.src,
                    dst: *dst,
                    packet: msg.packet.clone(),
                };
                link.transmit(peer, rx_msg);
            }
        }
    }
}

// Logs all notifications emitted by a router.
async fn observe(mut observer_rx: UnboundedReceiver<ObserverMsg>) {
    while let Some(msg) = observer_rx.recv().await {
        match msg {
            ObserverMsg::DatabaseChanged(lsa) => {
                info!(
                    lsa_type = %lsa.hdr.lsa_type,
                    lsa_id = %lsa.hdr.lsa_id,
                    adv_rtr = %lsa.hdr.adv_rtr,
                    seq_no = %format!("{:#010x}", lsa.hdr.seq_no),
                    "database changed"
                );
            }
            ObserverMsg::NbrStateChange(change) => {
                info!(
                    ifname = %change.ifname,
                    router_id = %change.router_id,
                    old_state = ?change.old_state,
                    new_state = ?change.new_state,
                    "neighbor state change"
                );
            }
        }
    }
}

// Summarizes the final neighbor states and database contents of a router.
fn instance_report(instance: &Instance) -> Value {
    let neighbors = instance
        .interfaces
        .values()
        .flat_map(|iface| iface.neighbors.values())
        .map(|nbr| {
            json!({
                "interface": nbr.ifname,
                "router-id": nbr.router_id,
                "address": nbr.src,
                "state": nbr.state,
            })
        })
        .collect::<Vec<_>>();
    let lsdb = instance
        .lsdb()
        .iter()
        .map(|(lsa_key, lse)| {
            json!({
                "type": lsa_key.lsa_type.to_string(),
                "lsa-id": lsa_key.lsa_id,
                "adv-rtr": lsa_key.adv_rtr,
                "seq-no": format!("{:#010x}", lse.data.hdr.seq_no),
                "cksum": format!("{:#06x}", lse.data.hdr.cksum),
                "age": lse.data.hdr.age,
            })
        })
        .collect::<Vec<_>>();

    json!({
        "neighbors": neighbors,
        "lsdb": lsdb,
    })
}

async fn simulate(config: Config) {
    let time_scale = config.time_scale;

    // Create the inbound packet channels upfront, since links need them.
    let (net_rx_txs, net_rxs): (Vec<_>, Vec<_>) = config
        .routers
        .iter()
        .map(|_| mpsc::unbounded_channel::<NetRxPacketMsg>())
        .unzip();

    // Attach router interfaces to links.
    let mut links = config
        .links
        .iter()
        .map(|(name, link)| {
            let link = SimLink {
                config: link.clone(),
                attachments: vec![],
            };
            (name.clone(), link)
        })
        .collect::<BTreeMap<_, _>>();
    for (router, router_cfg) in config.routers.iter().enumerate() {
        for (ifname, iface_cfg) in &router_cfg.interfaces {
            let Some(link) = links.get_mut(&iface_cfg.link) else {
                warn!(%ifname, link = %iface_cfg.link, "unknown link");
                continue;
            };
            link.attachments.push(Attachment {
                router,
                ifname: ifname.clone(),
                addr: iface_cfg.addr.ip(),
                net_rx_tx: net_rx_txs[router].clone(),
            });
        }
    }
    let links = Arc::new(links);

    // Start routers.
    let mut instances = vec![];
    let mut ctl_txs = vec![];
    let mut tasks = vec![];
    for (router, (router_cfg, net_rx)) in
        config.routers.iter().zip(net_rxs).enumerate()
    {
        let router_id = router_cfg.router_id;
        let (net_tx_tx, net_tx_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (observer_tx, observer_rx) = mpsc::unbounded_channel();

        let tx = InstanceTx {
            net: Box::new(NetTx(net_tx_tx)),
            timers: Box::new(
                TimerTasks::new(timer_tx).with_time_scale(time_scale),
            ),
            observer: Box::new(ObserverTx(observer_tx)),
        };
        let area_id = router_cfg.area_id.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let mut instance_cfg = InstanceCfg::new(router_id, area_id);
        instance_cfg.stub_networks = router_cfg.stub_networks.clone();
        let mut instance = Instance::new(instance_cfg, tx);

        let mut ifaces = BTreeMap::new();
        for (ifname, iface_cfg) in &router_cfg.interfaces {
            let mut cfg = InterfaceCfg::new(iface_cfg.if_type, iface_cfg.addr);
            if let Some(cost) = iface_cfg.cost {
                cfg.cost = cost;
            }
            if let Some(priority) = iface_cfg.priority {
                cfg.priority = priority;
            }
            instance.add_interface(Interface::new(ifname.clone(), cfg));
            ifaces.insert(ifname.clone(), iface_cfg.link.clone());

            // Processed right after the instance starts.
            if iface_cfg.dr.is_some() || iface_cfg.bdr.is_some() {
                let msg = InstanceCtlMsg::SetDrBdr(
                    ifname.clone(),
                    iface_cfg.dr,
                    iface_cfg.bdr,
                );
                let _ = ctl_tx.send(msg);
            }
        }

        let span = debug_span!("router", %router_id);
        tasks.push(Task::spawn(
            relay(router, ifaces, links.clone(), net_tx_rx)
                .instrument(span.clone()),
        ));
        tasks.push(Task::spawn(observe(observer_rx).instrument(span)));
        instances.push(Task::spawn(instance.run(net_rx, timer_rx, ctl_rx)));
        ctl_txs.push(ctl_tx);
    }

    // Let the simulation run.
    let duration = Duration::from_secs(config.duration).mul_f64(time_scale);
    tokio::time::sleep(duration).await;

    // Stop routers and print their final state.
    for ctl_tx in &ctl_txs {
        let _ = ctl_tx.send(InstanceCtlMsg::Stop);
    }
    let mut report = serde_json::Map::new();
    for task in instances {
        match task.await {
            Ok(instance) => {
                let router_id = instance.config.router_id.to_string();
                report.insert(router_id, instance_report(&instance));
            }
            Err(error) => {
                warn!(%error, "router task failed");
            }
        }
    }
    match serde_json::to_string_pretty(&Value::Object(report)) {
        Ok(report) => println!("{report}"),
        Err(error) => warn!(%error, "failed to serialize report"),
    }
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("OSPF adjacency simulator")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = Config::load(config_file);
    if config.time_scale.is_nan() || config.time_scale <= 0.0 {
        eprintln!("time_scale must be positive");
        std::process::exit(1);
    }

    // Initialize tracing.
    init_tracing(&config.logging);

    info!("starting up");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(simulate(config));

    info!("exiting");
}
