//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::derivable_impls)]

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use ospf_adjsync::interface::InterfaceType;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub logging: Logging,
    // Multiplier applied to all protocol timers.
    pub time_scale: f64,
    // Simulated time to run for, in seconds.
    pub duration: u64,
    pub routers: Vec<Router>,
    pub links: BTreeMap<String, Link>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub style: LoggingFmtStyle,
    pub colors: bool,
    pub show_thread_id: bool,
    pub show_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFmtStyle {
    Compact,
    Full,
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Router {
    pub router_id: Ipv4Addr,
    // Defaults to the backbone area.
    pub area_id: Option<Ipv4Addr>,
    #[serde(default)]
    pub stub_networks: Vec<Ipv4Network>,
    #[serde(default)]
    pub interfaces: BTreeMap<String, Interface>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Interface {
    // Name of the link this interface is attached to.
    pub link: String,
    pub addr: Ipv4Network,
    #[serde(rename = "type", default)]
    pub if_type: InterfaceType,
    pub cost: Option<u16>,
    pub priority: Option<u8>,
    // Statically elected DR and BDR.
    pub dr: Option<Ipv4Addr>,
    pub bdr: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Link {
    // Probability of losing a packet.
    pub loss: f64,
    // Probability of delivering a packet twice.
    pub duplicate: f64,
    // Propagation delay, in milliseconds.
    pub delay: u64,
}

// ===== impl Config =====

impl Config {
    const DFLT_FILEPATH: &'static str = "ospf-adjsync-sim.toml";

    pub(crate) fn load(config_file: Option<&str>) -> Config {
        let config_file = config_file.unwrap_or(Config::DFLT_FILEPATH);

        match std::fs::read_to_string(config_file) {
            Ok(config_str) => toml::from_str(&config_str)
                .expect("Failed to parse configuration file"),
            Err(err) => {
                eprintln!("Failed to load configuration file: {err}");
                eprintln!("Falling back to default configuration...");
                Config::default()
            }
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            logging: Default::default(),
            time_scale: 1.0,
            duration: 60,
            routers: Default::default(),
            links: Default::default(),
        }
    }
}

// ===== impl Logging =====

impl Default for Logging {
    fn default() -> Logging {
        Logging {
            style: LoggingFmtStyle::Full,
            colors: false,
            show_thread_id: false,
            show_source: false,
        }
    }
}
