// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing.
//!
//! JSON5 configuration (comments and trailing commas allowed), one entry
//! per bridge:
//!
//! ```json5
//! {
//!   bridges: [
//!     {
//!       port: 7500,
//!       ipv4_group: "239.0.75.0",
//!       ipv6_group: "ff05::7500",
//!       inbound: ["eth0"],           // activated by group membership
//!       outbound: ["eth1"],
//!       static_inbound: [],          // always active
//!       static_outbound: [],
//!     },
//!   ],
//! }
//! ```
//!
//! A bridge with both group addresses finalizes into two instances, one
//! per address family. Interfaces lacking the family's address are
//! skipped for that family.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::interface::{
    BridgeGroup, BridgeSpec, InterfaceConfigType, InterfaceFacts, InterfaceSpec,
};

/// Startup configuration (JSON5 file format)
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
}

/// One bridge entry as stored in the config file
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// UDP destination port identifying the bridge
    pub port: u16,

    /// IPv4 multicast group address
    #[serde(default)]
    pub ipv4_group: Option<Ipv4Addr>,

    /// IPv6 multicast group address
    #[serde(default)]
    pub ipv6_group: Option<Ipv6Addr>,

    /// Membership-driven inbound interfaces
    #[serde(default)]
    pub inbound: Vec<String>,

    /// Membership-driven outbound interfaces
    #[serde(default)]
    pub outbound: Vec<String>,

    /// Always-active inbound interfaces
    #[serde(default)]
    pub static_inbound: Vec<String>,

    /// Always-active outbound interfaces
    #[serde(default)]
    pub static_outbound: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {0}: {1}")]
    Io(PathBuf, String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("no port bridges defined")]
    NoBridges,
    #[error("bridge with invalid port number 0")]
    InvalidPort,
    #[error("bridge {port} defined more than once")]
    DuplicatePort { port: u16 },
    #[error("bridge {port} does not have a multicast group address")]
    MissingGroup { port: u16 },
    #[error("bridge {port}: \"{addr}\" is not a multicast group address")]
    NotMulticast { port: u16, addr: String },
    #[error("bridge {port}: multicast group address \"{addr}\" is link local and cannot be bridged")]
    LinkScopeGroup { port: u16, addr: String },
    #[error("bridge {port} does not have any inbound interfaces")]
    NoInbound { port: u16 },
    #[error("bridge {port} does not have any outbound interfaces")]
    NoOutbound { port: u16 },
    #[error("bridge {port} has a single {direction} interface ({name}) which is also declared in the other direction")]
    SingleInterface {
        port: u16,
        direction: &'static str,
        name: String,
    },
    #[error("bridge {port} has an {family} multicast group address, but does not have an {family} enabled {direction} interface")]
    NoFamilyInterface {
        port: u16,
        family: &'static str,
        direction: &'static str,
    },
    #[error("bridge {port} has an {family} multicast group address, but has only one {family} enabled interface ({name})")]
    SingleFamilyInterface {
        port: u16,
        family: &'static str,
        name: String,
    },
    #[error("interface \"{name}\" does not exist")]
    UnknownInterface { name: String },
    #[error("interface \"{name}\" does not have an IP address")]
    NoAddress { name: String },
}

// Per-interface directional configuration accumulated from the four
// interface lists
struct DraftInterface {
    facts: InterfaceFacts,
    inbound: InterfaceConfigType,
    outbound: InterfaceConfigType,
}

fn is_ipv4_link_scope(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 224 && octets[1] == 0 && octets[2] == 0
}

fn is_ipv6_link_scope(addr: Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0xff && octets[1] == 0x02
}

impl Config {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the configuration against the host's interfaces and
    /// finalize it into per-family bridge specifications.
    pub fn build_bridges(
        &self,
        facts: &[InterfaceFacts],
    ) -> Result<Vec<BridgeSpec>, ConfigError> {
        let mut specs = Vec::new();
        let mut seen_ports: HashSet<u16> = HashSet::new();

        for bridge in &self.bridges {
            if bridge.port == 0 {
                return Err(ConfigError::InvalidPort);
            }
            if !seen_ports.insert(bridge.port) {
                return Err(ConfigError::DuplicatePort { port: bridge.port });
            }

            if bridge.ipv4_group.is_none() && bridge.ipv6_group.is_none() {
                return Err(ConfigError::MissingGroup { port: bridge.port });
            }
            if let Some(group) = bridge.ipv4_group {
                if !group.is_multicast() {
                    return Err(ConfigError::NotMulticast {
                        port: bridge.port,
                        addr: group.to_string(),
                    });
                }
                if is_ipv4_link_scope(group) {
                    return Err(ConfigError::LinkScopeGroup {
                        port: bridge.port,
                        addr: group.to_string(),
                    });
                }
            }
            if let Some(group) = bridge.ipv6_group {
                if !group.is_multicast() {
                    return Err(ConfigError::NotMulticast {
                        port: bridge.port,
                        addr: group.to_string(),
                    });
                }
                if is_ipv6_link_scope(group) {
                    return Err(ConfigError::LinkScopeGroup {
                        port: bridge.port,
                        addr: group.to_string(),
                    });
                }
            }

            let drafts = assemble_drafts(bridge, facts)?;
            validate_drafts(bridge, &drafts)?;

            if let Some(group) = bridge.ipv4_group {
                specs.push(family_spec(
                    BridgeGroup::V4(group),
                    bridge.port,
                    &drafts,
                    |d| d.facts.ipv4.is_some(),
                ));
            }
            if let Some(group) = bridge.ipv6_group {
                specs.push(family_spec(
                    BridgeGroup::V6(group),
                    bridge.port,
                    &drafts,
                    |d| d.facts.ipv6_ll.is_some(),
                ));
            }
        }

        if specs.is_empty() {
            return Err(ConfigError::NoBridges);
        }
        Ok(specs)
    }
}

fn assemble_drafts(
    bridge: &BridgeConfig,
    facts: &[InterfaceFacts],
) -> Result<Vec<DraftInterface>, ConfigError> {
    let mut drafts: Vec<DraftInterface> = Vec::new();

    let mut add = |name: &String| -> Result<usize, ConfigError> {
        if let Some(index) = drafts.iter().position(|d| d.facts.name == *name) {
            return Ok(index);
        }
        let found = facts
            .iter()
            .find(|f| f.name == *name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownInterface { name: name.clone() })?;
        if found.ipv4.is_none() && found.ipv6_ll.is_none() {
            return Err(ConfigError::NoAddress { name: name.clone() });
        }
        drafts.push(DraftInterface {
            facts: found,
            inbound: InterfaceConfigType::None,
            outbound: InterfaceConfigType::None,
        });
        Ok(drafts.len() - 1)
    };

    // Static declarations take precedence over dynamic ones
    let mut indices: Vec<(usize, bool, InterfaceConfigType)> = Vec::new();
    for name in &bridge.inbound {
        indices.push((add(name)?, true, InterfaceConfigType::Dynamic));
    }
    for name in &bridge.outbound {
        indices.push((add(name)?, false, InterfaceConfigType::Dynamic));
    }
    for name in &bridge.static_inbound {
        indices.push((add(name)?, true, InterfaceConfigType::Static));
    }
    for name in &bridge.static_outbound {
        indices.push((add(name)?, false, InterfaceConfigType::Static));
    }

    for (index, inbound, config) in indices {
        let slot = if inbound {
            &mut drafts[index].inbound
        } else {
            &mut drafts[index].outbound
        };
        if config == InterfaceConfigType::Static || *slot != InterfaceConfigType::Static {
            *slot = config;
        }
    }

    Ok(drafts)
}

fn validate_drafts(bridge: &BridgeConfig, drafts: &[DraftInterface]) -> Result<(), ConfigError> {
    let inbound: Vec<&DraftInterface> = drafts
        .iter()
        .filter(|d| d.inbound != InterfaceConfigType::None)
        .collect();
    let outbound: Vec<&DraftInterface> = drafts
        .iter()
        .filter(|d| d.outbound != InterfaceConfigType::None)
        .collect();

    if inbound.is_empty() {
        return Err(ConfigError::NoInbound { port: bridge.port });
    }
    if outbound.is_empty() {
        return Err(ConfigError::NoOutbound { port: bridge.port });
    }

    // A single interface cannot serve both directions
    if inbound.len() == 1 && inbound[0].outbound != InterfaceConfigType::None {
        return Err(ConfigError::SingleInterface {
            port: bridge.port,
            direction: "inbound",
            name: inbound[0].facts.name.clone(),
        });
    }
    if outbound.len() == 1 && outbound[0].inbound != InterfaceConfigType::None {
        return Err(ConfigError::SingleInterface {
            port: bridge.port,
            direction: "outbound",
            name: outbound[0].facts.name.clone(),
        });
    }

    // Per family, at least one distinct inbound and outbound interface
    // must carry the family's address
    let mut family_checks: Vec<(&'static str, Box<dyn Fn(&DraftInterface) -> bool>)> = Vec::new();
    if bridge.ipv4_group.is_some() {
        family_checks.push(("IPv4", Box::new(|d: &DraftInterface| d.facts.ipv4.is_some())));
    }
    if bridge.ipv6_group.is_some() {
        family_checks.push((
            "IPv6",
            Box::new(|d: &DraftInterface| d.facts.ipv6_ll.is_some()),
        ));
    }

    for (family, has_addr) in family_checks {
        let family_inbound: Vec<_> = inbound.iter().filter(|d| has_addr(d)).collect();
        let family_outbound: Vec<_> = outbound.iter().filter(|d| has_addr(d)).collect();

        if family_inbound.is_empty() {
            return Err(ConfigError::NoFamilyInterface {
                port: bridge.port,
                family,
                direction: "inbound",
            });
        }
        if family_outbound.is_empty() {
            return Err(ConfigError::NoFamilyInterface {
                port: bridge.port,
                family,
                direction: "outbound",
            });
        }
        if family_inbound.len() == 1
            && family_outbound.len() == 1
            && family_inbound[0].facts.if_index == family_outbound[0].facts.if_index
        {
            return Err(ConfigError::SingleFamilyInterface {
                port: bridge.port,
                family,
                name: family_inbound[0].facts.name.clone(),
            });
        }
    }

    Ok(())
}

fn family_spec(
    group: BridgeGroup,
    port: u16,
    drafts: &[DraftInterface],
    has_addr: impl Fn(&DraftInterface) -> bool,
) -> BridgeSpec {
    let mut interfaces: Vec<InterfaceSpec> = drafts
        .iter()
        .filter(|d| has_addr(d))
        .map(|d| InterfaceSpec {
            facts: d.facts.clone(),
            inbound: d.inbound,
            outbound: d.outbound,
        })
        .collect();

    // A static outbound interface forces its dynamic inbound peers to
    // stay active
    let has_static_outbound = interfaces
        .iter()
        .any(|i| i.outbound == InterfaceConfigType::Static);
    if has_static_outbound {
        for iface in &mut interfaces {
            if iface.inbound == InterfaceConfigType::Dynamic {
                iface.inbound = InterfaceConfigType::Forced;
            }
        }
    }

    BridgeSpec {
        group,
        port,
        interfaces,
    }
}

/// Print the finalized bridge configuration (foreground startup)
pub fn dump_bridges(specs: &[BridgeSpec]) {
    println!("Bridges:");
    for spec in specs {
        println!("  Bridge: {}/{}", spec.group.family_str(), spec.port);
        println!("    group: {}", spec.group);
        println!("    interfaces:");
        for iface in &spec.interfaces {
            println!(
                "      {}: inbound {}, outbound {}",
                iface.facts.name, iface.inbound, iface.outbound
            );
        }
    }
}
