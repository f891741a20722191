// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Bridge instances and their interfaces: datagram socket setup, group
//! join/leave, and the activation flags shared with the data plane.
//!
//! The control-plane threads flip `inbound_active` / `outbound_active`
//! through [`BridgeInstance::activate_outbound`] and friends while the
//! data-plane thread reads them per packet; a single-writer /
//! eventually-visible-reader discipline with release/acquire atomics is
//! sufficient.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::logging::{Facility, Logger};
use crate::{log_notice, log_warning};

/// How an interface participates in a bridge instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceConfigType {
    /// Not configured for this direction
    #[default]
    None,
    /// Activated and deactivated by group membership
    Dynamic,
    /// Always active
    Static,
    /// Dynamic inbound promoted to always-active by a static outbound peer
    Forced,
}

impl InterfaceConfigType {
    pub const fn as_str(self) -> &'static str {
        match self {
            InterfaceConfigType::None => "none",
            InterfaceConfigType::Dynamic => "dynamic",
            InterfaceConfigType::Static => "static",
            InterfaceConfigType::Forced => "forced",
        }
    }
}

impl std::fmt::Display for InterfaceConfigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Addresses and identity of a physical interface, gathered from the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceFacts {
    pub name: String,
    pub if_index: u32,
    pub mac: [u8; 6],
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6_ll: Option<Ipv6Addr>,
}

fn is_unicast_link_local(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Enumerate the host's interfaces: kernel index, MAC, primary IPv4
/// address (excluding 169.254.0.0/16) and IPv6 link-local address.
pub fn gather_interface_facts() -> Vec<InterfaceFacts> {
    pnet::datalink::interfaces()
        .into_iter()
        .map(|iface| {
            let ipv4 = iface.ips.iter().find_map(|net| match net.ip() {
                IpAddr::V4(addr) if !addr.is_link_local() => Some(addr),
                _ => None,
            });
            let ipv6_ll = iface.ips.iter().find_map(|net| match net.ip() {
                IpAddr::V6(addr) if is_unicast_link_local(addr) => Some(addr),
                _ => None,
            });
            InterfaceFacts {
                name: iface.name,
                if_index: iface.index,
                mac: iface.mac.map(|m| m.octets()).unwrap_or_default(),
                ipv4,
                ipv6_ll,
            }
        })
        .collect()
}

/// The multicast group bridged by an instance; one instance per family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeGroup {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl BridgeGroup {
    pub const fn family_str(self) -> &'static str {
        match self {
            BridgeGroup::V4(_) => "IPv4",
            BridgeGroup::V6(_) => "IPv6",
        }
    }
}

impl std::fmt::Display for BridgeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeGroup::V4(addr) => write!(f, "{}", addr),
            BridgeGroup::V6(addr) => write!(f, "{}", addr),
        }
    }
}

/// One interface of a finalized bridge specification
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    pub facts: InterfaceFacts,
    pub inbound: InterfaceConfigType,
    pub outbound: InterfaceConfigType,
}

/// A finalized per-family bridge specification, produced by the
/// configuration layer
#[derive(Debug, Clone)]
pub struct BridgeSpec {
    pub group: BridgeGroup,
    pub port: u16,
    pub interfaces: Vec<InterfaceSpec>,
}

/// An interface bound into a bridge instance
pub struct BridgeInterface {
    pub name: String,
    pub if_index: u32,
    pub mac: [u8; 6],
    pub ipv4_addr: Ipv4Addr,
    pub ipv6_ll: Ipv6Addr,
    pub inbound_configuration: InterfaceConfigType,
    pub outbound_configuration: InterfaceConfigType,
    pub sock: UdpSocket,
    inbound_active: AtomicBool,
    outbound_active: AtomicBool,
}

impl BridgeInterface {
    #[inline]
    pub fn inbound_active(&self) -> bool {
        self.inbound_active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn outbound_active(&self) -> bool {
        self.outbound_active.load(Ordering::Acquire)
    }
}

/// An independent bridge instance: one UDP port and group address with a
/// set of participating interfaces. Owned by an Arc shared between the
/// data-plane thread and the control-plane subscriber handles.
pub struct BridgeInstance {
    pub group: BridgeGroup,
    pub port: u16,
    pub interfaces: Vec<BridgeInterface>,
    logger: Logger,
}

// Bind the bridge datagram socket for one interface: reusable, bound to
// the device and the bridge port, TTL/hops 1, multicast loopback off,
// non-blocking.
fn bind_socket(group: BridgeGroup, port: u16, spec: &InterfaceSpec) -> Result<UdpSocket> {
    let name = &spec.facts.name;
    let (domain, bind_addr): (Domain, SocketAddr) = match group {
        BridgeGroup::V4(_) => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, port).into()),
        BridgeGroup::V6(_) => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, port).into()),
    };

    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .with_context(|| format!("{} socket creation failed", group.family_str()))?;

    sock.set_reuse_address(true)
        .context("setsockopt(SO_REUSEADDR) failed")?;
    sock.set_reuse_port(true)
        .context("setsockopt(SO_REUSEPORT) failed")?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    sock.bind_device(Some(name.as_bytes()))
        .with_context(|| format!("setsockopt(SO_BINDTODEVICE) on {} failed", name))?;

    match group {
        BridgeGroup::V4(_) => {
            sock.set_multicast_ttl_v4(1)
                .with_context(|| format!("setsockopt(IP_MULTICAST_TTL) on {} failed", name))?;
            sock.set_multicast_if_v4(&spec.facts.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED))
                .with_context(|| format!("setsockopt(IP_MULTICAST_IF) on {} failed", name))?;
            sock.set_multicast_loop_v4(false)
                .with_context(|| format!("setsockopt(IP_MULTICAST_LOOP) on {} failed", name))?;
        }
        BridgeGroup::V6(_) => {
            sock.set_only_v6(true)
                .with_context(|| format!("setsockopt(IPV6_V6ONLY) on {} failed", name))?;
            sock.set_multicast_hops_v6(1)
                .with_context(|| format!("setsockopt(IPV6_MULTICAST_HOPS) on {} failed", name))?;
            sock.set_multicast_if_v6(spec.facts.if_index)
                .with_context(|| format!("setsockopt(IPV6_MULTICAST_IF) on {} failed", name))?;
            sock.set_multicast_loop_v6(false)
                .with_context(|| format!("setsockopt(IPV6_MULTICAST_LOOP) on {} failed", name))?;
        }
    }

    sock.bind(&bind_addr.into())
        .with_context(|| format!("{} bind on {} failed", group.family_str(), name))?;
    sock.set_nonblocking(true)
        .with_context(|| format!("set_nonblocking on {} failed", name))?;

    Ok(sock.into())
}

impl BridgeInstance {
    /// Bind the interface sockets and assemble the instance
    pub fn new(spec: &BridgeSpec, logger: Logger) -> Result<Arc<Self>> {
        let mut interfaces = Vec::with_capacity(spec.interfaces.len());
        for iface in &spec.interfaces {
            let sock = bind_socket(spec.group, spec.port, iface)?;
            interfaces.push(BridgeInterface {
                name: iface.facts.name.clone(),
                if_index: iface.facts.if_index,
                mac: iface.facts.mac,
                ipv4_addr: iface.facts.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
                ipv6_ll: iface.facts.ipv6_ll.unwrap_or(Ipv6Addr::UNSPECIFIED),
                inbound_configuration: iface.inbound,
                outbound_configuration: iface.outbound,
                sock,
                inbound_active: AtomicBool::new(false),
                outbound_active: AtomicBool::new(false),
            });
        }
        Ok(Arc::new(Self {
            group: spec.group,
            port: spec.port,
            interfaces,
            logger,
        }))
    }

    /// Activate interfaces that are not membership-driven: every
    /// non-dynamic inbound, and every non-dynamic outbound.
    pub fn activate_static(&self) {
        for slot in 0..self.interfaces.len() {
            if self.interfaces[slot].inbound_configuration != InterfaceConfigType::Dynamic {
                self.activate_inbound(slot);
            }
            if self.interfaces[slot].outbound_configuration != InterfaceConfigType::Dynamic {
                self.activate_outbound(slot);
            }
        }
    }

    fn join_group(&self, iface: &BridgeInterface) -> std::io::Result<()> {
        let sock = SockRef::from(&iface.sock);
        match self.group {
            BridgeGroup::V4(group) => sock.join_multicast_v4_n(
                &group,
                &socket2::InterfaceIndexOrAddress::Index(iface.if_index),
            ),
            BridgeGroup::V6(group) => sock.join_multicast_v6(&group, iface.if_index),
        }
    }

    fn leave_group(&self, iface: &BridgeInterface) -> std::io::Result<()> {
        let sock = SockRef::from(&iface.sock);
        match self.group {
            BridgeGroup::V4(group) => sock.leave_multicast_v4_n(
                &group,
                &socket2::InterfaceIndexOrAddress::Index(iface.if_index),
            ),
            BridgeGroup::V6(group) => sock.leave_multicast_v6(&group, iface.if_index),
        }
    }

    fn activate_inbound(&self, slot: usize) {
        let iface = &self.interfaces[slot];
        if iface.inbound_active() {
            return;
        }

        log_notice!(
            self.logger,
            Facility::Bridge,
            "Bridge({}/{}): Activating inbound interface {} ({})",
            self.group.family_str(),
            self.port,
            iface.name,
            iface.inbound_configuration
        );

        if let Err(e) = self.join_group(iface) {
            log_warning!(
                self.logger,
                Facility::Bridge,
                "Bridge({}/{}): group join on interface {} failed: {}",
                self.group.family_str(),
                self.port,
                iface.name,
                e
            );
        }

        iface.inbound_active.store(true, Ordering::Release);
    }

    fn deactivate_inbound(&self, slot: usize) {
        let iface = &self.interfaces[slot];
        if !iface.inbound_active() {
            return;
        }
        if iface.inbound_configuration != InterfaceConfigType::Dynamic {
            log_warning!(
                self.logger,
                Facility::Bridge,
                "Bridge({}/{}): Deactivating non-dynamic inbound interface {}",
                self.group.family_str(),
                self.port,
                iface.name
            );
            return;
        }

        log_notice!(
            self.logger,
            Facility::Bridge,
            "Bridge({}/{}): Deactivating inbound interface {}",
            self.group.family_str(),
            self.port,
            iface.name
        );

        if let Err(e) = self.leave_group(iface) {
            log_warning!(
                self.logger,
                Facility::Bridge,
                "Bridge({}/{}): group leave on interface {} failed: {}",
                self.group.family_str(),
                self.port,
                iface.name,
                e
            );
        }

        iface.inbound_active.store(false, Ordering::Release);
    }

    /// Activate an outbound interface and the inbound side of its
    /// dynamic peers. Idempotent.
    pub fn activate_outbound(&self, slot: usize) {
        let iface = &self.interfaces[slot];
        if iface.outbound_active() {
            return;
        }

        log_notice!(
            self.logger,
            Facility::Bridge,
            "Bridge({}/{}): Activating outbound interface {} ({})",
            self.group.family_str(),
            self.port,
            iface.name,
            iface.outbound_configuration
        );

        iface.outbound_active.store(true, Ordering::Release);

        for peer in 0..self.interfaces.len() {
            if peer == slot {
                continue;
            }
            if self.interfaces[peer].inbound_configuration == InterfaceConfigType::Dynamic {
                self.activate_inbound(peer);
            }
        }
    }

    /// Deactivate an outbound interface, and the inbound side of dynamic
    /// peers that no longer feed any active outbound. Idempotent.
    pub fn deactivate_outbound(&self, slot: usize) {
        let iface = &self.interfaces[slot];
        if !iface.outbound_active() {
            return;
        }
        if iface.outbound_configuration != InterfaceConfigType::Dynamic {
            log_warning!(
                self.logger,
                Facility::Bridge,
                "Bridge({}/{}): Deactivating non-dynamic outbound interface {}",
                self.group.family_str(),
                self.port,
                iface.name
            );
            return;
        }

        log_notice!(
            self.logger,
            Facility::Bridge,
            "Bridge({}/{}): Deactivating outbound interface {}",
            self.group.family_str(),
            self.port,
            iface.name
        );

        iface.outbound_active.store(false, Ordering::Release);

        for peer in 0..self.interfaces.len() {
            if peer == slot
                || self.interfaces[peer].inbound_configuration != InterfaceConfigType::Dynamic
            {
                continue;
            }
            let feeds_active_outbound = self
                .interfaces
                .iter()
                .enumerate()
                .any(|(other, candidate)| other != peer && candidate.outbound_active());
            if !feeds_active_outbound {
                self.deactivate_inbound(peer);
            }
        }
    }
}

/// Opaque handle by which the control plane toggles forwarding for a
/// subscribed data-plane interface. Safe to invoke from a control-plane
/// thread while the data plane reads the same interface's flags.
pub trait OutboundPort: Send + Sync {
    fn activate(&self);
    fn deactivate(&self);
}

pub type OutboundHandle = Arc<dyn OutboundPort>;

/// Production outbound handle pointing at one interface of a bridge
pub struct BridgeOutbound {
    pub bridge: Arc<BridgeInstance>,
    pub if_slot: usize,
}

impl OutboundPort for BridgeOutbound {
    fn activate(&self) {
        self.bridge.activate_outbound(self.if_slot);
    }

    fn deactivate(&self) {
        self.bridge.deactivate_outbound(self.if_slot);
    }
}
