// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMP control-plane subsystem.
//!
//! The implementation is primarily based on RFC 2236 and RFC 9776, and
//! deviates from the standards in the following aspects:
//!
//! 1. All link-local scope multicast addresses (224.0.0.0/24) are ignored.
//! 2. IGMPv3 is honored at the IP group level only; source specific
//!    address information is ignored. This is similar to switches with the
//!    forwarding method set to "IP Group Address" instead of "Source
//!    Specific IP Group Address".
//! 3. Multiple querier modes are offered: Never, Quick (RFC behavior),
//!    Delay, and Defer.
//! 4. A few milliseconds of grace time is allowed on protocol timeouts for
//!    network round trip and host processing time.
//!
//! Multicast Router Discovery follows RFC 4286, except that the first
//! advertisement is sent without the random startup delay, and termination
//! messages are never sent.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::capture::{LinkPort, PcapPort};
use crate::event::{Event, EventLoop, TimerOps};
use crate::interface::{InterfaceFacts, OutboundHandle};
use crate::logging::{Facility, Logger};
use crate::protocols::igmp::{
    build_general_query, build_group_query_template, build_mrd_advertisement, parse_frame,
    patch_group_query, IgmpPacket, ParseOutcome, QueryInfo, IGMP_LASTMBR_INTERVAL_TENTHS,
    IGMP_QUERY_INTERVAL_SECS, IGMP_RESPONSE_INTERVAL_TENTHS, IGMP_ROBUSTNESS,
    MRD_ADVERT_FRAME_LEN, QUERIER_UNKNOWN, QUERY_FRAME_LEN,
};
use crate::protocols::{
    timecode_8bit_decode, GRACE_MILLIS, MRD_INITIAL_COUNT, MRD_INITIAL_INTERVAL_SECS,
    MRD_INTERVAL_JITTER_MS, MRD_INTERVAL_SECS, REC_ALLOW_NEW_SOURCES, REC_BLOCK_OLD_SOURCES,
    REC_CHANGE_TO_EXCLUDE, REC_CHANGE_TO_INCLUDE, REC_MODE_IS_EXCLUDE, REC_MODE_IS_INCLUDE,
};
use crate::{log_debug, log_info, log_warning, QuerierMode, MCAST_MAX_PACKET_SIZE};

// Pcap IGMP filter
//
//   Expected packet format:
//     Ethernet header
//     IPv4 header
//     Router Alert option
//     IGMP header
const IGMP_FILTER: &str = "igmp";

/// Timer identity within the IGMP subsystem. At most one timer per token
/// is ever outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgmpTimer {
    MrdAdvertisement { if_slot: usize },
    GeneralQuery { if_slot: usize },
    QuerierTimeout { if_slot: usize },
    GroupTimeout { if_slot: usize, group_slot: usize },
    GroupQuery { if_slot: usize, group_slot: usize },
    V1HostTimeout { if_slot: usize, group_slot: usize },
}

struct IgmpGroup {
    mcast_addr: Ipv4Addr,
    active: bool,
    v1_host_present: bool,
    group_queries_remaining: u32,
    // Data-plane interfaces toggled when this group transitions
    subscribers: Vec<OutboundHandle>,
}

impl IgmpGroup {
    fn new(mcast_addr: Ipv4Addr) -> Self {
        Self {
            mcast_addr,
            active: false,
            v1_host_present: false,
            group_queries_remaining: 0,
            subscribers: Vec::new(),
        }
    }
}

struct IgmpInterface {
    name: String,
    if_index: u32,
    if_addr: Ipv4Addr,
    if_mac: [u8; 6],

    port: Option<Box<dyn LinkPort>>,

    // Fixed prefix of registered groups, dynamic suffix of learned ones
    groups: Vec<IgmpGroup>,
    fixed_limit: usize,
    group_limit: usize,

    // Current querier variables
    querier_addr: Ipv4Addr,
    querier_robustness: u32,
    querier_interval_secs: u32,
    querier_response_tenths: u32,
    querier_lastmbr_tenths: u32,

    mrd_initial_remaining: u32,
    startup_queries_remaining: u32,

    // Prebuilt packet templates
    mrd_advertisement_frame: [u8; MRD_ADVERT_FRAME_LEN],
    general_query_frame: [u8; QUERY_FRAME_LEN],
    specific_query_frame: [u8; QUERY_FRAME_LEN],
}

// Inject a frame, logging and proceeding on failure. Free function so
// callers can hold disjoint borrows of the owning interface.
fn send_frame(port: &mut Option<Box<dyn LinkPort>>, logger: &Logger, name: &str, frame: &[u8]) {
    if let Some(port) = port.as_mut() {
        if let Err(e) = port.inject(frame) {
            log_warning!(logger, Facility::Igmp, "IGMP({}): {:#}", name, e);
        }
    }
}

// Find a group in the table, or insert one in the dynamic suffix.
// Link-scope groups are never tracked. The caller sets the active flag.
fn find_or_insert_group(
    iface: &mut IgmpInterface,
    mcast_addr: Ipv4Addr,
    logger: &Logger,
) -> Option<usize> {
    // Ignore local scope multicast addresses (224.0.0.0/24)
    let octets = mcast_addr.octets();
    if octets[0] == 224 && octets[1] == 0 && octets[2] == 0 {
        return None;
    }

    // Look for the group in the fixed prefix
    for slot in 0..iface.fixed_limit {
        if iface.groups[slot].mcast_addr == mcast_addr {
            return Some(slot);
        }
    }

    // Look for the group in the dynamic suffix, noting the first
    // reusable slot
    let mut first_empty = None;
    for slot in iface.fixed_limit..iface.groups.len() {
        let group = &iface.groups[slot];
        if group.active {
            if group.mcast_addr == mcast_addr {
                return Some(slot);
            }
        } else if first_empty.is_none() {
            first_empty = Some(slot);
        }
    }

    let slot = match first_empty {
        Some(slot) => slot,
        None => {
            if iface.groups.len() >= iface.group_limit {
                log_info!(
                    logger,
                    Facility::Igmp,
                    "IGMP({}) [{}]: Group list full -- group ignored",
                    iface.name,
                    mcast_addr
                );
                return None;
            }
            iface.groups.push(IgmpGroup::new(mcast_addr));
            iface.groups.len() - 1
        }
    };

    let group = &mut iface.groups[slot];
    group.mcast_addr = mcast_addr;
    group.v1_host_present = false;
    group.group_queries_remaining = 0;
    Some(slot)
}

/// The IGMP control plane: one instance owns every monitored interface
/// and runs on its own thread.
pub struct IgmpSubsystem {
    interfaces: Vec<IgmpInterface>,
    mode: QuerierMode,
    non_configured_groups: usize,
    rng: StdRng,
    logger: Logger,
}

impl IgmpSubsystem {
    pub fn new(mode: QuerierMode, non_configured_groups: usize, logger: Logger) -> Self {
        Self {
            interfaces: Vec::new(),
            mode,
            non_configured_groups,
            rng: StdRng::from_entropy(),
            logger,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Register a dynamic outbound interest: ensure an interface record
    /// and a fixed-prefix group record exist, and subscribe the handle to
    /// the group's transitions. Invoked at initialization only, before
    /// the subsystem thread starts.
    pub fn register_group(
        &mut self,
        facts: &InterfaceFacts,
        mcast_addr: Ipv4Addr,
        handle: OutboundHandle,
    ) {
        let if_slot = match self
            .interfaces
            .iter()
            .position(|iface| iface.if_index == facts.if_index)
        {
            Some(slot) => slot,
            None => {
                self.interfaces.push(IgmpInterface {
                    name: facts.name.clone(),
                    if_index: facts.if_index,
                    if_addr: facts.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    if_mac: facts.mac,
                    port: None,
                    groups: Vec::new(),
                    fixed_limit: 0,
                    group_limit: 0,
                    querier_addr: QUERIER_UNKNOWN,
                    querier_robustness: IGMP_ROBUSTNESS,
                    querier_interval_secs: IGMP_QUERY_INTERVAL_SECS,
                    querier_response_tenths: IGMP_RESPONSE_INTERVAL_TENTHS,
                    querier_lastmbr_tenths: IGMP_LASTMBR_INTERVAL_TENTHS,
                    mrd_initial_remaining: 0,
                    startup_queries_remaining: 0,
                    mrd_advertisement_frame: [0; MRD_ADVERT_FRAME_LEN],
                    general_query_frame: [0; QUERY_FRAME_LEN],
                    specific_query_frame: [0; QUERY_FRAME_LEN],
                });
                self.interfaces.len() - 1
            }
        };

        let iface = &mut self.interfaces[if_slot];
        let group_slot = match iface
            .groups
            .iter()
            .position(|group| group.mcast_addr == mcast_addr)
        {
            Some(slot) => slot,
            None => {
                iface.groups.push(IgmpGroup::new(mcast_addr));
                iface.groups.len() - 1
            }
        };
        iface.groups[group_slot].subscribers.push(handle);
    }

    /// Finalize the group tables: freeze the fixed prefix and size the
    /// dynamic suffix. Must run after the last `register_group`.
    pub fn finalize(&mut self, dump_config: bool) {
        for iface in &mut self.interfaces {
            iface.fixed_limit = iface.groups.len();
            iface.group_limit = iface.groups.len() + self.non_configured_groups;
            iface.groups.reserve_exact(self.non_configured_groups);
        }
        if dump_config {
            self.dump_config();
        }
    }

    fn dump_config(&self) {
        println!("IGMP:");
        println!("  Querier Mode: {}", self.mode);
        for iface in &self.interfaces {
            println!("  Interface: {}", iface.name);
            println!("    if index: {}", iface.if_index);
            println!(
                "    hw-addr: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                iface.if_mac[0],
                iface.if_mac[1],
                iface.if_mac[2],
                iface.if_mac[3],
                iface.if_mac[4],
                iface.if_mac[5]
            );
            println!("    address: {}", iface.if_addr);
            println!("    groups:");
            for group in &iface.groups {
                println!("      {}", group.mcast_addr);
            }
        }
    }

    /// Open the capture handles. Separate from [`finalize`] so tests can
    /// substitute in-memory ports.
    pub fn open_ports(&mut self) -> Result<()> {
        for iface in &mut self.interfaces {
            let port = PcapPort::open(&iface.name, IGMP_FILTER, self.logger.clone(), Facility::Igmp)
                .with_context(|| format!("IGMP capture on {} failed", iface.name))?;
            iface.port = Some(Box::new(port));
        }
        Ok(())
    }

    /// Replace (or set) the link port of an interface
    pub fn set_port(&mut self, if_slot: usize, port: Box<dyn LinkPort>) {
        self.interfaces[if_slot].port = Some(port);
    }

    /// Timer table bound: a loose upper limit on concurrently
    /// outstanding timers
    pub fn timer_capacity(&self) -> usize {
        let group_capacity: usize = self.interfaces.iter().map(|i| i.group_limit).sum();
        self.interfaces.len() * 2 + group_capacity * 2
    }

    /// Interface slot by name, for tests and diagnostics
    pub fn interface_slot(&self, name: &str) -> Option<usize> {
        self.interfaces.iter().position(|iface| iface.name == name)
    }

    pub fn querier_addr(&self, if_slot: usize) -> Ipv4Addr {
        self.interfaces[if_slot].querier_addr
    }

    pub fn robustness(&self, if_slot: usize) -> u32 {
        self.interfaces[if_slot].querier_robustness
    }

    pub fn group_active(&self, if_slot: usize, mcast_addr: Ipv4Addr) -> bool {
        self.interfaces[if_slot]
            .groups
            .iter()
            .any(|g| g.mcast_addr == mcast_addr && g.active)
    }

    pub fn dynamic_group_count(&self, if_slot: usize) -> usize {
        let iface = &self.interfaces[if_slot];
        iface.groups.len() - iface.fixed_limit
    }

    pub fn v1_host_present(&self, if_slot: usize, mcast_addr: Ipv4Addr) -> bool {
        self.interfaces[if_slot]
            .groups
            .iter()
            .any(|g| g.mcast_addr == mcast_addr && g.v1_host_present)
    }

    /// Build the packet templates and start the protocol engines:
    /// the initial MRD advertisement burst and the querier startup
    /// appropriate to the configured mode.
    pub fn start(&mut self, ops: &mut TimerOps<IgmpTimer>) {
        for if_slot in 0..self.interfaces.len() {
            {
                let iface = &mut self.interfaces[if_slot];
                iface.mrd_advertisement_frame =
                    build_mrd_advertisement(iface.if_mac, iface.if_addr);
                iface.general_query_frame = build_general_query(iface.if_mac, iface.if_addr);
                iface.specific_query_frame =
                    build_group_query_template(iface.if_mac, iface.if_addr);

                // The first advertisement is sent without jitter
                iface.mrd_initial_remaining = MRD_INITIAL_COUNT - 1;
            }
            self.send_mrd_advertisement(if_slot, ops);

            if self.mode == QuerierMode::Quick {
                self.activate_querier_mode(if_slot, ops);
            } else {
                let iface = &mut self.interfaces[if_slot];
                iface.querier_robustness = IGMP_ROBUSTNESS;
                iface.querier_interval_secs = IGMP_QUERY_INTERVAL_SECS;
                iface.querier_response_tenths = IGMP_RESPONSE_INTERVAL_TENTHS;
                iface.querier_lastmbr_tenths = IGMP_LASTMBR_INTERVAL_TENTHS;

                // All ones allows anyone to win an election
                iface.querier_addr = QUERIER_UNKNOWN;

                if self.mode != QuerierMode::Never {
                    // Self-elect if no querier appears (125.5 seconds)
                    ops.add(125_500, IgmpTimer::QuerierTimeout { if_slot });
                }
            }
        }
    }

    fn log_issue(&self, if_slot: usize, addr: Option<Ipv4Addr>, msg: &str) {
        let iface = &self.interfaces[if_slot];
        let addr_str = addr.map(|a| a.to_string()).unwrap_or_default();
        log_info!(
            self.logger,
            Facility::Igmp,
            "IGMP({}) [{}]: {}",
            iface.name,
            addr_str,
            msg
        );
    }

    fn log_traffic(&self, if_slot: usize, addr: Ipv4Addr, msg: &str) {
        if self.logger.debug_level() >= 3 {
            let iface = &self.interfaces[if_slot];
            log_debug!(
                self.logger,
                Facility::Igmp,
                "IGMP({}) [{}]: {}",
                iface.name,
                addr,
                msg
            );
        }
    }

    /// Copy the next pending frame from an interface's capture handle
    pub fn read_frame(&mut self, if_slot: usize, buf: &mut [u8]) -> Option<usize> {
        self.interfaces
            .get_mut(if_slot)?
            .port
            .as_mut()?
            .capture_next(buf)
    }

    /// Process one captured frame
    pub fn handle_frame(&mut self, if_slot: usize, frame: &[u8], ops: &mut TimerOps<IgmpTimer>) {
        let own_addr = self.interfaces[if_slot].if_addr;
        match parse_frame(frame, own_addr) {
            ParseOutcome::Own => {}
            ParseOutcome::Invalid { src, error } => {
                self.log_issue(if_slot, src, &error.to_string())
            }
            ParseOutcome::Packet { src, packet } => match packet {
                IgmpPacket::Query(info) => self.handle_query(if_slot, src, info, ops),
                IgmpPacket::V1Report { group } => self.handle_v1_report(if_slot, src, group, ops),
                IgmpPacket::V2Report { group } => self.handle_v2_report(if_slot, src, group, ops),
                IgmpPacket::V2Leave { group } => self.handle_v2_leave(if_slot, src, group, ops),
                IgmpPacket::V3Report(records) => {
                    self.handle_v3_report(if_slot, src, records, ops)
                }
                IgmpPacket::MrdSolicitation => self.handle_mrd_solicitation(if_slot, src, ops),
                IgmpPacket::Ignored => {}
            },
        }
    }

    /// Dispatch an expired timer
    pub fn handle_timer(&mut self, token: IgmpTimer, ops: &mut TimerOps<IgmpTimer>) {
        match token {
            IgmpTimer::MrdAdvertisement { if_slot } => self.send_mrd_advertisement(if_slot, ops),
            IgmpTimer::GeneralQuery { if_slot } => self.send_general_query(if_slot, ops),
            IgmpTimer::QuerierTimeout { if_slot } => self.querier_timeout(if_slot, ops),
            IgmpTimer::GroupTimeout { if_slot, group_slot } => {
                self.group_timeout(if_slot, group_slot)
            }
            IgmpTimer::GroupQuery { if_slot, group_slot } => {
                self.send_group_specific_query(if_slot, group_slot, ops)
            }
            IgmpTimer::V1HostTimeout { if_slot, group_slot } => {
                self.v1_host_timeout(if_slot, group_slot)
            }
        }
    }

    fn send_mrd_advertisement(&mut self, if_slot: usize, ops: &mut TimerOps<IgmpTimer>) {
        self.log_traffic(
            if_slot,
            self.interfaces[if_slot].if_addr,
            "sending Multicast Router Discovery advertisement",
        );

        let iface = &mut self.interfaces[if_slot];
        send_frame(
            &mut iface.port,
            &self.logger,
            &iface.name,
            &iface.mrd_advertisement_frame,
        );

        let millis = if iface.mrd_initial_remaining > 0 {
            iface.mrd_initial_remaining -= 1;
            self.rng.gen_range(0..MRD_INITIAL_INTERVAL_SECS * 1000)
        } else {
            let nominal = MRD_INTERVAL_SECS as u64 * 1000;
            self.rng
                .gen_range(nominal - MRD_INTERVAL_JITTER_MS..nominal + MRD_INTERVAL_JITTER_MS)
        };
        ops.add(millis, IgmpTimer::MrdAdvertisement { if_slot });
    }

    fn send_general_query(&mut self, if_slot: usize, ops: &mut TimerOps<IgmpTimer>) {
        self.log_traffic(
            if_slot,
            self.interfaces[if_slot].if_addr,
            "sending general query",
        );

        let iface = &mut self.interfaces[if_slot];
        send_frame(
            &mut iface.port,
            &self.logger,
            &iface.name,
            &iface.general_query_frame,
        );

        let mut millis = iface.querier_interval_secs as u64 * 1000;
        if iface.startup_queries_remaining > 0 {
            iface.startup_queries_remaining -= 1;
            millis /= 4;
        }
        ops.add(millis, IgmpTimer::GeneralQuery { if_slot });
    }

    fn send_group_specific_query(
        &mut self,
        if_slot: usize,
        group_slot: usize,
        ops: &mut TimerOps<IgmpTimer>,
    ) {
        let iface = &mut self.interfaces[if_slot];
        let Some(group) = iface.groups.get(group_slot) else {
            return;
        };
        if group.group_queries_remaining == 0 {
            return;
        }
        let mcast_addr = group.mcast_addr;

        // The first query of a burst has the S flag clear; the counter is
        // decremented only after emission, so this comparison is correct
        // for the whole series
        let s_flag = group.group_queries_remaining != iface.querier_robustness;

        if self.logger.debug_level() >= 3 {
            log_debug!(
                self.logger,
                Facility::Igmp,
                "IGMP({}) [{}]: sending query [group {}]",
                iface.name,
                iface.if_addr,
                mcast_addr
            );
        }

        patch_group_query(&mut iface.specific_query_frame, mcast_addr, s_flag);
        send_frame(
            &mut iface.port,
            &self.logger,
            &iface.name,
            &iface.specific_query_frame,
        );

        iface.groups[group_slot].group_queries_remaining -= 1;
        if iface.groups[group_slot].group_queries_remaining > 0 {
            ops.add(
                iface.querier_lastmbr_tenths as u64 * 100,
                IgmpTimer::GroupQuery { if_slot, group_slot },
            );
        }
    }

    fn activate_querier_mode(&mut self, if_slot: usize, ops: &mut TimerOps<IgmpTimer>) {
        self.log_issue(
            if_slot,
            Some(self.interfaces[if_slot].if_addr),
            "Querier mode activated",
        );

        let iface = &mut self.interfaces[if_slot];
        iface.querier_robustness = IGMP_ROBUSTNESS;
        iface.querier_interval_secs = IGMP_QUERY_INTERVAL_SECS;
        iface.querier_response_tenths = IGMP_RESPONSE_INTERVAL_TENTHS;
        iface.querier_lastmbr_tenths = IGMP_LASTMBR_INTERVAL_TENTHS;

        iface.querier_addr = iface.if_addr;

        iface.startup_queries_remaining = iface.querier_robustness - 1;
        self.send_general_query(if_slot, ops);
    }

    fn querier_timeout(&mut self, if_slot: usize, ops: &mut TimerOps<IgmpTimer>) {
        self.log_issue(
            if_slot,
            Some(self.interfaces[if_slot].querier_addr),
            "Querier timeout",
        );

        if self.mode != QuerierMode::Never {
            self.activate_querier_mode(if_slot, ops);
        } else {
            self.log_issue(
                if_slot,
                Some(self.interfaces[if_slot].if_addr),
                "Querier mode disabled",
            );
            self.interfaces[if_slot].querier_addr = QUERIER_UNKNOWN;
        }
    }

    fn group_timeout(&mut self, if_slot: usize, group_slot: usize) {
        let iface = &mut self.interfaces[if_slot];
        let Some(group) = iface.groups.get_mut(group_slot) else {
            return;
        };
        let mcast_addr = group.mcast_addr;

        group.active = false;

        // Is this one of the registered groups?
        if !group.subscribers.is_empty() {
            for handle in &group.subscribers {
                handle.deactivate();
            }
        } else {
            // Tighten the dynamic suffix
            while iface.groups.len() > iface.fixed_limit
                && iface.groups.last().is_some_and(|g| !g.active)
            {
                iface.groups.pop();
            }
        }

        self.log_issue(if_slot, Some(mcast_addr), "Group membership timeout");
    }

    fn v1_host_timeout(&mut self, if_slot: usize, group_slot: usize) {
        if self.logger.debug_level() >= 3 {
            log_debug!(
                self.logger,
                Facility::Igmp,
                "IGMP({}) []: v1 host present timeout",
                self.interfaces[if_slot].name
            );
        }
        if let Some(group) = self.interfaces[if_slot].groups.get_mut(group_slot) {
            group.v1_host_present = false;
        }
    }

    fn handle_mrd_solicitation(
        &mut self,
        if_slot: usize,
        src: Ipv4Addr,
        ops: &mut TimerOps<IgmpTimer>,
    ) {
        self.log_traffic(if_slot, src, "received Multicast Router Solicitation");

        ops.del(IgmpTimer::MrdAdvertisement { if_slot });
        self.send_mrd_advertisement(if_slot, ops);
    }

    fn handle_query(
        &mut self,
        if_slot: usize,
        src: Ipv4Addr,
        info: QueryInfo,
        ops: &mut TimerOps<IgmpTimer>,
    ) {
        if self.logger.debug_level() >= 3 {
            let version = if info.v3.is_some() { "v3" } else { "v2" };
            let iface = &self.interfaces[if_slot];
            log_debug!(
                self.logger,
                Facility::Igmp,
                "IGMP({}) [{}]: received {} query [group {}]",
                iface.name,
                src,
                version,
                info.group
            );
        }

        let mode = self.mode;
        let mut elected = false;
        {
            let iface = &mut self.interfaces[if_slot];

            // Is the query from someone other than the current querier?
            if src != iface.querier_addr {
                let mut new_querier = false;

                // Am I the current querier?
                if iface.querier_addr == iface.if_addr {
                    // Yield to a lower address, or to anyone in Defer mode
                    if src < iface.if_addr || mode == QuerierMode::Defer {
                        new_querier = true;
                        ops.del(IgmpTimer::GeneralQuery { if_slot });
                    } else {
                        // We continue as the querier
                        return;
                    }
                } else if src < iface.querier_addr {
                    // The classic lowest-address election
                    new_querier = true;
                }

                if new_querier {
                    iface.querier_addr = src;

                    // A v1/v2 query carries no parameters; assume defaults
                    if info.v3.is_none() {
                        iface.querier_robustness = IGMP_ROBUSTNESS;
                        iface.querier_interval_secs = IGMP_QUERY_INTERVAL_SECS;
                        iface.querier_response_tenths = IGMP_RESPONSE_INTERVAL_TENTHS;
                    }
                    elected = true;
                }
            }

            // Adopt the observed querier's parameters
            if let Some(v3) = info.v3 {
                iface.querier_robustness = v3.qrv as u32;
                iface.querier_interval_secs = timecode_8bit_decode(v3.qqic) as u32;
                iface.querier_response_tenths = timecode_8bit_decode(v3.code) as u32;
            }

            // Re-arm the other-querier-present timer
            ops.del(IgmpTimer::QuerierTimeout { if_slot });
            let millis = (iface.querier_robustness as u64 * iface.querier_interval_secs as u64
                + iface.querier_response_tenths as u64 / 20)
                * 1000;
            ops.add(millis, IgmpTimer::QuerierTimeout { if_slot });
        }

        if elected {
            self.log_issue(
                if_slot,
                Some(self.interfaces[if_slot].querier_addr),
                "New querier elected",
            );
        }

        // Suppress router-side processing
        if info.v3.is_some_and(|v3| v3.s_flag) {
            return;
        }

        // Group specific query: refresh the membership deadline of an
        // active group
        if info.group != Ipv4Addr::UNSPECIFIED {
            let iface = &mut self.interfaces[if_slot];
            let Some(group_slot) = find_or_insert_group(iface, info.group, &self.logger) else {
                return;
            };
            if !iface.groups[group_slot].active {
                return;
            }

            ops.del(IgmpTimer::GroupTimeout { if_slot, group_slot });
            let millis = iface.querier_robustness as u64 * iface.querier_response_tenths as u64
                * 100
                + GRACE_MILLIS;
            ops.add(millis, IgmpTimer::GroupTimeout { if_slot, group_slot });
        }
    }

    fn join_common(&mut self, if_slot: usize, group_slot: usize, ops: &mut TimerOps<IgmpTimer>) {
        let iface = &mut self.interfaces[if_slot];
        let group = &mut iface.groups[group_slot];

        if group.active {
            // Cancel the running membership timer before re-arming
            ops.del(IgmpTimer::GroupTimeout { if_slot, group_slot });
        } else {
            group.active = true;
            for handle in &group.subscribers {
                handle.activate();
            }
        }

        let millis = (iface.querier_robustness as u64 * iface.querier_interval_secs as u64
            + iface.querier_response_tenths as u64 / 10)
            * 1000;
        ops.add(millis, IgmpTimer::GroupTimeout { if_slot, group_slot });
    }

    fn leave_common(&mut self, if_slot: usize, group_slot: usize, ops: &mut TimerOps<IgmpTimer>) {
        let iface = &mut self.interfaces[if_slot];

        // Only the elected querier acts on leaves
        if iface.querier_addr != iface.if_addr {
            return;
        }
        let group = &iface.groups[group_slot];
        if !group.active {
            return;
        }
        // A v1 host never sends a leave; ignore them while one is present
        if group.v1_host_present {
            return;
        }
        // A query series is already underway
        if group.group_queries_remaining > 0 {
            return;
        }

        // Shorten the membership deadline
        ops.del(IgmpTimer::GroupTimeout { if_slot, group_slot });
        let millis =
            iface.querier_robustness as u64 * iface.querier_lastmbr_tenths as u64 * 100
                + GRACE_MILLIS;
        ops.add(millis, IgmpTimer::GroupTimeout { if_slot, group_slot });

        // Send the first of the last-member queries
        iface.groups[group_slot].group_queries_remaining = iface.querier_robustness;
        self.send_group_specific_query(if_slot, group_slot, ops);
    }

    fn handle_v1_report(
        &mut self,
        if_slot: usize,
        src: Ipv4Addr,
        mcast_addr: Ipv4Addr,
        ops: &mut TimerOps<IgmpTimer>,
    ) {
        let iface = &mut self.interfaces[if_slot];
        let Some(group_slot) = find_or_insert_group(iface, mcast_addr, &self.logger) else {
            return;
        };

        // Track v1 host presence; leaves are suppressed while the timer
        // runs
        let group = &mut iface.groups[group_slot];
        if group.active && group.v1_host_present {
            ops.del(IgmpTimer::V1HostTimeout { if_slot, group_slot });
        } else {
            group.v1_host_present = true;
        }
        let millis = (iface.querier_robustness as u64 * iface.querier_interval_secs as u64
            + iface.querier_response_tenths as u64 / 10)
            * 1000;
        ops.add(millis, IgmpTimer::V1HostTimeout { if_slot, group_slot });

        self.log_traffic(
            if_slot,
            src,
            &format!("received v1 report [group {}]", mcast_addr),
        );

        self.join_common(if_slot, group_slot, ops);
    }

    fn handle_v2_report(
        &mut self,
        if_slot: usize,
        src: Ipv4Addr,
        mcast_addr: Ipv4Addr,
        ops: &mut TimerOps<IgmpTimer>,
    ) {
        let iface = &mut self.interfaces[if_slot];
        let Some(group_slot) = find_or_insert_group(iface, mcast_addr, &self.logger) else {
            return;
        };

        self.log_traffic(
            if_slot,
            src,
            &format!("received v2 report [group {}]", mcast_addr),
        );

        self.join_common(if_slot, group_slot, ops);
    }

    fn handle_v2_leave(
        &mut self,
        if_slot: usize,
        src: Ipv4Addr,
        mcast_addr: Ipv4Addr,
        ops: &mut TimerOps<IgmpTimer>,
    ) {
        let iface = &mut self.interfaces[if_slot];
        let Some(group_slot) = find_or_insert_group(iface, mcast_addr, &self.logger) else {
            return;
        };

        self.log_traffic(
            if_slot,
            src,
            &format!("received v2 leave [group {}]", mcast_addr),
        );

        self.leave_common(if_slot, group_slot, ops);
    }

    fn handle_v3_report(
        &mut self,
        if_slot: usize,
        src: Ipv4Addr,
        records: crate::protocols::igmp::GroupRecordIter<'_>,
        ops: &mut TimerOps<IgmpTimer>,
    ) {
        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(error) => {
                    // Do not process trailing records
                    self.log_issue(if_slot, Some(src), &error.to_string());
                    return;
                }
            };

            let iface = &mut self.interfaces[if_slot];
            let Some(group_slot) = find_or_insert_group(iface, record.group, &self.logger) else {
                continue;
            };

            self.log_traffic(
                if_slot,
                src,
                &format!(
                    "received v3 report type {} [group {}]",
                    record.rec_type, record.group
                ),
            );

            let is_join = match record.rec_type {
                REC_MODE_IS_INCLUDE | REC_CHANGE_TO_INCLUDE => record.num_srcs > 0,
                REC_MODE_IS_EXCLUDE | REC_CHANGE_TO_EXCLUDE | REC_ALLOW_NEW_SOURCES => true,
                REC_BLOCK_OLD_SOURCES => {
                    if record.num_srcs > 0 {
                        // Source-level blocks are not tracked
                        return;
                    }
                    false
                }
                _ => {
                    self.log_issue(
                        if_slot,
                        Some(src),
                        "Unknown group record type in IGMP v3 report",
                    );
                    return;
                }
            };

            if is_join {
                self.join_common(if_slot, group_slot, ops);
            } else {
                self.leave_common(if_slot, group_slot, ops);
            }
        }
    }

    /// Start the subsystem thread: one event loop over every interface's
    /// capture handle and the subsystem's timers.
    pub fn spawn(self) -> Result<Option<std::thread::JoinHandle<()>>> {
        if self.interfaces.is_empty() {
            return Ok(None);
        }

        let mut evloop: EventLoop<IgmpTimer> = EventLoop::new(
            self.interfaces.len(),
            self.timer_capacity(),
            self.logger.clone(),
        );
        for (slot, iface) in self.interfaces.iter().enumerate() {
            let fd = iface
                .port
                .as_ref()
                .map(|port| port.raw_fd())
                .with_context(|| format!("IGMP interface {} has no capture handle", iface.name))?;
            evloop.add_socket(fd, slot)?;
        }

        let handle = std::thread::Builder::new()
            .name("igmp".to_string())
            .spawn(move || {
                let mut subsystem = self;
                let mut ops = TimerOps::new();
                subsystem.start(&mut ops);
                evloop.apply(&mut ops);

                let mut scratch = vec![0u8; MCAST_MAX_PACKET_SIZE];
                evloop.run(move |event, ops| match event {
                    Event::Readable(slot) => {
                        if let Some(len) = subsystem.read_frame(slot, &mut scratch) {
                            subsystem.handle_frame(slot, &scratch[..len], ops);
                        }
                    }
                    Event::Timer(token) => subsystem.handle_timer(token, ops),
                });
            })
            .context("cannot create IGMP thread")?;
        Ok(Some(handle))
    }
}
