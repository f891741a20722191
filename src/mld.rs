// SPDX-License-Identifier: Apache-2.0 OR MIT
//! MLD control-plane subsystem: the IPv6 twin of the IGMP subsystem.
//!
//! Structurally identical to [`crate::igmp`], re-parameterized for MLD:
//! ff02::/16 link-scope filtering, the ICMPv6 pseudo-header checksum, and
//! millisecond-resolution response intervals. MLD has no v1-host
//! compatibility timer; an MLDv1 Done is the leave signal.

use std::net::Ipv6Addr;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::capture::{LinkPort, PcapPort};
use crate::event::{Event, EventLoop, TimerOps};
use crate::interface::{InterfaceFacts, OutboundHandle};
use crate::logging::{Facility, Logger};
use crate::protocols::mld::{
    build_general_query, build_group_query_template, build_mrd_advertisement, parse_frame,
    patch_group_query, MldPacket, ParseOutcome, QueryInfo, MLD_LASTMBR_INTERVAL_MILLIS,
    MLD_QUERY_INTERVAL_SECS, MLD_RESPONSE_INTERVAL_MILLIS, MLD_ROBUSTNESS, MRD_ADVERT_FRAME_LEN,
    QUERIER_UNKNOWN, QUERY_FRAME_LEN,
};
use crate::protocols::{
    timecode_16bit_decode, timecode_8bit_decode, GRACE_MILLIS, MRD_INITIAL_COUNT,
    MRD_INITIAL_INTERVAL_SECS, MRD_INTERVAL_JITTER_MS, MRD_INTERVAL_SECS, REC_ALLOW_NEW_SOURCES,
    REC_BLOCK_OLD_SOURCES, REC_CHANGE_TO_EXCLUDE, REC_CHANGE_TO_INCLUDE, REC_MODE_IS_EXCLUDE,
    REC_MODE_IS_INCLUDE,
};
use crate::{log_debug, log_info, log_warning, QuerierMode, MCAST_MAX_PACKET_SIZE};

// Pcap MLD filter
//
//   Expected packet format:
//     Ethernet header
//     IPv6 header with next header as Hop-by-Hop
//     Hop-by-Hop header with embedded Router Alert and next header as ICMPv6
//     ICMPv6/MLD header
//
//   Filter notes:
//     Offset 40 is the next header type in the Hop-by-Hop header
//     Header type 58 is ICMPv6
//     Offset 48 is the ICMPv6 (MLD) message type
const MLD_FILTER: &str = "ip6 && ip6[40] == 58 && (ip6[48] == 130 || ip6[48] == 131 || ip6[48] == 132 || ip6[48] == 143 || ip6[48] == 152)";

/// Timer identity within the MLD subsystem. At most one timer per token
/// is ever outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MldTimer {
    MrdAdvertisement { if_slot: usize },
    GeneralQuery { if_slot: usize },
    QuerierTimeout { if_slot: usize },
    GroupTimeout { if_slot: usize, group_slot: usize },
    GroupQuery { if_slot: usize, group_slot: usize },
}

struct MldGroup {
    mcast_addr: Ipv6Addr,
    active: bool,
    group_queries_remaining: u32,
    // Data-plane interfaces toggled when this group transitions
    subscribers: Vec<OutboundHandle>,
}

impl MldGroup {
    fn new(mcast_addr: Ipv6Addr) -> Self {
        Self {
            mcast_addr,
            active: false,
            group_queries_remaining: 0,
            subscribers: Vec::new(),
        }
    }
}

struct MldInterface {
    name: String,
    if_index: u32,
    if_addr: Ipv6Addr,
    if_mac: [u8; 6],

    port: Option<Box<dyn LinkPort>>,

    // Fixed prefix of registered groups, dynamic suffix of learned ones
    groups: Vec<MldGroup>,
    fixed_limit: usize,
    group_limit: usize,

    // Current querier variables
    querier_addr: Ipv6Addr,
    querier_robustness: u32,
    querier_interval_secs: u32,
    querier_response_millis: u32,
    querier_lastmbr_millis: u32,

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
            log_warning!(logger, Facility::Mld, "MLD({}): {:#}", name, e);
        }
    }
}

// Find a group in the table, or insert one in the dynamic suffix.
// Link-scope groups are never tracked. The caller sets the active flag.
fn find_or_insert_group(
    iface: &mut MldInterface,
    mcast_addr: Ipv6Addr,
    logger: &Logger,
) -> Option<usize> {
    // Ignore local scope multicast addresses (ff02::/16)
    let octets = mcast_addr.octets();
    if octets[0] == 0xff && octets[1] == 0x02 {
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
                    Facility::Mld,
                    "MLD({}) [{}]: Group list full -- group ignored",
                    iface.name,
                    mcast_addr
                );
                return None;
            }
            iface.groups.push(MldGroup::new(mcast_addr));
            iface.groups.len() - 1
        }
    };

    let group = &mut iface.groups[slot];
    group.mcast_addr = mcast_addr;
    group.group_queries_remaining = 0;
    Some(slot)
}

/// The MLD control plane: one instance owns every monitored interface
/// and runs on its own thread.
pub struct MldSubsystem {
    interfaces: Vec<MldInterface>,
    mode: QuerierMode,
    non_configured_groups: usize,
    rng: StdRng,
    logger: Logger,
}

impl MldSubsystem {
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
        mcast_addr: Ipv6Addr,
        handle: OutboundHandle,
    ) {
        let if_slot = match self
            .interfaces
            .iter()
            .position(|iface| iface.if_index == facts.if_index)
        {
            Some(slot) => slot,
            None => {
                self.interfaces.push(MldInterface {
                    name: facts.name.clone(),
                    if_index: facts.if_index,
                    if_addr: facts.ipv6_ll.unwrap_or(Ipv6Addr::UNSPECIFIED),
                    if_mac: facts.mac,
                    port: None,
                    groups: Vec::new(),
                    fixed_limit: 0,
                    group_limit: 0,
                    querier_addr: QUERIER_UNKNOWN,
                    querier_robustness: MLD_ROBUSTNESS,
                    querier_interval_secs: MLD_QUERY_INTERVAL_SECS,
                    querier_response_millis: MLD_RESPONSE_INTERVAL_MILLIS,
                    querier_lastmbr_millis: MLD_LASTMBR_INTERVAL_MILLIS,
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
                iface.groups.push(MldGroup::new(mcast_addr));
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
        println!("MLD:");
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
            let port = PcapPort::open(&iface.name, MLD_FILTER, self.logger.clone(), Facility::Mld)
                .with_context(|| format!("MLD capture on {} failed", iface.name))?;
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

    pub fn querier_addr(&self, if_slot: usize) -> Ipv6Addr {
        self.interfaces[if_slot].querier_addr
    }

    pub fn robustness(&self, if_slot: usize) -> u32 {
        self.interfaces[if_slot].querier_robustness
    }

    pub fn group_active(&self, if_slot: usize, mcast_addr: Ipv6Addr) -> bool {
        self.interfaces[if_slot]
            .groups
            .iter()
            .any(|g| g.mcast_addr == mcast_addr && g.active)
    }

    pub fn dynamic_group_count(&self, if_slot: usize) -> usize {
        let iface = &self.interfaces[if_slot];
        iface.groups.len() - iface.fixed_limit
    }

    /// Build the packet templates and start the protocol engines:
    /// the initial MRD advertisement burst and the querier startup
    /// appropriate to the configured mode.
    pub fn start(&mut self, ops: &mut TimerOps<MldTimer>) {
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
                iface.querier_robustness = MLD_ROBUSTNESS;
                iface.querier_interval_secs = MLD_QUERY_INTERVAL_SECS;
                iface.querier_response_millis = MLD_RESPONSE_INTERVAL_MILLIS;
                iface.querier_lastmbr_millis = MLD_LASTMBR_INTERVAL_MILLIS;

                // All ones allows anyone to win an election
                iface.querier_addr = QUERIER_UNKNOWN;

                if self.mode != QuerierMode::Never {
                    // Self-elect if no querier appears (125.5 seconds)
                    ops.add(125_500, MldTimer::QuerierTimeout { if_slot });
                }
            }
        }
    }

    fn log_issue(&self, if_slot: usize, addr: Option<Ipv6Addr>, msg: &str) {
        let iface = &self.interfaces[if_slot];
        let addr_str = addr.map(|a| a.to_string()).unwrap_or_default();
        log_info!(
            self.logger,
            Facility::Mld,
            "MLD({}) [{}]: {}",
            iface.name,
            addr_str,
            msg
        );
    }

    fn log_traffic(&self, if_slot: usize, addr: Ipv6Addr, msg: &str) {
        if self.logger.debug_level() >= 3 {
            let iface = &self.interfaces[if_slot];
            log_debug!(
                self.logger,
                Facility::Mld,
                "MLD({}) [{}]: {}",
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
    pub fn handle_frame(&mut self, if_slot: usize, frame: &[u8], ops: &mut TimerOps<MldTimer>) {
        let own_addr = self.interfaces[if_slot].if_addr;
        match parse_frame(frame, own_addr) {
            ParseOutcome::Own => {}
            ParseOutcome::Invalid { src, error } => {
                self.log_issue(if_slot, src, &error.to_string())
            }
            ParseOutcome::Packet { src, packet } => match packet {
                MldPacket::Query(info) => self.handle_query(if_slot, src, info, ops),
                MldPacket::V1Report { group } => self.handle_v1_report(if_slot, src, group, ops),
                MldPacket::V1Done { group } => self.handle_v1_done(if_slot, src, group, ops),
                MldPacket::V2Report(records) => self.handle_v2_report(if_slot, src, records, ops),
                MldPacket::MrdSolicitation => self.handle_mrd_solicitation(if_slot, src, ops),
                MldPacket::Ignored => {}
            },
        }
    }

    /// Dispatch an expired timer
    pub fn handle_timer(&mut self, token: MldTimer, ops: &mut TimerOps<MldTimer>) {
        match token {
            MldTimer::MrdAdvertisement { if_slot } => self.send_mrd_advertisement(if_slot, ops),
            MldTimer::GeneralQuery { if_slot } => self.send_general_query(if_slot, ops),
            MldTimer::QuerierTimeout { if_slot } => self.querier_timeout(if_slot, ops),
            MldTimer::GroupTimeout { if_slot, group_slot } => {
                self.group_timeout(if_slot, group_slot)
            }
            MldTimer::GroupQuery { if_slot, group_slot } => {
                self.send_group_specific_query(if_slot, group_slot, ops)
            }
        }
    }

    fn send_mrd_advertisement(&mut self, if_slot: usize, ops: &mut TimerOps<MldTimer>) {
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
        ops.add(millis, MldTimer::MrdAdvertisement { if_slot });
    }

    fn send_general_query(&mut self, if_slot: usize, ops: &mut TimerOps<MldTimer>) {
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
        ops.add(millis, MldTimer::GeneralQuery { if_slot });
    }

    fn send_group_specific_query(
        &mut self,
        if_slot: usize,
        group_slot: usize,
        ops: &mut TimerOps<MldTimer>,
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
                Facility::Mld,
                "MLD({}) [{}]: sending query [group {}]",
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
                iface.querier_lastmbr_millis as u64,
                MldTimer::GroupQuery { if_slot, group_slot },
            );
        }
    }

    fn activate_querier_mode(&mut self, if_slot: usize, ops: &mut TimerOps<MldTimer>) {
        self.log_issue(
            if_slot,
            Some(self.interfaces[if_slot].if_addr),
            "Querier mode activated",
        );

        let iface = &mut self.interfaces[if_slot];
        iface.querier_robustness = MLD_ROBUSTNESS;
        iface.querier_interval_secs = MLD_QUERY_INTERVAL_SECS;
        iface.querier_response_millis = MLD_RESPONSE_INTERVAL_MILLIS;
        iface.querier_lastmbr_millis = MLD_LASTMBR_INTERVAL_MILLIS;

        iface.querier_addr = iface.if_addr;

        iface.startup_queries_remaining = iface.querier_robustness - 1;
        self.send_general_query(if_slot, ops);
    }

    fn querier_timeout(&mut self, if_slot: usize, ops: &mut TimerOps<MldTimer>) {
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

    fn handle_mrd_solicitation(
        &mut self,
        if_slot: usize,
        src: Ipv6Addr,
        ops: &mut TimerOps<MldTimer>,
    ) {
        self.log_traffic(if_slot, src, "received Multicast Router Solicitation");

        ops.del(MldTimer::MrdAdvertisement { if_slot });
        self.send_mrd_advertisement(if_slot, ops);
    }

    fn handle_query(
        &mut self,
        if_slot: usize,
        src: Ipv6Addr,
        info: QueryInfo,
        ops: &mut TimerOps<MldTimer>,
    ) {
        if self.logger.debug_level() >= 3 {
            let version = if info.v2.is_some() { "v2" } else { "v1" };
            let iface = &self.interfaces[if_slot];
            log_debug!(
                self.logger,
                Facility::Mld,
                "MLD({}) [{}]: received {} query [group {}]",
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
                        ops.del(MldTimer::GeneralQuery { if_slot });
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

                    // A v1 query carries no parameters; assume defaults
                    if info.v2.is_none() {
                        iface.querier_robustness = MLD_ROBUSTNESS;
                        iface.querier_interval_secs = MLD_QUERY_INTERVAL_SECS;
                        iface.querier_response_millis = MLD_RESPONSE_INTERVAL_MILLIS;
                    }
                    elected = true;
                }
            }

            // Adopt the observed querier's parameters
            if let Some(v2) = info.v2 {
                iface.querier_robustness = v2.qrv as u32;
                iface.querier_interval_secs = timecode_8bit_decode(v2.qqic) as u32;
                iface.querier_response_millis = timecode_16bit_decode(v2.response);
            }

            // Re-arm the other-querier-present timer
            ops.del(MldTimer::QuerierTimeout { if_slot });
            let millis = iface.querier_robustness as u64 * iface.querier_interval_secs as u64
                * 1000
                + iface.querier_response_millis as u64 / 2;
            ops.add(millis, MldTimer::QuerierTimeout { if_slot });
        }

        if elected {
            self.log_issue(
                if_slot,
                Some(self.interfaces[if_slot].querier_addr),
                "New querier elected",
            );
        }

        // Suppress router-side processing
        if info.v2.is_some_and(|v2| v2.s_flag) {
            return;
        }

        // Group specific query: refresh the membership deadline of an
        // active group
        if info.group != Ipv6Addr::UNSPECIFIED {
            let iface = &mut self.interfaces[if_slot];
            let Some(group_slot) = find_or_insert_group(iface, info.group, &self.logger) else {
                return;
            };
            if !iface.groups[group_slot].active {
                return;
            }

            ops.del(MldTimer::GroupTimeout { if_slot, group_slot });
            let millis = iface.querier_robustness as u64 * iface.querier_response_millis as u64
                + GRACE_MILLIS;
            ops.add(millis, MldTimer::GroupTimeout { if_slot, group_slot });
        }
    }

    fn join_common(&mut self, if_slot: usize, group_slot: usize, ops: &mut TimerOps<MldTimer>) {
        let iface = &mut self.interfaces[if_slot];
        let group = &mut iface.groups[group_slot];

        if group.active {
            // Cancel the running membership timer before re-arming
            ops.del(MldTimer::GroupTimeout { if_slot, group_slot });
        } else {
            group.active = true;
            for handle in &group.subscribers {
                handle.activate();
            }
        }

        let millis = iface.querier_robustness as u64 * iface.querier_interval_secs as u64 * 1000
            + iface.querier_response_millis as u64
            + GRACE_MILLIS;
        ops.add(millis, MldTimer::GroupTimeout { if_slot, group_slot });
    }

    fn leave_common(&mut self, if_slot: usize, group_slot: usize, ops: &mut TimerOps<MldTimer>) {
        let iface = &mut self.interfaces[if_slot];

        // Only the elected querier acts on leaves
        if iface.querier_addr != iface.if_addr {
            return;
        }
        let group = &iface.groups[group_slot];
        if !group.active {
            return;
        }
        // A query series is already underway
        if group.group_queries_remaining > 0 {
            return;
        }

        // Shorten the membership deadline
        ops.del(MldTimer::GroupTimeout { if_slot, group_slot });
        let millis =
            iface.querier_robustness as u64 * iface.querier_lastmbr_millis as u64 + GRACE_MILLIS;
        ops.add(millis, MldTimer::GroupTimeout { if_slot, group_slot });

        // Send the first of the last-member queries
        iface.groups[group_slot].group_queries_remaining = iface.querier_robustness;
        self.send_group_specific_query(if_slot, group_slot, ops);
    }

    fn handle_v1_report(
        &mut self,
        if_slot: usize,
        src: Ipv6Addr,
        mcast_addr: Ipv6Addr,
        ops: &mut TimerOps<MldTimer>,
    ) {
        let iface = &mut self.interfaces[if_slot];
        let Some(group_slot) = find_or_insert_group(iface, mcast_addr, &self.logger) else {
            return;
        };

        self.log_traffic(
            if_slot,
            src,
            &format!("received v1 report [group {}]", mcast_addr),
        );

        self.join_common(if_slot, group_slot, ops);
    }

    fn handle_v1_done(
        &mut self,
        if_slot: usize,
        src: Ipv6Addr,
        mcast_addr: Ipv6Addr,
        ops: &mut TimerOps<MldTimer>,
    ) {
        let iface = &mut self.interfaces[if_slot];
        let Some(group_slot) = find_or_insert_group(iface, mcast_addr, &self.logger) else {
            return;
        };

        self.log_traffic(
            if_slot,
            src,
            &format!("received v1 done [group {}]", mcast_addr),
        );

        self.leave_common(if_slot, group_slot, ops);
    }

    fn handle_v2_report(
        &mut self,
        if_slot: usize,
        src: Ipv6Addr,
        records: crate::protocols::mld::GroupRecordIter<'_>,
        ops: &mut TimerOps<MldTimer>,
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
                    "received v2 report type {} [group {}]",
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
                        "Unknown group record type in MLD v2 report",
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

        let mut evloop: EventLoop<MldTimer> = EventLoop::new(
            self.interfaces.len(),
            self.timer_capacity(),
            self.logger.clone(),
        );
        for (slot, iface) in self.interfaces.iter().enumerate() {
            let fd = iface
                .port
                .as_ref()
                .map(|port| port.raw_fd())
                .with_context(|| format!("MLD interface {} has no capture handle", iface.name))?;
            evloop.add_socket(fd, slot)?;
        }

        let handle = std::thread::Builder::new()
            .name("mld".to_string())
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
            .context("cannot create MLD thread")?;
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TimerOp;
    use crate::interface::OutboundPort;
    use crate::protocols::mld::testutil;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn local() -> Ipv6Addr {
        "fe80::3".parse().unwrap()
    }

    fn fixed_group() -> Ipv6Addr {
        "ff05::7500".parse().unwrap()
    }

    struct TestPort {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl LinkPort for TestPort {
        fn raw_fd(&self) -> std::os::fd::RawFd {
            -1
        }
        fn capture_next(&mut self, _buf: &mut [u8]) -> Option<usize> {
            None
        }
        fn inject(&mut self, frame: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Counters {
        activations: AtomicU32,
        deactivations: AtomicU32,
    }

    struct TestOutbound(Arc<Counters>);

    impl OutboundPort for TestOutbound {
        fn activate(&self) {
            self.0.activations.fetch_add(1, Ordering::SeqCst);
        }
        fn deactivate(&self) {
            self.0.deactivations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Sim {
        subsystem: MldSubsystem,
        ops: TimerOps<MldTimer>,
        timers: Vec<(u64, MldTimer)>,
        now: u64,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        counters: Arc<Counters>,
    }

    impl Sim {
        fn new(mode: QuerierMode, non_configured_groups: usize) -> Self {
            let mut subsystem =
                MldSubsystem::new(mode, non_configured_groups, Logger::discard());

            let facts = InterfaceFacts {
                name: "eth0".to_string(),
                if_index: 7,
                mac: [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee],
                ipv4: None,
                ipv6_ll: Some(local()),
            };
            let counters = Arc::new(Counters::default());
            subsystem.register_group(
                &facts,
                fixed_group(),
                Arc::new(TestOutbound(Arc::clone(&counters))),
            );
            subsystem.finalize(false);

            let sent = Arc::new(Mutex::new(Vec::new()));
            subsystem.set_port(
                0,
                Box::new(TestPort {
                    sent: Arc::clone(&sent),
                }),
            );

            let mut sim = Self {
                subsystem,
                ops: TimerOps::new(),
                timers: Vec::new(),
                now: 0,
                sent,
                counters,
            };
            sim.subsystem.start(&mut sim.ops);
            sim.apply();
            sim
        }

        fn apply(&mut self) {
            for op in self.ops.take() {
                match op {
                    TimerOp::Add { millis, token } => {
                        assert!(
                            !self.timers.iter().any(|(_, t)| *t == token),
                            "duplicate timer token {:?}",
                            token
                        );
                        let deadline = self.now + millis;
                        let index = self
                            .timers
                            .iter()
                            .position(|(d, _)| deadline < *d)
                            .unwrap_or(self.timers.len());
                        self.timers.insert(index, (deadline, token));
                    }
                    TimerOp::Del { token } => {
                        if let Some(index) =
                            self.timers.iter().position(|(_, t)| *t == token)
                        {
                            self.timers.remove(index);
                        }
                    }
                }
            }
        }

        fn deliver(&mut self, frame: &[u8]) {
            self.subsystem.handle_frame(0, frame, &mut self.ops);
            self.apply();
        }

        fn run_until(&mut self, time: u64) {
            while let Some((deadline, _)) = self.timers.first() {
                if *deadline > time {
                    break;
                }
                let (deadline, token) = self.timers.remove(0);
                self.now = deadline;
                self.subsystem.handle_timer(token, &mut self.ops);
                self.apply();
            }
            self.now = time;
        }

        fn deadline_of(&self, pred: impl Fn(&MldTimer) -> bool) -> Option<u64> {
            self.timers.iter().find(|(_, t)| pred(t)).map(|(d, _)| *d)
        }

        fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        fn clear_sent(&self) {
            self.sent.lock().unwrap().clear();
        }

        fn activations(&self) -> u32 {
            self.counters.activations.load(Ordering::SeqCst)
        }

        fn deactivations(&self) -> u32 {
            self.counters.deactivations.load(Ordering::SeqCst)
        }
    }

    fn mld_type(frame: &[u8]) -> u8 {
        frame[62]
    }

    fn s_flag(frame: &[u8]) -> bool {
        frame[86] & 0x08 != 0
    }

    #[test]
    fn test_quick_startup_sends_advertisement_and_query() {
        let sim = Sim::new(QuerierMode::Quick, 100);

        let sent = sim.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            mld_type(&sent[0]),
            crate::protocols::mld::MLD_MRD_ADVERTISEMENT
        );
        assert_eq!(mld_type(&sent[1]), crate::protocols::mld::MLD_QUERY);

        assert_eq!(sim.subsystem.querier_addr(0), local());
        assert_eq!(
            sim.deadline_of(|t| matches!(t, MldTimer::GeneralQuery { .. })),
            Some(31_250)
        );
    }

    #[test]
    fn test_join_and_leave_millisecond_timers() {
        let mut sim = Sim::new(QuerierMode::Quick, 100);
        let reporter: Ipv6Addr = "fe80::5".parse().unwrap();

        sim.deliver(&testutil::v1_report_frame(reporter, fixed_group()));
        assert_eq!(sim.activations(), 1);

        // Membership timer: 2 * 125 * 1000 + 10000 + 10
        assert_eq!(
            sim.deadline_of(|t| matches!(t, MldTimer::GroupTimeout { .. })),
            Some(260_010)
        );

        sim.run_until(5_000);
        sim.clear_sent();
        sim.deliver(&testutil::v1_done_frame(reporter, fixed_group()));

        // First group-specific query immediately with S clear, the
        // second a last-member interval (1000 ms) later with S set
        let sent = sim.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(mld_type(&sent[0]), crate::protocols::mld::MLD_QUERY);
        assert!(!s_flag(&sent[0]));

        sim.run_until(6_000);
        let sent = sim.sent_frames();
        assert_eq!(sent.len(), 2);
        assert!(s_flag(&sent[1]));

        // Shortened deadline: 2 * 1000 + 10 after the leave
        sim.run_until(7_010);
        assert_eq!(sim.deactivations(), 1);
        assert_eq!(sim.sent_frames().len(), 2);
    }

    #[test]
    fn test_defer_mode_yields_to_any_querier() {
        let mut sim = Sim::new(QuerierMode::Defer, 100);
        sim.run_until(125_500);
        assert_eq!(sim.subsystem.querier_addr(0), local());

        let other: Ipv6Addr = "fe80::9".parse().unwrap();
        sim.deliver(&testutil::v2_query_frame(
            other,
            Ipv6Addr::UNSPECIFIED,
            2,
            125,
            10_000,
            false,
        ));
        assert_eq!(sim.subsystem.querier_addr(0), other);
        assert!(sim
            .deadline_of(|t| matches!(t, MldTimer::GeneralQuery { .. }))
            .is_none());

        // Other-querier-present: 2 * 125 * 1000 + 10000 / 2
        assert_eq!(
            sim.deadline_of(|t| matches!(t, MldTimer::QuerierTimeout { .. })),
            Some(sim.now + 255_000)
        );
    }

    #[test]
    fn test_election_lowest_address_wins() {
        let mut sim = Sim::new(QuerierMode::Delay, 100);

        let a: Ipv6Addr = "fe80::9".parse().unwrap();
        let b: Ipv6Addr = "fe80::7".parse().unwrap();
        let c: Ipv6Addr = "fe80::8".parse().unwrap();
        for addr in [a, b, c] {
            sim.deliver(&testutil::v2_query_frame(
                addr,
                Ipv6Addr::UNSPECIFIED,
                2,
                125,
                10_000,
                false,
            ));
        }
        assert_eq!(sim.subsystem.querier_addr(0), b);
    }

    #[test]
    fn test_adopted_16bit_response_code() {
        let mut sim = Sim::new(QuerierMode::Delay, 100);
        let other: Ipv6Addr = "fe80::1".parse().unwrap();

        // Response code 0x8000 decodes to 32768 ms
        sim.deliver(&testutil::v2_query_frame(
            other,
            Ipv6Addr::UNSPECIFIED,
            2,
            125,
            0x8000,
            false,
        ));

        // Other-querier-present: 2 * 125 * 1000 + 32768 / 2
        assert_eq!(
            sim.deadline_of(|t| matches!(t, MldTimer::QuerierTimeout { .. })),
            Some(266_384)
        );
    }

    #[test]
    fn test_v1_query_assumes_defaults() {
        let mut sim = Sim::new(QuerierMode::Delay, 100);

        sim.deliver(&testutil::v2_query_frame(
            "fe80::2".parse().unwrap(),
            Ipv6Addr::UNSPECIFIED,
            3,
            125,
            5_000,
            false,
        ));
        assert_eq!(sim.subsystem.robustness(0), 3);

        sim.deliver(&testutil::v1_query_frame(
            "fe80::1".parse().unwrap(),
            Ipv6Addr::UNSPECIFIED,
        ));
        assert_eq!(sim.subsystem.robustness(0), 2);
    }

    #[test]
    fn test_link_scope_groups_never_tracked() {
        let mut sim = Sim::new(QuerierMode::Quick, 100);
        let reporter: Ipv6Addr = "fe80::5".parse().unwrap();
        let link_scope: Ipv6Addr = "ff02::1:3".parse().unwrap();

        sim.deliver(&testutil::v1_report_frame(reporter, link_scope));
        assert_eq!(sim.subsystem.dynamic_group_count(0), 0);
        assert_eq!(sim.activations(), 0);
    }

    #[test]
    fn test_truncated_v2_report_applies_complete_records() {
        let mut sim = Sim::new(QuerierMode::Quick, 100);
        let reporter: Ipv6Addr = "fe80::5".parse().unwrap();
        let g1: Ipv6Addr = "ff05::1".parse().unwrap();
        let g2: Ipv6Addr = "ff05::2".parse().unwrap();
        let g3: Ipv6Addr = "ff05::3".parse().unwrap();

        // Three records claimed, the third cut mid-sources
        let mut frame = testutil::v2_report_frame(
            reporter,
            &[
                (REC_MODE_IS_EXCLUDE, g1, 0),
                (REC_MODE_IS_EXCLUDE, g2, 0),
                (REC_MODE_IS_EXCLUDE, g3, 2),
            ],
        );
        testutil::truncate_mld(&mut frame, 8 + 20 + 20 + 20 + 16);
        sim.deliver(&frame);

        assert!(sim.subsystem.group_active(0, g1));
        assert!(sim.subsystem.group_active(0, g2));
        assert!(!sim.subsystem.group_active(0, g3));
    }

    #[test]
    fn test_dynamic_table_bound() {
        let mut sim = Sim::new(QuerierMode::Quick, 2);
        let reporter: Ipv6Addr = "fe80::5".parse().unwrap();
        let g1: Ipv6Addr = "ff05::1".parse().unwrap();
        let g2: Ipv6Addr = "ff05::2".parse().unwrap();
        let g3: Ipv6Addr = "ff05::3".parse().unwrap();

        sim.deliver(&testutil::v1_report_frame(reporter, g1));
        sim.deliver(&testutil::v1_report_frame(reporter, g2));
        sim.deliver(&testutil::v1_report_frame(reporter, g3));

        assert!(sim.subsystem.group_active(0, g1));
        assert!(sim.subsystem.group_active(0, g2));
        assert!(!sim.subsystem.group_active(0, g3));
        assert_eq!(sim.subsystem.dynamic_group_count(0), 2);
    }

    #[test]
    fn test_solicitation_triggers_immediate_advertisement() {
        let mut sim = Sim::new(QuerierMode::Quick, 100);
        sim.run_until(30_000);
        sim.clear_sent();

        sim.deliver(&testutil::mrd_solicitation_frame("fe80::5".parse().unwrap()));

        let sent = sim.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            mld_type(&sent[0]),
            crate::protocols::mld::MLD_MRD_ADVERTISEMENT
        );
        let count = sim
            .timers
            .iter()
            .filter(|(_, t)| matches!(t, MldTimer::MrdAdvertisement { .. }))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_own_frames_dropped() {
        let mut sim = Sim::new(QuerierMode::Delay, 100);
        sim.deliver(&testutil::v1_report_frame(local(), fixed_group()));
        assert!(!sim.subsystem.group_active(0, fixed_group()));
    }
}
