// SPDX-License-Identifier: Apache-2.0 OR MIT
//! MLD frame building and parsing (RFC 2710 / RFC 3810 / RFC 9777),
//! plus the IPv6 flavor of Multicast Router Discovery (RFC 4286).
//!
//! Expected packet format:
//!   Ethernet header
//!   IPv6 header with next header as Hop-by-Hop
//!   Hop-by-Hop header with embedded Router Alert and next header as ICMPv6
//!   ICMPv6/MLD header

use std::net::Ipv6Addr;

use thiserror::Error;

use super::{inet6_checksum, ETHERNET_HEADER_LEN, ETHERNET_TYPE_IPV6, MRD_INTERVAL_SECS};

// MLD (ICMPv6) message types
pub const MLD_QUERY: u8 = 130;
pub const MLD_V1_REPORT: u8 = 131;
pub const MLD_V1_DONE: u8 = 132;
pub const MLD_V2_REPORT: u8 = 143;
pub const MLD_MRD_ADVERTISEMENT: u8 = 151;
pub const MLD_MRD_SOLICITATION: u8 = 152;
pub const MLD_MRD_TERMINATION: u8 = 153;

// MLD protocol parameters (defaults from RFC 2710 & RFC 9777)
pub const MLD_ROBUSTNESS: u32 = 2;
pub const MLD_QUERY_INTERVAL_SECS: u32 = 125;
pub const MLD_RESPONSE_INTERVAL_MILLIS: u32 = 10_000;
pub const MLD_LASTMBR_INTERVAL_MILLIS: u32 = 1_000;

/// All nodes group (general query destination)
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0001);
/// All snoopers group (MRD advertisement destination)
pub const ALL_SNOOPERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x006a);
/// Sentinel querier address meaning "unknown / open election"
pub const QUERIER_UNKNOWN: Ipv6Addr = Ipv6Addr::new(
    0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
);

const IP6_PROTO_ICMPV6: u8 = 58;
const IP6_OPT_HOP_BY_HOP: u8 = 0x00;
const IP6_OPT_ROUTER_ALERT: u8 = 0x05;
const IP6_OPT_PADN: u8 = 0x01;

const IP_OFFSET: usize = ETHERNET_HEADER_LEN;
const IP6_HEADER_LEN: usize = 40;
const HBH_OFFSET: usize = IP_OFFSET + IP6_HEADER_LEN;
const HBH_LEN: usize = 8;
const MLD_OFFSET: usize = HBH_OFFSET + HBH_LEN;

const MRD_ADVERT_LEN: usize = 8;
const MLD_HEADER_LEN: usize = 24;
const V2_QUERY_LEN: usize = 28;

/// Emitted MRD advertisement frame size
pub const MRD_ADVERT_FRAME_LEN: usize = MLD_OFFSET + MRD_ADVERT_LEN;
/// Emitted query frame size (always the v2 query layout)
pub const QUERY_FRAME_LEN: usize = MLD_OFFSET + V2_QUERY_LEN;

/// Map an IPv6 multicast address to its Ethernet destination:
/// 33:33 followed by the low 32 bits of the group address.
pub fn multicast_mac(group: Ipv6Addr) -> [u8; 6] {
    let g = group.octets();
    [0x33, 0x33, g[12], g[13], g[14], g[15]]
}

// Fill the Ethernet, IPv6 and Hop-by-Hop headers shared by all emitted
// packets. The Ethernet and IP destinations are left for the caller; the
// ICMPv6 checksum is computed once the destination is known.
fn build_headers(frame: &mut [u8], src_mac: [u8; 6], src_addr: Ipv6Addr, mld_len: usize) {
    frame[0..2].copy_from_slice(&[0x33, 0x33]);
    frame[6..12].copy_from_slice(&src_mac);
    frame[12..14].copy_from_slice(&ETHERNET_TYPE_IPV6.to_be_bytes());

    let ip = &mut frame[IP_OFFSET..];
    ip[0..4].copy_from_slice(&0x6000_0000u32.to_be_bytes());
    ip[4..6].copy_from_slice(&((HBH_LEN + mld_len) as u16).to_be_bytes());
    ip[6] = IP6_OPT_HOP_BY_HOP;
    ip[7] = 1; // hop limit
    ip[8..24].copy_from_slice(&src_addr.octets());

    // Hop-by-Hop header: Router Alert followed by PadN to the 8-byte
    // boundary
    let hbh = &mut frame[HBH_OFFSET..];
    hbh[0] = IP6_PROTO_ICMPV6;
    hbh[1] = 0; // header extension length
    hbh[2] = IP6_OPT_ROUTER_ALERT;
    hbh[3] = 2;
    // Router Alert value zero (MLD)
    hbh[6] = IP6_OPT_PADN;
    hbh[7] = 0;
}

fn set_destination(frame: &mut [u8], dst: Ipv6Addr) {
    frame[0..6].copy_from_slice(&multicast_mac(dst));
    frame[IP_OFFSET + 24..IP_OFFSET + 40].copy_from_slice(&dst.octets());
}

fn frame_src(frame: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&frame[IP_OFFSET + 8..IP_OFFSET + 24]);
    Ipv6Addr::from(octets)
}

fn frame_dst(frame: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&frame[IP_OFFSET + 24..IP_OFFSET + 40]);
    Ipv6Addr::from(octets)
}

fn finalize_mld_checksum(frame: &mut [u8]) {
    let src = frame_src(frame);
    let dst = frame_dst(frame);
    frame[MLD_OFFSET + 2..MLD_OFFSET + 4].copy_from_slice(&[0, 0]);
    let csum = inet6_checksum(&frame[MLD_OFFSET..], &src, &dst, IP6_PROTO_ICMPV6);
    frame[MLD_OFFSET + 2..MLD_OFFSET + 4].copy_from_slice(&csum.to_be_bytes());
}

/// Build the Multicast Router Discovery advertisement frame for an
/// interface. The frame is immutable once built.
pub fn build_mrd_advertisement(src_mac: [u8; 6], src_addr: Ipv6Addr) -> [u8; MRD_ADVERT_FRAME_LEN] {
    let mut frame = [0u8; MRD_ADVERT_FRAME_LEN];
    build_headers(&mut frame, src_mac, src_addr, MRD_ADVERT_LEN);
    set_destination(&mut frame, ALL_SNOOPERS);

    let mrd = &mut frame[MLD_OFFSET..];
    mrd[0] = MLD_MRD_ADVERTISEMENT;
    mrd[1] = MRD_INTERVAL_SECS as u8;
    mrd[4..6].copy_from_slice(&(MLD_QUERY_INTERVAL_SECS as u16).to_be_bytes());
    mrd[6..8].copy_from_slice(&(MLD_ROBUSTNESS as u16).to_be_bytes());

    finalize_mld_checksum(&mut frame);
    frame
}

/// Build the general query frame for an interface. The frame is
/// immutable once built.
pub fn build_general_query(src_mac: [u8; 6], src_addr: Ipv6Addr) -> [u8; QUERY_FRAME_LEN] {
    let mut frame = [0u8; QUERY_FRAME_LEN];
    build_headers(&mut frame, src_mac, src_addr, V2_QUERY_LEN);
    set_destination(&mut frame, ALL_NODES);

    let mld = &mut frame[MLD_OFFSET..];
    mld[0] = MLD_QUERY;
    mld[4..6].copy_from_slice(&(MLD_RESPONSE_INTERVAL_MILLIS as u16).to_be_bytes());
    // group address zero, S flag clear
    mld[24] = MLD_ROBUSTNESS as u8;
    mld[25] = MLD_QUERY_INTERVAL_SECS as u8;

    finalize_mld_checksum(&mut frame);
    frame
}

/// Build the group-specific query template for an interface. The
/// destination, group address, S flag and checksum are patched per
/// emission by [`patch_group_query`].
pub fn build_group_query_template(
    src_mac: [u8; 6],
    src_addr: Ipv6Addr,
) -> [u8; QUERY_FRAME_LEN] {
    let mut frame = [0u8; QUERY_FRAME_LEN];
    build_headers(&mut frame, src_mac, src_addr, V2_QUERY_LEN);

    let mld = &mut frame[MLD_OFFSET..];
    mld[0] = MLD_QUERY;
    mld[4..6].copy_from_slice(&(MLD_LASTMBR_INTERVAL_MILLIS as u16).to_be_bytes());
    mld[24] = MLD_ROBUSTNESS as u8;
    mld[25] = MLD_QUERY_INTERVAL_SECS as u8;

    frame
}

/// Patch a group-specific query template with the target group and the
/// S flag, and recompute the ICMPv6 checksum.
pub fn patch_group_query(frame: &mut [u8; QUERY_FRAME_LEN], group: Ipv6Addr, s_flag: bool) {
    set_destination(frame, group);
    frame[MLD_OFFSET + 8..MLD_OFFSET + 24].copy_from_slice(&group.octets());
    if s_flag {
        frame[MLD_OFFSET + 24] |= 0x08;
    } else {
        frame[MLD_OFFSET + 24] &= !0x08;
    }
    finalize_mld_checksum(frame);
}

/// Parse failure, logged at debug level 2 and dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MldParseError {
    #[error("Packet too short to contain an IPv6 header")]
    TruncatedIp,
    #[error("Packet is not an IPv6 packet")]
    NotIpv6,
    #[error("Next header in packet is not Hop-by-Hop")]
    NoHopByHop,
    #[error("IP packet overrun")]
    IpOverrun,
    #[error("Packet too short to contain a Hop-by-Hop header")]
    TruncatedHopByHop,
    #[error("Packet does not contain a Router Alert option")]
    NoRouterAlert,
    #[error("Packet without next header of ICMP6 in Hop-by-Hop header")]
    NotIcmpv6,
    #[error("Packet too short to contain an MLD header")]
    TruncatedMld,
    #[error("ICMP6/MLD checksum error")]
    MldChecksum,
    #[error("Packet too short to contain an MLD query")]
    TruncatedQuery,
    #[error("Packet too short to contain an MLD v1 report")]
    TruncatedV1Report,
    #[error("Packet too short to contain an MLD v1 done")]
    TruncatedDone,
    #[error("Packet too short to contain an MLD v2 report")]
    TruncatedV2Report,
    #[error("Group record header overrun in MLD v2 report")]
    RecordHeaderOverrun,
    #[error("Group record data overrun in MLD v2 report")]
    RecordDataOverrun,
    #[error("Unknown MLD type received")]
    UnknownType,
}

/// Protocol parameters carried by a v2 query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryV2Fields {
    pub s_flag: bool,
    pub qrv: u8,
    pub qqic: u8,
    pub response: u16,
}

/// A received listener query. `v2` is `None` for v1 queries, which carry
/// no querier parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryInfo {
    pub group: Ipv6Addr,
    pub v2: Option<QueryV2Fields>,
}

/// One address record of a v2 report. Source addresses are not retained:
/// membership is tracked at the group level only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRecord {
    pub rec_type: u8,
    pub group: Ipv6Addr,
    pub num_srcs: u16,
}

/// Iterator over the address records of a v2 report. Yields an error and
/// then stops if the buffer runs out before the claimed record count.
#[derive(Debug, Clone)]
pub struct GroupRecordIter<'a> {
    buf: &'a [u8],
    remaining: u16,
    failed: bool,
}

impl<'a> Iterator for GroupRecordIter<'a> {
    type Item = Result<GroupRecord, MldParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        if self.buf.len() < 20 {
            self.failed = true;
            return Some(Err(MldParseError::RecordHeaderOverrun));
        }

        let rec_type = self.buf[0];
        let aux_len = self.buf[1] as usize;
        let num_srcs = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buf[4..20]);
        let group = Ipv6Addr::from(octets);

        let record_len = 20 + num_srcs as usize * 16 + aux_len * 4;
        if self.buf.len() < record_len {
            self.failed = true;
            return Some(Err(MldParseError::RecordDataOverrun));
        }

        self.buf = &self.buf[record_len..];
        self.remaining -= 1;
        Some(Ok(GroupRecord {
            rec_type,
            group,
            num_srcs,
        }))
    }
}

/// Decoded MLD message
#[derive(Debug, Clone)]
pub enum MldPacket<'a> {
    Query(QueryInfo),
    V1Report { group: Ipv6Addr },
    V1Done { group: Ipv6Addr },
    V2Report(GroupRecordIter<'a>),
    MrdSolicitation,
    /// MRD advertisement or termination, ignored silently
    Ignored,
}

/// Result of parsing a captured frame
#[derive(Debug, Clone)]
pub enum ParseOutcome<'a> {
    Packet {
        src: Ipv6Addr,
        packet: MldPacket<'a>,
    },
    /// Our own transmission looped back by the capture handle
    Own,
    Invalid {
        src: Option<Ipv6Addr>,
        error: MldParseError,
    },
}

fn invalid(src: Option<Ipv6Addr>, error: MldParseError) -> ParseOutcome<'static> {
    ParseOutcome::Invalid { src, error }
}

fn read_addr(buf: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[..16]);
    Ipv6Addr::from(octets)
}

/// Parse a captured Ethernet frame, validating each layer. Packets whose
/// source address equals `own_addr` are dropped as our own.
pub fn parse_frame(frame: &[u8], own_addr: Ipv6Addr) -> ParseOutcome<'_> {
    if frame.len() < IP_OFFSET + IP6_HEADER_LEN {
        return invalid(None, MldParseError::TruncatedIp);
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERNET_TYPE_IPV6 {
        return invalid(None, MldParseError::NotIpv6);
    }

    let ip = &frame[IP_OFFSET..];
    let src = read_addr(&ip[8..24]);
    if src == own_addr {
        return ParseOutcome::Own;
    }
    let dst = read_addr(&ip[24..40]);

    if ip[6] != IP6_OPT_HOP_BY_HOP {
        return invalid(Some(src), MldParseError::NoHopByHop);
    }

    let payload = &ip[IP6_HEADER_LEN..];
    let payload_len = u16::from_be_bytes([ip[4], ip[5]]) as usize;
    if payload_len > payload.len() {
        return invalid(Some(src), MldParseError::IpOverrun);
    }
    if payload_len < HBH_LEN {
        return invalid(Some(src), MldParseError::TruncatedHopByHop);
    }

    // The order of the Router Alert and PadN options is not guaranteed
    let hbh = &payload[..HBH_LEN];
    if hbh[1] != 0 || (hbh[2] != IP6_OPT_ROUTER_ALERT && hbh[4] != IP6_OPT_ROUTER_ALERT) {
        return invalid(Some(src), MldParseError::NoRouterAlert);
    }
    if hbh[0] != IP6_PROTO_ICMPV6 {
        return invalid(Some(src), MldParseError::NotIcmpv6);
    }

    let mld = &payload[HBH_LEN..payload_len];
    if mld.len() < 4 {
        return invalid(Some(src), MldParseError::TruncatedMld);
    }
    if inet6_checksum(mld, &src, &dst, IP6_PROTO_ICMPV6) != 0 {
        return invalid(Some(src), MldParseError::MldChecksum);
    }

    let packet = match mld[0] {
        MLD_QUERY => {
            if mld.len() < MLD_HEADER_LEN {
                return invalid(Some(src), MldParseError::TruncatedQuery);
            }
            let group = read_addr(&mld[8..24]);
            let v2 = if mld.len() >= V2_QUERY_LEN {
                Some(QueryV2Fields {
                    s_flag: mld[24] & 0x08 != 0,
                    qrv: mld[24] & 0x07,
                    qqic: mld[25],
                    response: u16::from_be_bytes([mld[4], mld[5]]),
                })
            } else {
                None
            };
            MldPacket::Query(QueryInfo { group, v2 })
        }
        MLD_V1_REPORT => {
            if mld.len() < MLD_HEADER_LEN {
                return invalid(Some(src), MldParseError::TruncatedV1Report);
            }
            MldPacket::V1Report {
                group: read_addr(&mld[8..24]),
            }
        }
        MLD_V1_DONE => {
            if mld.len() < MLD_HEADER_LEN {
                return invalid(Some(src), MldParseError::TruncatedDone);
            }
            MldPacket::V1Done {
                group: read_addr(&mld[8..24]),
            }
        }
        MLD_V2_REPORT => {
            if mld.len() < 8 {
                return invalid(Some(src), MldParseError::TruncatedV2Report);
            }
            let num_groups = u16::from_be_bytes([mld[6], mld[7]]);
            MldPacket::V2Report(GroupRecordIter {
                buf: &mld[8..],
                remaining: num_groups,
                failed: false,
            })
        }
        MLD_MRD_SOLICITATION => MldPacket::MrdSolicitation,
        MLD_MRD_ADVERTISEMENT | MLD_MRD_TERMINATION => MldPacket::Ignored,
        _ => return invalid(Some(src), MldParseError::UnknownType),
    };

    ParseOutcome::Packet { src, packet }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Frame construction helpers for exercising the receive path.

    use super::*;

    pub fn wrap_mld(src: Ipv6Addr, dst: Ipv6Addr, mld: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; MLD_OFFSET + mld.len()];
        build_headers(&mut frame, [0x02, 0, 0, 0, 0, 1], src, mld.len());
        set_destination(&mut frame, dst);
        frame[MLD_OFFSET..].copy_from_slice(mld);
        finalize_mld_checksum(&mut frame);
        frame
    }

    fn v1_message(msg_type: u8, group: Ipv6Addr) -> Vec<u8> {
        let mut mld = vec![msg_type, 0, 0, 0, 0, 0, 0, 0];
        mld.extend_from_slice(&group.octets());
        mld
    }

    pub fn v1_report_frame(src: Ipv6Addr, group: Ipv6Addr) -> Vec<u8> {
        wrap_mld(src, group, &v1_message(MLD_V1_REPORT, group))
    }

    pub fn v1_done_frame(src: Ipv6Addr, group: Ipv6Addr) -> Vec<u8> {
        let all_routers = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);
        wrap_mld(src, all_routers, &v1_message(MLD_V1_DONE, group))
    }

    pub fn v2_query_frame(
        src: Ipv6Addr,
        group: Ipv6Addr,
        qrv: u8,
        qqic: u8,
        response: u16,
        s_flag: bool,
    ) -> Vec<u8> {
        let mut mld = vec![MLD_QUERY, 0, 0, 0];
        mld.extend_from_slice(&response.to_be_bytes());
        mld.extend_from_slice(&[0, 0]);
        mld.extend_from_slice(&group.octets());
        mld.push(if s_flag { 0x08 | qrv } else { qrv });
        mld.push(qqic);
        mld.extend_from_slice(&[0, 0]);
        wrap_mld(src, ALL_NODES, &mld)
    }

    pub fn v1_query_frame(src: Ipv6Addr, group: Ipv6Addr) -> Vec<u8> {
        let mut mld = vec![MLD_QUERY, 0, 0, 0];
        mld.extend_from_slice(&10_000u16.to_be_bytes());
        mld.extend_from_slice(&[0, 0]);
        mld.extend_from_slice(&group.octets());
        wrap_mld(src, ALL_NODES, &mld)
    }

    /// Build a v2 report from (record type, group, source count) triples.
    pub fn v2_report_frame(src: Ipv6Addr, records: &[(u8, Ipv6Addr, u16)]) -> Vec<u8> {
        let all_routers_v2 = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16);
        let mut mld = vec![MLD_V2_REPORT, 0, 0, 0, 0, 0];
        mld.extend_from_slice(&(records.len() as u16).to_be_bytes());
        for (rec_type, group, num_srcs) in records {
            mld.push(*rec_type);
            mld.push(0);
            mld.extend_from_slice(&num_srcs.to_be_bytes());
            mld.extend_from_slice(&group.octets());
            for i in 0..*num_srcs {
                mld.extend_from_slice(
                    &Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i).octets(),
                );
            }
        }
        wrap_mld(src, all_routers_v2, &mld)
    }

    pub fn mrd_solicitation_frame(src: Ipv6Addr) -> Vec<u8> {
        let all_routers = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);
        wrap_mld(src, all_routers, &[MLD_MRD_SOLICITATION, 0, 0, 0])
    }

    /// Truncate a built v2 report frame to `keep` bytes of MLD payload,
    /// fixing up lengths so only the checksum region shrinks.
    pub fn truncate_mld(frame: &mut Vec<u8>, keep: usize) {
        frame.truncate(MLD_OFFSET + keep);
        let payload_len = (HBH_LEN + keep) as u16;
        frame[IP_OFFSET + 4..IP_OFFSET + 6].copy_from_slice(&payload_len.to_be_bytes());
        finalize_mld_checksum(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];

    fn own() -> Ipv6Addr {
        "fe80::3".parse().unwrap()
    }

    #[test]
    fn test_multicast_mac_low_32_bits() {
        assert_eq!(
            multicast_mac(ALL_NODES),
            [0x33, 0x33, 0x00, 0x00, 0x00, 0x01]
        );
        let group: Ipv6Addr = "ff05::7500".parse().unwrap();
        assert_eq!(multicast_mac(group), [0x33, 0x33, 0x00, 0x00, 0x75, 0x00]);
    }

    #[test]
    fn test_general_query_frame_layout() {
        let frame = build_general_query(MAC, own());

        assert_eq!(&frame[0..6], &[0x33, 0x33, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), 0x86dd);

        // IPv6: version 6, payload 36, next header Hop-by-Hop, hop limit 1
        assert_eq!(frame[14] >> 4, 6);
        assert_eq!(u16::from_be_bytes([frame[18], frame[19]]), 36);
        assert_eq!(frame[20], 0);
        assert_eq!(frame[21], 1);
        assert_eq!(&frame[22..38], &own().octets());
        assert_eq!(&frame[38..54], &ALL_NODES.octets());

        // Hop-by-Hop: ICMPv6 next, zero extension length, RA + PadN
        assert_eq!(frame[54], 58);
        assert_eq!(frame[55], 0);
        assert_eq!(&frame[56..60], &[0x05, 0x02, 0x00, 0x00]);
        assert_eq!(&frame[60..62], &[0x01, 0x00]);

        // MLD v2 query: response 10000 ms, group zero, QRV 2, QQIC 125
        assert_eq!(frame[62], MLD_QUERY);
        assert_eq!(u16::from_be_bytes([frame[66], frame[67]]), 10_000);
        assert!(frame[70..86].iter().all(|&b| b == 0));
        assert_eq!(frame[86], 2);
        assert_eq!(frame[87], 125);

        // Checksum verifies with the pseudo header
        assert_eq!(
            inet6_checksum(&frame[62..], &own(), &ALL_NODES, 58),
            0
        );
    }

    #[test]
    fn test_mrd_advertisement_frame() {
        let frame = build_mrd_advertisement(MAC, own());

        assert_eq!(&frame[0..6], &[0x33, 0x33, 0x00, 0x00, 0x00, 0x6a]);
        assert_eq!(&frame[38..54], &ALL_SNOOPERS.octets());
        assert_eq!(frame[62], MLD_MRD_ADVERTISEMENT);
        assert_eq!(frame[63], 20);
        assert_eq!(u16::from_be_bytes([frame[66], frame[67]]), 125);
        assert_eq!(u16::from_be_bytes([frame[68], frame[69]]), 2);
        assert_eq!(
            inet6_checksum(&frame[62..], &own(), &ALL_SNOOPERS, 58),
            0
        );
    }

    #[test]
    fn test_group_query_patching() {
        let mut frame = build_group_query_template(MAC, own());
        let group: Ipv6Addr = "ff05::7500".parse().unwrap();

        patch_group_query(&mut frame, group, false);
        assert_eq!(&frame[0..6], &[0x33, 0x33, 0x00, 0x00, 0x75, 0x00]);
        assert_eq!(&frame[38..54], &group.octets());
        assert_eq!(&frame[70..86], &group.octets());
        assert_eq!(u16::from_be_bytes([frame[66], frame[67]]), 1_000);
        assert_eq!(frame[86], 2);
        assert_eq!(inet6_checksum(&frame[62..], &own(), &group, 58), 0);

        patch_group_query(&mut frame, group, true);
        assert_eq!(frame[86], 0x0a);
        assert_eq!(inet6_checksum(&frame[62..], &own(), &group, 58), 0);
    }

    #[test]
    fn test_parse_emitted_query() {
        let frame = build_general_query(MAC, own());
        match parse_frame(&frame, "fe80::9".parse().unwrap()) {
            ParseOutcome::Packet {
                src,
                packet: MldPacket::Query(info),
            } => {
                assert_eq!(src, own());
                assert_eq!(info.group, Ipv6Addr::UNSPECIFIED);
                let v2 = info.v2.expect("v2 fields");
                assert_eq!(v2.qrv, 2);
                assert_eq!(v2.qqic, 125);
                assert_eq!(v2.response, 10_000);
                assert!(!v2.s_flag);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(parse_frame(&frame, own()), ParseOutcome::Own));
    }

    #[test]
    fn test_parse_v1_report_and_done() {
        let src: Ipv6Addr = "fe80::5".parse().unwrap();
        let group: Ipv6Addr = "ff05::7500".parse().unwrap();

        let report = testutil::v1_report_frame(src, group);
        assert!(matches!(
            parse_frame(&report, own()),
            ParseOutcome::Packet {
                packet: MldPacket::V1Report { group: g },
                ..
            } if g == group
        ));

        let done = testutil::v1_done_frame(src, group);
        assert!(matches!(
            parse_frame(&done, own()),
            ParseOutcome::Packet {
                packet: MldPacket::V1Done { group: g },
                ..
            } if g == group
        ));
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let src: Ipv6Addr = "fe80::5".parse().unwrap();
        let group: Ipv6Addr = "ff05::7500".parse().unwrap();
        let mut frame = testutil::v1_report_frame(src, group);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        match parse_frame(&frame, own()) {
            ParseOutcome::Invalid { error, .. } => {
                assert_eq!(error, MldParseError::MldChecksum)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_router_alert() {
        let src: Ipv6Addr = "fe80::5".parse().unwrap();
        let group: Ipv6Addr = "ff05::7500".parse().unwrap();
        let mut frame = testutil::v1_report_frame(src, group);
        frame[56] = 0x01; // clobber the RA option in both slots
        frame[58] = 0x01;
        match parse_frame(&frame, own()) {
            ParseOutcome::Invalid { error, .. } => {
                assert_eq!(error, MldParseError::NoRouterAlert)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_v2_report_truncation() {
        let src: Ipv6Addr = "fe80::5".parse().unwrap();
        let g1: Ipv6Addr = "ff05::1".parse().unwrap();
        let g2: Ipv6Addr = "ff05::2".parse().unwrap();
        let g3: Ipv6Addr = "ff05::3".parse().unwrap();

        // Three records claimed, but the third is cut in half
        let mut frame = testutil::v2_report_frame(
            src,
            &[
                (crate::protocols::REC_MODE_IS_EXCLUDE, g1, 0),
                (crate::protocols::REC_MODE_IS_EXCLUDE, g2, 0),
                (crate::protocols::REC_MODE_IS_EXCLUDE, g3, 0),
            ],
        );
        testutil::truncate_mld(&mut frame, 8 + 20 + 20 + 10);

        match parse_frame(&frame, own()) {
            ParseOutcome::Packet {
                packet: MldPacket::V2Report(iter),
                ..
            } => {
                let records: Vec<_> = iter.collect();
                assert_eq!(records.len(), 3);
                assert_eq!(records[0].as_ref().unwrap().group, g1);
                assert_eq!(records[1].as_ref().unwrap().group, g2);
                assert_eq!(records[2], Err(MldParseError::RecordHeaderOverrun));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_solicitation() {
        let src: Ipv6Addr = "fe80::5".parse().unwrap();
        let frame = testutil::mrd_solicitation_frame(src);
        assert!(matches!(
            parse_frame(&frame, own()),
            ParseOutcome::Packet {
                packet: MldPacket::MrdSolicitation,
                ..
            }
        ));
    }
}
