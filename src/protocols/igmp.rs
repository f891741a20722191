// SPDX-License-Identifier: Apache-2.0 OR MIT
//! IGMP frame building and parsing (RFC 2236 / RFC 3376 / RFC 9776),
//! plus the IPv4 flavor of Multicast Router Discovery (RFC 4286).
//!
//! Expected packet format:
//!   Ethernet header
//!   IPv4 header
//!   Router Alert option
//!   IGMP header

use std::net::Ipv4Addr;

use thiserror::Error;

use super::{inet_checksum, ETHERNET_HEADER_LEN, ETHERNET_TYPE_IPV4, MRD_INTERVAL_SECS};

// IGMP message types
pub const IGMP_QUERY: u8 = 0x11;
pub const IGMP_V1_REPORT: u8 = 0x12;
pub const IGMP_V2_REPORT: u8 = 0x16;
pub const IGMP_V2_LEAVE: u8 = 0x17;
pub const IGMP_V3_REPORT: u8 = 0x22;
pub const IGMP_MRD_ADVERTISEMENT: u8 = 0x30;
pub const IGMP_MRD_SOLICITATION: u8 = 0x31;
pub const IGMP_MRD_TERMINATION: u8 = 0x32;

// IGMP protocol parameters (defaults from RFC 2236 & RFC 9776)
pub const IGMP_ROBUSTNESS: u32 = 2;
pub const IGMP_QUERY_INTERVAL_SECS: u32 = 125;
pub const IGMP_RESPONSE_INTERVAL_TENTHS: u32 = 100;
pub const IGMP_LASTMBR_INTERVAL_TENTHS: u32 = 10;

/// All systems group (general query destination)
pub const ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// All snoopers group (MRD advertisement destination)
pub const ALL_SNOOPERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 106);
/// Sentinel querier address meaning "unknown / open election"
pub const QUERIER_UNKNOWN: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

const IP_PROTOCOL_IGMP: u8 = 2;
const IP_OFF_DF: u16 = 0x4000;
const IP_OPT_RA: u8 = 0x94;
const IP_TOS_IC: u8 = 0xc0;

const IP_OFFSET: usize = ETHERNET_HEADER_LEN;
// The emitted IP header always carries the 4-byte Router Alert option
const IP_HEADER_LEN: usize = 24;
const IGMP_OFFSET: usize = IP_OFFSET + IP_HEADER_LEN;

const MRD_ADVERT_LEN: usize = 8;
const V3_QUERY_LEN: usize = 12;

/// Emitted MRD advertisement frame size
pub const MRD_ADVERT_FRAME_LEN: usize = IGMP_OFFSET + MRD_ADVERT_LEN;
/// Emitted query frame size (always the v3 query layout)
pub const QUERY_FRAME_LEN: usize = IGMP_OFFSET + V3_QUERY_LEN;

/// Map an IPv4 multicast address to its Ethernet destination:
/// 01:00:5e followed by the low 23 bits of the group address.
pub fn multicast_mac(group: Ipv4Addr) -> [u8; 6] {
    let g = group.octets();
    [0x01, 0x00, 0x5e, g[1] & 0x7f, g[2], g[3]]
}

// Fill the Ethernet, IPv4 and Router Alert headers shared by all emitted
// packets. The Ethernet and IP destinations are left for the caller, and
// the IP checksum is computed after the destination is known.
fn build_headers(frame: &mut [u8], src_mac: [u8; 6], src_addr: Ipv4Addr, igmp_len: usize) {
    frame[0..3].copy_from_slice(&[0x01, 0x00, 0x5e]);
    frame[6..12].copy_from_slice(&src_mac);
    frame[12..14].copy_from_slice(&ETHERNET_TYPE_IPV4.to_be_bytes());

    let ip = &mut frame[IP_OFFSET..];
    ip[0] = 0x40 | (IP_HEADER_LEN as u8 >> 2);
    ip[1] = IP_TOS_IC;
    ip[2..4].copy_from_slice(&((IP_HEADER_LEN + igmp_len) as u16).to_be_bytes());
    ip[6..8].copy_from_slice(&IP_OFF_DF.to_be_bytes());
    ip[8] = 1; // TTL
    ip[9] = IP_PROTOCOL_IGMP;
    ip[12..16].copy_from_slice(&src_addr.octets());

    // Router Alert option
    ip[20] = IP_OPT_RA;
    ip[21] = 4;
}

fn set_destination(frame: &mut [u8], dst: Ipv4Addr) {
    frame[0..6].copy_from_slice(&multicast_mac(dst));
    frame[IP_OFFSET + 16..IP_OFFSET + 20].copy_from_slice(&dst.octets());
}

fn finalize_ip_checksum(frame: &mut [u8]) {
    frame[IP_OFFSET + 10..IP_OFFSET + 12].copy_from_slice(&[0, 0]);
    let csum = inet_checksum(&frame[IP_OFFSET..IP_OFFSET + IP_HEADER_LEN]);
    frame[IP_OFFSET + 10..IP_OFFSET + 12].copy_from_slice(&csum.to_be_bytes());
}

fn finalize_igmp_checksum(frame: &mut [u8]) {
    frame[IGMP_OFFSET + 2..IGMP_OFFSET + 4].copy_from_slice(&[0, 0]);
    let csum = inet_checksum(&frame[IGMP_OFFSET..]);
    frame[IGMP_OFFSET + 2..IGMP_OFFSET + 4].copy_from_slice(&csum.to_be_bytes());
}

/// Build the Multicast Router Discovery advertisement frame for an
/// interface. The frame is immutable once built.
pub fn build_mrd_advertisement(src_mac: [u8; 6], src_addr: Ipv4Addr) -> [u8; MRD_ADVERT_FRAME_LEN] {
    let mut frame = [0u8; MRD_ADVERT_FRAME_LEN];
    build_headers(&mut frame, src_mac, src_addr, MRD_ADVERT_LEN);
    set_destination(&mut frame, ALL_SNOOPERS);

    let mrd = &mut frame[IGMP_OFFSET..];
    mrd[0] = IGMP_MRD_ADVERTISEMENT;
    mrd[1] = MRD_INTERVAL_SECS as u8;
    mrd[4..6].copy_from_slice(&(IGMP_QUERY_INTERVAL_SECS as u16).to_be_bytes());
    mrd[6..8].copy_from_slice(&(IGMP_ROBUSTNESS as u16).to_be_bytes());

    finalize_ip_checksum(&mut frame);
    finalize_igmp_checksum(&mut frame);
    frame
}

/// Build the general query frame for an interface. The frame is
/// immutable once built.
pub fn build_general_query(src_mac: [u8; 6], src_addr: Ipv4Addr) -> [u8; QUERY_FRAME_LEN] {
    let mut frame = [0u8; QUERY_FRAME_LEN];
    build_headers(&mut frame, src_mac, src_addr, V3_QUERY_LEN);
    set_destination(&mut frame, ALL_SYSTEMS);

    let igmp = &mut frame[IGMP_OFFSET..];
    igmp[0] = IGMP_QUERY;
    igmp[1] = IGMP_RESPONSE_INTERVAL_TENTHS as u8;
    // group address zero, S flag clear
    igmp[8] = IGMP_ROBUSTNESS as u8;
    igmp[9] = IGMP_QUERY_INTERVAL_SECS as u8;

    finalize_ip_checksum(&mut frame);
    finalize_igmp_checksum(&mut frame);
    frame
}

/// Build the group-specific query template for an interface. The
/// destination, group address, S flag and checksums are patched per
/// emission by [`patch_group_query`].
pub fn build_group_query_template(
    src_mac: [u8; 6],
    src_addr: Ipv4Addr,
) -> [u8; QUERY_FRAME_LEN] {
    let mut frame = [0u8; QUERY_FRAME_LEN];
    build_headers(&mut frame, src_mac, src_addr, V3_QUERY_LEN);

    let igmp = &mut frame[IGMP_OFFSET..];
    igmp[0] = IGMP_QUERY;
    igmp[1] = IGMP_LASTMBR_INTERVAL_TENTHS as u8;
    igmp[8] = IGMP_ROBUSTNESS as u8;
    igmp[9] = IGMP_QUERY_INTERVAL_SECS as u8;

    frame
}

/// Patch a group-specific query template with the target group and the
/// S flag, and recompute both checksums.
pub fn patch_group_query(frame: &mut [u8; QUERY_FRAME_LEN], group: Ipv4Addr, s_flag: bool) {
    set_destination(frame, group);
    frame[IGMP_OFFSET + 4..IGMP_OFFSET + 8].copy_from_slice(&group.octets());
    if s_flag {
        frame[IGMP_OFFSET + 8] |= 0x08;
    } else {
        frame[IGMP_OFFSET + 8] &= !0x08;
    }
    finalize_ip_checksum(frame);
    finalize_igmp_checksum(frame);
}

/// Parse failure, logged at debug level 2 and dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IgmpParseError {
    #[error("Packet too short to contain an IPv4 header")]
    TruncatedIp,
    #[error("Packet is not an IPv4 packet")]
    NotIpv4,
    #[error("IP header overrun")]
    IpHeaderOverrun,
    #[error("IP checksum error")]
    IpChecksum,
    #[error("IP packet overrun")]
    IpOverrun,
    #[error("Packet is not an IGMP packet")]
    NotIgmp,
    #[error("IP header too short to contain a Router Alert option")]
    ShortRouterAlert,
    #[error("Packet does not contain a Router Alert option")]
    NoRouterAlert,
    #[error("Packet too short to contain an IGMP header")]
    TruncatedIgmp,
    #[error("IGMP checksum error")]
    IgmpChecksum,
    #[error("Packet too short to contain an IGMP query")]
    TruncatedQuery,
    #[error("Packet too short to contain an IGMP v1 report")]
    TruncatedV1Report,
    #[error("Packet too short to contain an IGMP v2 report")]
    TruncatedV2Report,
    #[error("Packet too short to contain an IGMP leave")]
    TruncatedLeave,
    #[error("Packet too short to contain an IGMP v3 report")]
    TruncatedV3Report,
    #[error("Group record header overrun in IGMP v3 report")]
    RecordHeaderOverrun,
    #[error("Group record data overrun in IGMP v3 report")]
    RecordDataOverrun,
    #[error("Unknown IGMP type received")]
    UnknownType,
}

/// Protocol parameters carried by a v3 query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryV3Fields {
    pub s_flag: bool,
    pub qrv: u8,
    pub qqic: u8,
    pub code: u8,
}

/// A received membership query. `v3` is `None` for v1/v2 queries, which
/// carry no querier parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryInfo {
    pub group: Ipv4Addr,
    pub v3: Option<QueryV3Fields>,
}

/// One group record of a v3 report. Source addresses are not retained:
/// membership is tracked at the group level only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRecord {
    pub rec_type: u8,
    pub group: Ipv4Addr,
    pub num_srcs: u16,
}

/// Iterator over the group records of a v3 report. Yields an error and
/// then stops if the buffer runs out before the claimed record count.
#[derive(Debug, Clone)]
pub struct GroupRecordIter<'a> {
    buf: &'a [u8],
    remaining: u16,
    failed: bool,
}

impl<'a> Iterator for GroupRecordIter<'a> {
    type Item = Result<GroupRecord, IgmpParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        if self.buf.len() < 8 {
            self.failed = true;
            return Some(Err(IgmpParseError::RecordHeaderOverrun));
        }

        let rec_type = self.buf[0];
        let aux_len = self.buf[1] as usize;
        let num_srcs = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        let group = Ipv4Addr::new(self.buf[4], self.buf[5], self.buf[6], self.buf[7]);

        let record_len = 8 + num_srcs as usize * 4 + aux_len * 4;
        if self.buf.len() < record_len {
            self.failed = true;
            return Some(Err(IgmpParseError::RecordDataOverrun));
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

/// Decoded IGMP message
#[derive(Debug, Clone)]
pub enum IgmpPacket<'a> {
    Query(QueryInfo),
    V1Report { group: Ipv4Addr },
    V2Report { group: Ipv4Addr },
    V2Leave { group: Ipv4Addr },
    V3Report(GroupRecordIter<'a>),
    MrdSolicitation,
    /// MRD advertisement or termination, ignored silently
    Ignored,
}

/// Result of parsing a captured frame
#[derive(Debug, Clone)]
pub enum ParseOutcome<'a> {
    Packet {
        src: Ipv4Addr,
        packet: IgmpPacket<'a>,
    },
    /// Our own transmission looped back by the capture handle
    Own,
    Invalid {
        src: Option<Ipv4Addr>,
        error: IgmpParseError,
    },
}

fn invalid(src: Option<Ipv4Addr>, error: IgmpParseError) -> ParseOutcome<'static> {
    ParseOutcome::Invalid { src, error }
}

/// Parse a captured Ethernet frame, validating each layer. Packets whose
/// source address equals `own_addr` are dropped as our own.
pub fn parse_frame(frame: &[u8], own_addr: Ipv4Addr) -> ParseOutcome<'_> {
    if frame.len() < IP_OFFSET + 20 {
        return invalid(None, IgmpParseError::TruncatedIp);
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERNET_TYPE_IPV4 {
        return invalid(None, IgmpParseError::NotIpv4);
    }

    let ip = &frame[IP_OFFSET..];
    let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    if src == own_addr {
        return ParseOutcome::Own;
    }

    let ip_header_len = ((ip[0] & 0x0f) as usize) << 2;
    if ip_header_len > ip.len() {
        return invalid(Some(src), IgmpParseError::IpHeaderOverrun);
    }
    if inet_checksum(&ip[..ip_header_len]) != 0 {
        return invalid(Some(src), IgmpParseError::IpChecksum);
    }

    let ip_total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ip_total_len > ip.len() {
        return invalid(Some(src), IgmpParseError::IpOverrun);
    }
    if ip[9] != IP_PROTOCOL_IGMP {
        return invalid(Some(src), IgmpParseError::NotIgmp);
    }
    if ip_header_len < 24 {
        return invalid(Some(src), IgmpParseError::ShortRouterAlert);
    }
    if ip[20] != IP_OPT_RA || ip[21] != 4 {
        return invalid(Some(src), IgmpParseError::NoRouterAlert);
    }
    if ip_total_len < ip_header_len {
        return invalid(Some(src), IgmpParseError::TruncatedIgmp);
    }

    let igmp = &ip[ip_header_len..ip_total_len];
    if igmp.len() < 4 {
        return invalid(Some(src), IgmpParseError::TruncatedIgmp);
    }
    if inet_checksum(igmp) != 0 {
        return invalid(Some(src), IgmpParseError::IgmpChecksum);
    }

    let packet = match igmp[0] {
        IGMP_QUERY => {
            if igmp.len() < 8 {
                return invalid(Some(src), IgmpParseError::TruncatedQuery);
            }
            let group = Ipv4Addr::new(igmp[4], igmp[5], igmp[6], igmp[7]);
            let v3 = if igmp.len() >= V3_QUERY_LEN {
                Some(QueryV3Fields {
                    s_flag: igmp[8] & 0x08 != 0,
                    qrv: igmp[8] & 0x07,
                    qqic: igmp[9],
                    code: igmp[1],
                })
            } else {
                None
            };
            IgmpPacket::Query(QueryInfo { group, v3 })
        }
        IGMP_V1_REPORT => {
            if igmp.len() < 8 {
                return invalid(Some(src), IgmpParseError::TruncatedV1Report);
            }
            IgmpPacket::V1Report {
                group: Ipv4Addr::new(igmp[4], igmp[5], igmp[6], igmp[7]),
            }
        }
        IGMP_V2_REPORT => {
            if igmp.len() < 8 {
                return invalid(Some(src), IgmpParseError::TruncatedV2Report);
            }
            IgmpPacket::V2Report {
                group: Ipv4Addr::new(igmp[4], igmp[5], igmp[6], igmp[7]),
            }
        }
        IGMP_V2_LEAVE => {
            if igmp.len() < 8 {
                return invalid(Some(src), IgmpParseError::TruncatedLeave);
            }
            IgmpPacket::V2Leave {
                group: Ipv4Addr::new(igmp[4], igmp[5], igmp[6], igmp[7]),
            }
        }
        IGMP_V3_REPORT => {
            if igmp.len() < 8 {
                return invalid(Some(src), IgmpParseError::TruncatedV3Report);
            }
            let num_groups = u16::from_be_bytes([igmp[6], igmp[7]]);
            IgmpPacket::V3Report(GroupRecordIter {
                buf: &igmp[8..],
                remaining: num_groups,
                failed: false,
            })
        }
        IGMP_MRD_SOLICITATION => IgmpPacket::MrdSolicitation,
        IGMP_MRD_ADVERTISEMENT | IGMP_MRD_TERMINATION => IgmpPacket::Ignored,
        _ => return invalid(Some(src), IgmpParseError::UnknownType),
    };

    ParseOutcome::Packet { src, packet }
}


#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
    const ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

    #[test]
    fn test_multicast_mac_low_23_bits() {
        assert_eq!(
            multicast_mac(Ipv4Addr::new(224, 0, 0, 1)),
            [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]
        );
        // 239.129.1.2: second octet has its high bit masked off
        assert_eq!(
            multicast_mac(Ipv4Addr::new(239, 129, 1, 2)),
            [0x01, 0x00, 0x5e, 0x01, 0x01, 0x02]
        );
    }

    #[test]
    fn test_general_query_frame_layout() {
        let frame = build_general_query(MAC, ADDR);

        assert_eq!(&frame[0..6], &[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
        assert_eq!(&frame[6..12], &MAC);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), 0x0800);

        // version 4, IHL 6 words, TOS 0xc0, DF, TTL 1, protocol IGMP
        assert_eq!(frame[14], 0x46);
        assert_eq!(frame[15], 0xc0);
        assert_eq!(u16::from_be_bytes([frame[20], frame[21]]), 0x4000);
        assert_eq!(frame[22], 1);
        assert_eq!(frame[23], 2);
        assert_eq!(&frame[26..30], &ADDR.octets());
        assert_eq!(&frame[30..34], &[224, 0, 0, 1]);

        // Router Alert option
        assert_eq!(&frame[34..38], &[0x94, 0x04, 0x00, 0x00]);

        // IGMP v3 general query: group zero, QRV 2, QQIC 125
        assert_eq!(frame[38], IGMP_QUERY);
        assert_eq!(frame[39], 100);
        assert_eq!(&frame[42..46], &[0, 0, 0, 0]);
        assert_eq!(frame[46], 2);
        assert_eq!(frame[47], 125);

        // Both checksums verify
        assert_eq!(inet_checksum(&frame[14..38]), 0);
        assert_eq!(inet_checksum(&frame[38..]), 0);
    }

    #[test]
    fn test_mrd_advertisement_frame() {
        let frame = build_mrd_advertisement(MAC, ADDR);

        assert_eq!(&frame[0..6], &[0x01, 0x00, 0x5e, 0x00, 0x00, 0x6a]);
        assert_eq!(&frame[30..34], &[224, 0, 0, 106]);
        assert_eq!(frame[38], IGMP_MRD_ADVERTISEMENT);
        assert_eq!(frame[39], 20);
        assert_eq!(u16::from_be_bytes([frame[42], frame[43]]), 125);
        assert_eq!(u16::from_be_bytes([frame[44], frame[45]]), 2);
        assert_eq!(inet_checksum(&frame[14..38]), 0);
        assert_eq!(inet_checksum(&frame[38..]), 0);
    }

    #[test]
    fn test_group_query_patching() {
        let mut frame = build_group_query_template(MAC, ADDR);
        let group = Ipv4Addr::new(239, 0, 75, 0);

        patch_group_query(&mut frame, group, false);
        assert_eq!(&frame[0..6], &[0x01, 0x00, 0x5e, 0x00, 0x4b, 0x00]);
        assert_eq!(&frame[30..34], &group.octets());
        assert_eq!(&frame[42..46], &group.octets());
        assert_eq!(frame[39], 10); // last-member interval code
        assert_eq!(frame[46], 2); // S clear, QRV 2
        assert_eq!(inet_checksum(&frame[14..38]), 0);
        assert_eq!(inet_checksum(&frame[38..]), 0);

        // Re-patch the same template with the S flag and another group
        let group2 = Ipv4Addr::new(239, 1, 2, 3);
        patch_group_query(&mut frame, group2, true);
        assert_eq!(&frame[42..46], &group2.octets());
        assert_eq!(frame[46], 0x0a); // S set, QRV 2
        assert_eq!(inet_checksum(&frame[14..38]), 0);
        assert_eq!(inet_checksum(&frame[38..]), 0);
    }

    #[test]
    fn test_parse_own_emitted_query() {
        let frame = build_general_query(MAC, ADDR);
        // From a peer's perspective the frame parses as a v3 query
        match parse_frame(&frame, Ipv4Addr::new(10, 0, 0, 9)) {
            ParseOutcome::Packet {
                src,
                packet: IgmpPacket::Query(info),
            } => {
                assert_eq!(src, ADDR);
                assert_eq!(info.group, Ipv4Addr::UNSPECIFIED);
                let v3 = info.v3.expect("v3 fields");
                assert_eq!(v3.qrv, 2);
                assert_eq!(v3.qqic, 125);
                assert_eq!(v3.code, 100);
                assert!(!v3.s_flag);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // From our own perspective it is dropped
        assert!(matches!(parse_frame(&frame, ADDR), ParseOutcome::Own));
    }

    #[test]
    fn test_parse_v2_report() {
        let group = Ipv4Addr::new(239, 0, 75, 0);
        let frame = testutil::v2_report_frame(Ipv4Addr::new(10, 0, 0, 5), group);
        match parse_frame(&frame, ADDR) {
            ParseOutcome::Packet {
                src,
                packet: IgmpPacket::V2Report { group: g },
            } => {
                assert_eq!(src, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(g, group);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut frame = testutil::v2_report_frame(Ipv4Addr::new(10, 0, 0, 5), ADDR);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        match parse_frame(&frame, ADDR) {
            ParseOutcome::Invalid { error, .. } => {
                assert_eq!(error, IgmpParseError::IgmpChecksum)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_router_alert() {
        let group = Ipv4Addr::new(239, 0, 75, 0);
        let mut frame = testutil::v2_report_frame(Ipv4Addr::new(10, 0, 0, 5), group);
        frame[34] = 0x00; // clobber the RA option type
        finalize_ip_checksum(&mut frame);
        match parse_frame(&frame, ADDR) {
            ParseOutcome::Invalid { error, .. } => {
                assert_eq!(error, IgmpParseError::NoRouterAlert)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_short_frame() {
        let frame = [0u8; 20];
        match parse_frame(&frame, ADDR) {
            ParseOutcome::Invalid { src, error } => {
                assert_eq!(src, None);
                assert_eq!(error, IgmpParseError::TruncatedIp);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_v3_report_records() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let g1 = Ipv4Addr::new(239, 1, 1, 1);
        let g2 = Ipv4Addr::new(239, 2, 2, 2);
        let frame = testutil::v3_report_frame(
            src,
            &[
                (super::super::REC_ALLOW_NEW_SOURCES, g1, 2),
                (super::super::REC_CHANGE_TO_INCLUDE, g2, 0),
            ],
        );
        match parse_frame(&frame, ADDR) {
            ParseOutcome::Packet {
                packet: IgmpPacket::V3Report(iter),
                ..
            } => {
                let records: Vec<_> = iter.collect();
                assert_eq!(records.len(), 2);
                let first = records[0].as_ref().unwrap();
                assert_eq!(first.group, g1);
                assert_eq!(first.num_srcs, 2);
                let second = records[1].as_ref().unwrap();
                assert_eq!(second.group, g2);
                assert_eq!(second.num_srcs, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_v3_report_truncated_record() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let g1 = Ipv4Addr::new(239, 1, 1, 1);
        let frame = testutil::v3_report_frame(src, &[(super::super::REC_MODE_IS_EXCLUDE, g1, 0)]);
        // Claim three records while the buffer holds one
        let mut frame = frame;
        frame[44..46].copy_from_slice(&3u16.to_be_bytes());
        finalize_igmp_checksum(&mut frame);

        match parse_frame(&frame, ADDR) {
            ParseOutcome::Packet {
                packet: IgmpPacket::V3Report(iter),
                ..
            } => {
                let records: Vec<_> = iter.collect();
                assert_eq!(records.len(), 2);
                assert!(records[0].is_ok());
                assert_eq!(
                    records[1],
                    Err(IgmpParseError::RecordHeaderOverrun)
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let frame = testutil::wrap_igmp(
            Ipv4Addr::new(10, 0, 0, 5),
            ALL_SYSTEMS,
            &[0x99, 0, 0, 0, 0, 0, 0, 0],
        );
        match parse_frame(&frame, ADDR) {
            ParseOutcome::Invalid { error, .. } => {
                assert_eq!(error, IgmpParseError::UnknownType)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_mrd_types() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let frame = testutil::mrd_solicitation_frame(src);
        assert!(matches!(
            parse_frame(&frame, ADDR),
            ParseOutcome::Packet {
                packet: IgmpPacket::MrdSolicitation,
                ..
            }
        ));

        // Advertisements from other routers are silently ignored
        let advert = build_mrd_advertisement(MAC, src);
        assert!(matches!(
            parse_frame(&advert, ADDR),
            ParseOutcome::Packet {
                packet: IgmpPacket::Ignored,
                ..
            }
        ));
    }
}
