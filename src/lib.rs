// SPDX-License-Identifier: Apache-2.0 OR MIT
//! User-space multicast bridging daemon.
//!
//! Bridges UDP multicast traffic between Layer-2 interfaces on the same
//! host, for IPv4 and IPv6. Dynamic forwarding is driven by an on-wire
//! IGMP (v1/v2/v3) and MLD (v1/v2) membership-tracking control plane with
//! Multicast Router Discovery advertisements (RFC 4286).

use clap::ValueEnum;
use serde::Deserialize;

pub mod bridge;
pub mod capture;
pub mod config;
pub mod event;
pub mod igmp;
pub mod interface;
pub mod logging;
pub mod mld;
pub mod protocols;

/// Maximum UDP datagram we support. The practical limit for IPv4 is 65507
/// and for IPv6 is 65495, but the capture snap length covers the theoretical
/// 16-bit maximum.
pub const MCAST_MAX_PACKET_SIZE: usize = 65535;

/// Number of ad-hoc learned groups allowed per interface beyond the
/// configured (fixed) ones.
pub const DEFAULT_NON_CONFIGURED_GROUPS: usize = 100;

/// Querier operating mode, selected independently for IGMP and MLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerierMode {
    /// The querier function is disabled.
    Never,
    /// Become a querier immediately at startup (RFC behavior).
    #[default]
    Quick,
    /// Become a querier after 125 seconds if no other querier has been seen.
    Delay,
    /// Like Delay, and always defer to any other querier that appears,
    /// regardless of relative address.
    Defer,
}

impl QuerierMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            QuerierMode::Never => "Never",
            QuerierMode::Quick => "Quick",
            QuerierMode::Delay => "Delay",
            QuerierMode::Defer => "Defer",
        }
    }
}

impl std::fmt::Display for QuerierMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_querier_mode_default() {
        assert_eq!(QuerierMode::default(), QuerierMode::Quick);
    }

    #[test]
    fn test_querier_mode_display() {
        assert_eq!(format!("{}", QuerierMode::Never), "Never");
        assert_eq!(format!("{}", QuerierMode::Defer), "Defer");
    }
}
