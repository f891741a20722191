//! Raw L2 capture and injection, one handle per interface.

use std::os::fd::RawFd;

use anyhow::{Context, Result};
use pcap::{Active, Capture};

use crate::logging::{Facility, Logger};
use crate::log_warning;
use crate::MCAST_MAX_PACKET_SIZE;

/// A link-layer port the control plane receives from and injects into.
/// Production ports are pcap handles; tests substitute in-memory ports.
pub trait LinkPort: Send {
    /// File descriptor to wait on for readability
    fn raw_fd(&self) -> RawFd;

    /// Copy the next captured frame into `buf`, if one is pending
    fn capture_next(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Inject a frame onto the link
    fn inject(&mut self, frame: &[u8]) -> Result<()>;
}

/// Pcap-backed link port: promiscuous, immediate delivery, maximum UDP
/// snap length, BPF-filtered, non-blocking.
pub struct PcapPort {
    capture: Capture<Active>,
    fd: RawFd,
    interface: String,
    logger: Logger,
    facility: Facility,
}

impl PcapPort {
    pub fn open(
        interface: &str,
        filter: &str,
        logger: Logger,
        facility: Facility,
    ) -> Result<Self> {
        let mut capture = Capture::from_device(interface)
            .with_context(|| format!("pcap create for interface {} failed", interface))?
            .promisc(true)
            .snaplen(MCAST_MAX_PACKET_SIZE as i32)
            .immediate_mode(true)
            .open()
            .with_context(|| format!("pcap activate for interface {} failed", interface))?;

        capture
            .filter(filter, true)
            .with_context(|| format!("pcap filter for interface {} failed", interface))?;

        let capture = capture
            .setnonblock()
            .with_context(|| format!("pcap setnonblock for interface {} failed", interface))?;

        use std::os::fd::AsRawFd;
        let fd = capture.as_raw_fd();

        Ok(Self {
            capture,
            fd,
            interface: interface.to_string(),
            logger,
            facility,
        })
    }
}

impl LinkPort for PcapPort {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn capture_next(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.capture.next_packet() {
            Ok(packet) => {
                let len = packet.data.len().min(buf.len());
                buf[..len].copy_from_slice(&packet.data[..len]);
                Some(len)
            }
            Err(pcap::Error::TimeoutExpired) => None,
            Err(e) => {
                log_warning!(
                    self.logger,
                    self.facility,
                    "({}): pcap read failed: {}",
                    self.interface,
                    e
                );
                None
            }
        }
    }

    fn inject(&mut self, frame: &[u8]) -> Result<()> {
        self.capture
            .sendpacket(frame)
            .with_context(|| format!("pcap inject on {} failed", self.interface))
    }
}
