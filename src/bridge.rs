// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Data-plane forwarding loops, one thread per bridge instance.
//!
//! Each thread runs its own event loop over the instance's interface
//! sockets. Received datagrams are dropped unless the receiving
//! interface is inbound-active, then re-emitted on every outbound-active
//! peer. The active flags are written by the control-plane threads; a
//! stale read is tolerable because the flags are re-checked per packet.

use std::net::{SocketAddr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::event::{Event, EventLoop};
use crate::interface::{BridgeGroup, BridgeInstance};
use crate::logging::{Facility, Logger};
use crate::{log_debug, log_warning, MCAST_MAX_PACKET_SIZE};

/// The bridge loops schedule no timers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeTimer {}

fn bridge_receive(bridge: &BridgeInstance, slot: usize, buf: &mut [u8], logger: &Logger) {
    let iface = &bridge.interfaces[slot];

    let (len, src) = match iface.sock.recv_from(buf) {
        Ok(received) => received,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
        Err(e) => {
            log_warning!(
                logger,
                Facility::Bridge,
                "Bridge({}/{}): recvfrom error on interface {}: {}",
                bridge.group.family_str(),
                bridge.port,
                iface.name,
                e
            );
            return;
        }
    };

    // The socket stays bound while the interface is dormant
    if !iface.inbound_active() {
        return;
    }

    for (peer_slot, peer) in bridge.interfaces.iter().enumerate() {
        if peer_slot == slot || !peer.outbound_active() {
            continue;
        }

        let dst: SocketAddr = match bridge.group {
            BridgeGroup::V4(group) => (group, bridge.port).into(),
            // Scope the destination to the peer's link
            BridgeGroup::V6(group) => {
                SocketAddrV6::new(group, bridge.port, 0, peer.if_index).into()
            }
        };

        if let Err(e) = peer.sock.send_to(&buf[..len], dst) {
            log_warning!(
                logger,
                Facility::Bridge,
                "Bridge({}/{}): sendto error on interface {}: {}",
                bridge.group.family_str(),
                bridge.port,
                peer.name,
                e
            );
            continue;
        }

        if logger.debug_level() >= 4 {
            log_debug!(
                logger,
                Facility::Bridge,
                "Bridge({}/{}): Forwarded {} bytes from {} on {} to {}",
                bridge.group.family_str(),
                bridge.port,
                len,
                src,
                iface.name,
                peer.name
            );
        }
    }
}

/// Start one forwarding thread per bridge instance
pub fn spawn_bridges(
    bridges: &[Arc<BridgeInstance>],
    logger: &Logger,
) -> Result<Vec<std::thread::JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(bridges.len());

    for bridge in bridges {
        let mut evloop: EventLoop<BridgeTimer> =
            EventLoop::new(bridge.interfaces.len(), 0, logger.clone());
        for (slot, iface) in bridge.interfaces.iter().enumerate() {
            evloop.add_socket(iface.sock.as_raw_fd(), slot)?;
        }

        let bridge = Arc::clone(bridge);
        let logger = logger.clone();
        let name = format!("bridge-{}-{}", bridge.group.family_str(), bridge.port);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut buf = vec![0u8; MCAST_MAX_PACKET_SIZE];
                evloop.run(move |event, _ops| {
                    if let Event::Readable(slot) = event {
                        bridge_receive(&bridge, slot, &mut buf, &logger);
                    }
                });
            })
            .context("cannot create bridge thread")?;
        handles.push(handle);
    }

    Ok(handles)
}
