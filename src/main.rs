// SPDX-License-Identifier: Apache-2.0 OR MIT
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{fork, getgid, getuid, pause, setgid, setsid, setuid, ForkResult};

use mcast_bridge::bridge::spawn_bridges;
use mcast_bridge::config::{dump_bridges, Config};
use mcast_bridge::igmp::IgmpSubsystem;
use mcast_bridge::interface::{
    gather_interface_facts, BridgeGroup, BridgeInstance, BridgeOutbound, InterfaceConfigType,
    OutboundHandle,
};
use mcast_bridge::log_warning;
use mcast_bridge::logging::{Facility, Logger};
use mcast_bridge::mld::MldSubsystem;
use mcast_bridge::{QuerierMode, DEFAULT_NON_CONFIGURED_GROUPS};

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run in foreground
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Log notifications via syslog
    #[arg(short = 's', long)]
    syslog: bool,

    /// Configuration file name
    #[arg(short = 'c', long, default_value = "mcast-bridge.conf")]
    config: PathBuf,

    /// Process id file name
    #[arg(short = 'p', long)]
    pidfile: Option<PathBuf>,

    /// IGMP querier mode
    #[arg(short = 'I', long, value_enum, default_value_t = QuerierMode::Quick)]
    igmp_querier_mode: QuerierMode,

    /// MLD querier mode
    #[arg(short = 'M', long, value_enum, default_value_t = QuerierMode::Quick)]
    mld_querier_mode: QuerierMode,

    /// Debug level (0-4)
    #[arg(short = 'D', long, default_value_t = 0)]
    debug_level: u8,

    /// Ad-hoc learned groups allowed per interface
    #[arg(short = 'n', long, default_value_t = DEFAULT_NON_CONFIGURED_GROUPS)]
    non_configured_groups: usize,
}

// Pid file path retained for the termination handler
static PIDFILE_PATH: OnceLock<CString> = OnceLock::new();

// NB: may be invoked simultaneously by multiple threads. Only
// async-signal-safe calls.
extern "C" fn term_handler(_signum: libc::c_int) {
    if let Some(path) = PIDFILE_PATH.get() {
        unsafe {
            libc::unlink(path.as_ptr());
        }
    }
    // All state is process-local; exit abruptly
    unsafe { libc::_exit(0) };
}

fn install_term_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(term_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action).context("sigaction(SIGTERM)")?;
        sigaction(Signal::SIGINT, &action).context("sigaction(SIGINT)")?;
    }
    Ok(())
}

fn create_pidfile(path: &PathBuf) -> Result<std::fs::File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("create/open of pid file {} failed", path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        bail!("pid file {} is in use by another process", path.display());
    }
    file.set_len(0)
        .with_context(|| format!("truncate of pid file {} failed", path.display()))?;

    if let Ok(cpath) = CString::new(path.to_string_lossy().as_bytes()) {
        let _ = PIDFILE_PATH.set(cpath);
    }
    Ok(file)
}

fn write_pidfile(file: &mut std::fs::File) -> Result<()> {
    writeln!(file, "{}", std::process::id()).context("write of pid file failed")
}

fn main() -> Result<()> {
    let args = Args::parse();

    let logger = if args.syslog {
        Logger::to_syslog(args.debug_level, "mcast-bridged")
    } else {
        Logger::to_stderr(args.debug_level, args.foreground && args.debug_level > 0)
    };

    // Read and finalize the configuration
    let config = Config::load_from_file(&args.config)?;
    let facts = gather_interface_facts();
    let specs = config.build_bridges(&facts)?;
    if args.foreground {
        dump_bridges(&specs);
    }

    // Bind the bridge sockets
    let mut bridges: Vec<Arc<BridgeInstance>> = Vec::with_capacity(specs.len());
    for spec in &specs {
        bridges.push(BridgeInstance::new(spec, logger.clone())?);
    }

    // Register dynamic outbound interfaces with the control plane and
    // activate everything that is not membership-driven
    let mut igmp = IgmpSubsystem::new(
        args.igmp_querier_mode,
        args.non_configured_groups,
        logger.clone(),
    );
    let mut mld = MldSubsystem::new(
        args.mld_querier_mode,
        args.non_configured_groups,
        logger.clone(),
    );

    for (bridge, spec) in bridges.iter().zip(&specs) {
        for (if_slot, iface) in spec.interfaces.iter().enumerate() {
            if iface.outbound == InterfaceConfigType::Dynamic {
                let handle: OutboundHandle = Arc::new(BridgeOutbound {
                    bridge: Arc::clone(bridge),
                    if_slot,
                });
                match spec.group {
                    BridgeGroup::V4(group) => igmp.register_group(&iface.facts, group, handle),
                    BridgeGroup::V6(group) => mld.register_group(&iface.facts, group, handle),
                }
            }
        }
        bridge.activate_static();
    }

    install_term_handler()?;

    let mut pidfile = match &args.pidfile {
        Some(path) => Some(create_pidfile(path)?),
        None => None,
    };

    // Self background
    if !args.foreground {
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Parent { .. } => std::process::exit(0),
            ForkResult::Child => {
                setsid().context("setsid failed")?;
            }
        }
    }

    if let Some(file) = pidfile.as_mut() {
        write_pidfile(file)?;
    }

    log_warning!(
        logger,
        Facility::Main,
        "Mcast Bridge version {} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Finalize the control planes and open the capture handles while
    // still privileged
    igmp.finalize(args.foreground);
    mld.finalize(args.foreground);
    if !igmp.is_empty() {
        igmp.open_ports()?;
    }
    if !mld.is_empty() {
        mld.open_ports()?;
    }

    // Drop privileges
    let _ = setgid(getgid());
    let _ = setuid(getuid());

    // Start the control-plane and data-plane threads
    igmp.spawn()?;
    mld.spawn()?;
    spawn_bridges(&bridges, &logger)?;

    // Wait (forever)
    loop {
        pause();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_parsing() {
        let args = Args::parse_from(["mcast-bridged", "-f", "-c", "test.conf", "-I", "defer"]);
        assert!(args.foreground);
        assert_eq!(args.config, PathBuf::from("test.conf"));
        assert_eq!(args.igmp_querier_mode, QuerierMode::Defer);
        assert_eq!(args.mld_querier_mode, QuerierMode::Quick);
        assert_eq!(args.debug_level, 0);
        assert_eq!(args.non_configured_groups, 100);
    }

    #[test]
    fn test_querier_mode_values() {
        let args = Args::parse_from(["mcast-bridged", "-M", "never"]);
        assert_eq!(args.mld_querier_mode, QuerierMode::Never);

        assert!(Args::try_parse_from(["mcast-bridged", "-I", "bogus"]).is_err());
    }
}
