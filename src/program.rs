// xdp program install and socket registration
//
// runs once under elevated privilege on shard 0 (and for loopback).
// the program's XSKS_MAP steers redirected packets to the per-queue
// sockets; LISTEN_PORTS tells it which udp destination ports we own.

use {
    crate::{config::ListenPorts, NetError},
    aya::{
        maps::{Array, XskMap},
        programs::{xdp::XdpFlags, Xdp},
        Ebpf,
    },
    caps::{CapSet, Capability},
    std::{os::fd::RawFd, path::Path},
};

const PROG_NAME: &str = "xdp_dispatch";
const XSK_MAP_NAME: &str = "XSKS_MAP";
const PORTS_MAP_NAME: &str = "LISTEN_PORTS";

/// attach mode for the xdp program. loopback only supports skb
/// (generic) mode; nics take native, falling back to skb when the
/// driver refuses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum XdpMode {
    Native,
    Skb,
}

/// an installed xdp program holding the live attachment and its maps
pub struct XdpProgram {
    ebpf: Ebpf,
}

/// load the dispatch program from `obj_path`, attach it to `ifindex`
/// and publish the listen-port candidates to its filter map
pub fn install_xdp(
    obj_path: &Path,
    ifindex: u32,
    ports: &ListenPorts,
    mode: XdpMode,
) -> Result<XdpProgram, NetError> {
    let mut ebpf = Ebpf::load_file(obj_path)?;

    let prog: &mut Xdp = ebpf
        .program_mut(PROG_NAME)
        .ok_or_else(|| NetError::Config(format!("{PROG_NAME} not found in {obj_path:?}")))?
        .try_into()?;
    prog.load()?;

    match mode {
        XdpMode::Skb => {
            prog.attach_to_if_index(ifindex, XdpFlags::SKB_MODE)?;
            log::info!("xdp program attached to ifindex {ifindex} in skb mode");
        }
        XdpMode::Native => match prog.attach_to_if_index(ifindex, XdpFlags::DRV_MODE) {
            Ok(_) => log::info!("xdp program attached to ifindex {ifindex} in native mode"),
            Err(e) => {
                log::warn!("native attach failed ({e}), falling back to skb mode");
                prog.attach_to_if_index(ifindex, XdpFlags::SKB_MODE)?;
                log::info!("xdp program attached to ifindex {ifindex} in skb mode");
            }
        },
    }

    let mut port_map: Array<_, u16> = ebpf
        .map_mut(PORTS_MAP_NAME)
        .ok_or_else(|| NetError::Config(format!("{PORTS_MAP_NAME} not found in program")))?
        .try_into()?;
    for (i, port) in ports.candidates().iter().enumerate() {
        port_map.set(i as u32, *port, 0)?;
    }

    Ok(XdpProgram { ebpf })
}

impl XdpProgram {
    /// insert a socket into the XSKS_MAP so the program can redirect
    /// the given nic queue to it
    pub fn register_socket(&mut self, queue_id: u32, socket_fd: RawFd) -> Result<(), NetError> {
        let mut xsk_map: XskMap<_> = self
            .ebpf
            .map_mut(XSK_MAP_NAME)
            .ok_or_else(|| NetError::Config(format!("{XSK_MAP_NAME} not found in program")))?
            .try_into()?;
        xsk_map.set(queue_id, socket_fd, 0)?;
        log::info!("registered socket fd {socket_fd} for queue {queue_id}");
        Ok(())
    }
}

/// raise the capabilities socket/program creation needs
pub fn raise_net_caps() -> Result<(), NetError> {
    for cap in [
        Capability::CAP_NET_ADMIN,
        Capability::CAP_NET_RAW,
        Capability::CAP_BPF,
    ] {
        caps::raise(None, CapSet::Effective, cap)?;
    }
    Ok(())
}

/// drop them again once the sockets exist
pub fn drop_net_caps() -> Result<(), NetError> {
    for cap in [Capability::CAP_NET_ADMIN, Capability::CAP_NET_RAW] {
        caps::drop(None, CapSet::Effective, cap)?;
    }
    Ok(())
}
