// AF_XDP packet dispatcher: drains NIC queues into per-protocol
// shared-memory rings and injects outbound frames from peer stages,
// resolving L2 next-hops through a cached ARP/route view.

use {std::io, thiserror::Error};

pub mod aio;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod netlink;
pub mod packet;
pub mod program;
pub mod ring;
pub mod route;
pub mod sig;
pub mod xsk;

pub use {
    dispatch::Dispatcher,
    program::{install_xdp, XdpProgram},
};

/// maximum frame size handled anywhere in the dispatcher, headers included.
/// also the chunk stride of every data region and the UMEM frame size, so
/// it must stay a power of two.
pub const NET_MTU: usize = 2048;

/// setup-path errors. the packet fast path never constructs these; it
/// either drops (with a counter) or terminates the shard.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("{0} failed (errno {1})")]
    Sys(&'static str, i32),
    #[error("interface {0} not found")]
    IfNotFound(String),
    #[error("{0}")]
    Config(String),
    #[error("ebpf: {0}")]
    Ebpf(#[from] aya::EbpfError),
    #[error("xdp program: {0}")]
    Program(#[from] aya::programs::ProgramError),
    #[error("bpf map: {0}")]
    Map(#[from] aya::maps::MapError),
    #[error("capabilities: {0}")]
    Caps(#[from] caps::errors::CapsError),
}

/// pin the calling thread to the given cores
pub fn set_cpu_affinity(cores: impl IntoIterator<Item = usize>) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for core in cores {
            libc::CPU_SET(core, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
