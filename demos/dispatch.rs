// single-shard dispatcher bring-up on a real interface
//
// installs the xdp program, binds one AF_XDP socket to the given queue
// and runs the dispatch loop until ctrl-c. the output rings are local
// to the process, so this is a packet-intake smoke test rather than a
// full pipeline.

use {
    clap::Parser,
    std::{
        net::Ipv4Addr,
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    xdp_netmux::{
        aio::XskAio,
        config::{ListenPorts, NetConfig},
        dispatch::{Dispatcher, InLink, OutLink, OutSet},
        metrics::NetMetrics,
        netlink::MacAddress,
        program::{self, XdpMode},
        ring::RingBuf,
        route::Resolver,
        set_cpu_affinity,
        xsk::{Xsk, XskConfig},
    },
};

#[derive(Parser, Debug)]
#[command(author, version, about = "dispatch", long_about = None)]
struct Opt {
    #[arg(short, long, default_value = "lo")]
    interface: String,

    /// compiled xdp object, e.g. xdp-ebpf/target/bpf/xdp-dispatch
    #[arg(long)]
    xdp_obj: PathBuf,

    #[arg(long)]
    src_ip: Ipv4Addr,

    #[arg(long)]
    src_mac: String,

    #[arg(long, default_value = "0")]
    queue: u32,

    #[arg(long, default_value = "2")]
    cpu: usize,

    #[arg(short, long)]
    zero_copy: bool,

    #[arg(long, default_value = "8000")]
    gossip_port: u16,

    #[arg(long, default_value = "8001")]
    legacy_port: u16,

    #[arg(long, default_value = "8002")]
    quic_port: u16,

    #[arg(long, default_value = "8003")]
    shred_port: u16,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let opt = Opt::parse();

    let src_mac: MacAddress = opt
        .src_mac
        .parse()
        .map_err(|_| "invalid mac address, use aa:bb:cc:dd:ee:ff")?;

    let cfg = NetConfig {
        interface: opt.interface.clone(),
        src_ip_addr: opt.src_ip,
        src_mac_addr: src_mac,
        zero_copy: opt.zero_copy,
        ports: ListenPorts {
            shred: opt.shred_port,
            quic_transaction: opt.quic_port,
            legacy_transaction: opt.legacy_port,
            gossip: opt.gossip_port,
            ..Default::default()
        },
        ..Default::default()
    };

    set_cpu_affinity([opt.cpu])?;

    let ifindex = {
        let name = std::ffi::CString::new(cfg.interface.clone())?;
        let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if idx == 0 {
            return Err(format!("interface {} not found", cfg.interface).into());
        }
        idx
    };

    program::raise_net_caps()?;

    let mode = if cfg.interface == "lo" {
        XdpMode::Skb
    } else {
        XdpMode::Native
    };
    let mut prog = program::install_xdp(&opt.xdp_obj, ifindex, &cfg.ports, mode)?;

    let xsk = Xsk::bind(
        ifindex,
        opt.queue,
        XskConfig {
            rx_depth: cfg.xdp_rx_queue_size,
            tx_depth: cfg.xdp_tx_queue_size,
            zero_copy: cfg.zero_copy,
        },
    )?;
    xsk.activate(&mut prog)?;

    program::drop_net_caps()?;

    // local rings; nothing consumes them in this demo
    let quic = RingBuf::alloc(2048, 2048)?;
    let shred = RingBuf::alloc(2048, 2048)?;
    let gossip = RingBuf::alloc(2048, 2048)?;
    let repair = RingBuf::alloc(2048, 2048)?;
    let inbound = RingBuf::alloc(2048, 2048)?;

    let metrics = Arc::new(NetMetrics::new());
    let mut dispatcher = Dispatcher::new(
        &cfg,
        0,
        1,
        vec![Box::new(XskAio::new(xsk, cfg.xdp_aio_depth))],
        vec![InLink::new(&inbound)],
        OutSet {
            quic: Some(OutLink::new(&quic)),
            shred: Some(OutLink::new(&shred)),
            gossip: Some(OutLink::new(&gossip)),
            repair: Some(OutLink::new(&repair)),
        },
        Resolver::new(cfg.src_ip_addr)?,
        Arc::clone(&metrics),
    )?;

    println!(
        "dispatching on {} queue {} (cpu {}), sandbox fds: {:?}",
        cfg.interface,
        opt.queue,
        opt.cpu,
        dispatcher.allowed_fds()
    );

    let exit = Arc::new(AtomicBool::new(false));
    let exit_handler = Arc::clone(&exit);
    ctrlc::set_handler(move || exit_handler.store(true, Ordering::Relaxed))?;

    dispatcher.run(&exit);

    println!(
        "rx {} pkts / {} bytes, tx {} pkts / {} bytes, tx dropped {}",
        metrics.received_packets.get(),
        metrics.received_bytes.get(),
        metrics.sent_packets.get(),
        metrics.sent_bytes.get(),
        metrics.tx_dropped.get(),
    );

    Ok(())
}
