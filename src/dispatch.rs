// the dispatcher: one cooperative polling shard
//
// per iteration it (1) services every bound xsk, classifying received
// frames into the per-protocol output rings, (2) claims at most one
// inbound frag from the peer stages and, if this shard owns it, routes
// and transmits it, (3) on a wall-clock cadence refreshes the resolver
// tables and rotates counters into the metrics sink.
//
// sharding: outgoing frags are partitioned by seq % shard_cnt, except
// loopback-destined ones which all belong to shard 0 because only
// shard 0 owns the loopback socket.

use {
    crate::{
        aio::{IoCounters, NetIo},
        config::{ListenPorts, NetConfig},
        metrics::NetMetrics,
        netlink::MacAddress,
        packet::{self, ETH_HEADER_SIZE, UDP_HEADER_SIZE},
        ring::{chunk_next, chunk_to_ptr, RingBuf, RingConsumer, RingPoll, RingProducer},
        route::{Resolver, Route, TABLE_REFRESH_FAST, TABLE_REFRESH_LAZY},
        sig::{pack_sig, sig_dst_ip, sig_proto, Proto},
        NetError, NET_MTU,
    },
    itertools::Itertools,
    std::{
        net::Ipv4Addr,
        os::fd::RawFd,
        ptr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    },
};

/// upper bound on inbound ring bindings
pub const MAX_NET_INS: usize = 32;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(1);
const METRICS_INTERVAL: Duration = Duration::from_millis(100);

/// inbound ring binding: the consumer plus the bounds every claimed
/// chunk is checked against
pub struct InLink {
    consumer: RingConsumer,
    base: *const u8,
    chunk0: u64,
    wmark: u64,
}

impl InLink {
    pub fn new(ring: &RingBuf) -> InLink {
        InLink {
            consumer: ring.consumer(),
            base: ring.base(),
            chunk0: ring.chunk0(),
            wmark: ring.wmark(),
        }
    }
}

/// outbound ring binding with its chunk cursor
pub struct OutLink {
    producer: RingProducer,
    base: *mut u8,
    chunk0: u64,
    wmark: u64,
    chunk: u64,
}

impl OutLink {
    pub fn new(ring: &RingBuf) -> OutLink {
        OutLink {
            producer: ring.producer(),
            base: ring.base(),
            chunk0: ring.chunk0(),
            wmark: ring.wmark(),
            chunk: ring.chunk0(),
        }
    }
}

/// output rings per destination stage. legacy transactions share the
/// quic ring, distinguished by proto tag.
#[derive(Default)]
pub struct OutSet {
    pub quic: Option<OutLink>,
    pub shred: Option<OutLink>,
    pub gossip: Option<OutLink>,
    pub repair: Option<OutLink>,
}

pub struct Dispatcher {
    shard: u64,
    shard_cnt: u64,
    src_ip: Ipv4Addr,
    src_mac: MacAddress,
    ports: ListenPorts,
    /// io[0] is the primary socket; io[1], when present, loopback
    io: Vec<Box<dyn NetIo>>,
    ins: Vec<InLink>,
    next_in: usize,
    outs: OutSet,
    resolver: Resolver,
    ip_next_upd: Instant,
    frame: [u8; NET_MTU],
    metrics: Arc<NetMetrics>,
    tx_dropped: u64,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &NetConfig,
        shard: u64,
        shard_cnt: u64,
        io: Vec<Box<dyn NetIo>>,
        ins: Vec<InLink>,
        outs: OutSet,
        resolver: Resolver,
        metrics: Arc<NetMetrics>,
    ) -> Result<Dispatcher, NetError> {
        if shard_cnt == 0 || shard >= shard_cnt {
            return Err(NetError::Config(format!(
                "shard {shard} out of range for {shard_cnt} shards"
            )));
        }
        if io.is_empty() || io.len() > 2 {
            return Err(NetError::Config(
                "expected one primary io endpoint plus at most loopback".to_string(),
            ));
        }
        if shard != 0 && io.len() > 1 {
            return Err(NetError::Config(
                "only shard 0 owns the loopback socket".to_string(),
            ));
        }
        if ins.is_empty() {
            return Err(NetError::Config("no inbound links bound".to_string()));
        }
        if ins.len() > MAX_NET_INS {
            return Err(NetError::Config(format!(
                "{} inbound links exceed the limit of {MAX_NET_INS}",
                ins.len()
            )));
        }
        for (port, out, name) in [
            (cfg.ports.shred, outs.shred.is_some(), "shred"),
            (cfg.ports.quic_transaction, outs.quic.is_some(), "quic transaction"),
            (cfg.ports.legacy_transaction, outs.quic.is_some(), "legacy transaction"),
            (cfg.ports.gossip, outs.gossip.is_some(), "gossip"),
            (cfg.ports.repair_intake, outs.repair.is_some(), "repair intake"),
            (cfg.ports.repair_serve, outs.repair.is_some(), "repair serve"),
        ] {
            if port != 0 && !out {
                return Err(NetError::Config(format!(
                    "{name} listen port {port} set but no output ring was bound"
                )));
            }
        }

        let now = Instant::now();
        Ok(Dispatcher {
            shard,
            shard_cnt,
            src_ip: cfg.src_ip_addr,
            src_mac: cfg.src_mac_addr,
            ports: cfg.ports,
            io,
            ins,
            next_in: 0,
            outs,
            resolver,
            ip_next_upd: now,
            frame: [0u8; NET_MTU],
            metrics,
            tx_dropped: 0,
        })
    }

    /// the cooperative loop. never returns until `exit` is raised.
    pub fn run(&mut self, exit: &AtomicBool) {
        log::info!(
            "dispatcher shard {}/{} running ({} io endpoints, {} inbound links)",
            self.shard,
            self.shard_cnt,
            self.io.len(),
            self.ins.len()
        );
        let mut housekeeping_next = Instant::now();
        let mut metrics_next = Instant::now();
        while !exit.load(Ordering::Relaxed) {
            let mut busy = self.before_credit();
            busy |= self.poll_inbound();

            let now = Instant::now();
            if now >= housekeeping_next {
                self.during_housekeeping();
                housekeeping_next = now + HOUSEKEEPING_INTERVAL;
            }
            if now >= metrics_next {
                self.metrics_write();
                metrics_next = now + METRICS_INTERVAL;
            }
            if !busy {
                std::hint::spin_loop();
            }
        }
        self.metrics_write();
    }

    /// drive every bound socket, classifying received frames
    pub fn before_credit(&mut self) -> bool {
        let Dispatcher {
            io,
            ports,
            outs,
            metrics,
            ..
        } = self;
        let mut busy = false;
        for ep in io.iter_mut() {
            busy |= ep.service(&mut |pkt| classify(ports, outs, metrics, pkt));
        }
        busy
    }

    /// classify one received frame into its output ring. public entry
    /// for the receive glue; panics on ingress-contract violations.
    pub fn rx_packet(&mut self, pkt: &[u8]) {
        classify(&self.ports, &mut self.outs, &self.metrics, pkt);
    }

    /// claim at most one inbound frag and, if owned, transmit it
    pub fn poll_inbound(&mut self) -> bool {
        for k in 0..self.ins.len() {
            let i = (self.next_in + k) % self.ins.len();
            match self.ins[i].consumer.poll() {
                RingPoll::Empty => continue,
                RingPoll::Overrun(skipped) => {
                    log::warn!("inbound link {i} overrun, {skipped} frags lost");
                    self.next_in = (i + 1) % self.ins.len();
                    return true;
                }
                RingPoll::Frag { seq, meta } => {
                    self.next_in = (i + 1) % self.ins.len();
                    if accept_frag(self.shard, self.shard_cnt, self.src_ip, meta.sig, seq) {
                        self.during_frag(i, meta.chunk as u64, meta.sz);
                        self.after_frag(meta.sig, meta.sz as usize);
                    }
                    return true;
                }
            }
        }
        false
    }

    /// copy the owned frag into the staging frame, bounds-checked
    /// against the inbound link it came from
    fn during_frag(&mut self, in_idx: usize, chunk: u64, sz: u16) {
        let link = &self.ins[in_idx];
        if chunk < link.chunk0 || chunk > link.wmark || sz as usize > NET_MTU {
            panic!(
                "chunk {chunk} sz {sz} corrupt, not in range [{}, {}]",
                link.chunk0, link.wmark
            );
        }
        // the xsk send copies out of the caller's buffer within the
        // call, but cannot hold the chunk across it, hence the staging
        unsafe {
            ptr::copy_nonoverlapping(
                chunk_to_ptr(link.base as *mut u8, chunk),
                self.frame.as_mut_ptr(),
                sz as usize,
            );
        }
    }

    /// finish the staged frame: patch l2 and hand it to the right socket
    fn after_frag(&mut self, sig: u64, sz: usize) {
        if route_loopback(self.src_ip, sig) {
            // local delivery carries no real l2 addressing
            self.frame[..12].fill(0);
            let err = {
                let Dispatcher { io, frame, .. } = self;
                let idx = if io.len() > 1 { 1 } else { 0 };
                io[idx].send(&[&frame[..sz]], true).is_err()
            };
            self.tx_dropped += err as u64;
            return;
        }

        let dst = Ipv4Addr::from(sig_dst_ip(sig));
        match self.resolver.resolve_for_tx(dst) {
            Route::Success { mac, .. } => {
                self.frame[0..6].copy_from_slice(&mac.0);
                self.frame[6..12].copy_from_slice(&self.src_mac.0);
                let err = {
                    let Dispatcher { io, frame, .. } = self;
                    io[0].send(&[&frame[..sz]], true).is_err()
                };
                self.tx_dropped += err as u64;
            }
            Route::ProbeRequired { next_hop, .. } => {
                self.send_arp_probe(next_hop);
                self.ip_next_upd = Instant::now() + TABLE_REFRESH_FAST;
            }
            Route::Retry => {
                self.ip_next_upd = Instant::now() + TABLE_REFRESH_FAST;
            }
            Route::NoRoute | Route::Multicast | Route::Broadcast | Route::Loopback => {}
        }
    }

    fn send_arp_probe(&mut self, next_hop: Ipv4Addr) {
        // another frag may already have probed this hop
        if !self.resolver.note_probe_sent(next_hop) {
            return;
        }
        let probe = packet::arp_probe(next_hop, self.src_ip, &self.src_mac.0);
        let err = self.io[0].send(&[&probe], true).is_err();
        self.tx_dropped += err as u64;
    }

    /// rate-limited table maintenance; shard 0 also polls the kernel's
    /// xdp statistics since the socket map is shared
    pub fn during_housekeeping(&mut self) {
        let now = Instant::now();
        if now > self.ip_next_upd {
            // a refresh step never blocks: while the kernel reply is in
            // flight the deadline stays in the past and the next tick
            // polls again
            match self.resolver.refresh_step() {
                Ok(true) => self.ip_next_upd = now + TABLE_REFRESH_LAZY,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("kernel table refresh failed: {e}");
                    self.ip_next_upd = now + TABLE_REFRESH_LAZY;
                }
            }
        }

        if self.shard == 0 {
            let Dispatcher { io, metrics, .. } = self;
            if let Some(ep) = io.first_mut() {
                ep.poll_stats(metrics);
            }
        }
    }

    /// rotate io counters into the metrics sink
    pub fn metrics_write(&self) {
        let mut c = IoCounters::default();
        for ep in &self.io {
            c.accumulate(ep.counters());
        }
        self.metrics.received_packets.set(c.rx_pkts);
        self.metrics.received_bytes.set(c.rx_bytes);
        self.metrics.sent_packets.set(c.tx_pkts);
        self.metrics.sent_bytes.set(c.tx_bytes);
        self.metrics.tx_dropped.set(self.tx_dropped);
    }

    /// descriptors the sandbox policy must whitelist for this shard
    pub fn allowed_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.io.iter().filter_map(|ep| ep.raw_fd()).collect();
        if let Some(fd) = self.resolver.netlink_fd() {
            fds.push(fd);
        }
        fds
    }

    /// deadline of the next resolver table refresh
    pub fn next_table_refresh(&self) -> Instant {
        self.ip_next_upd
    }

    pub fn tx_dropped(&self) -> u64 {
        self.tx_dropped
    }
}

/// does this sig address the local host (exact loopback or our own ip)
fn route_loopback(src_ip: Ipv4Addr, sig: u64) -> bool {
    let dst = Ipv4Addr::from(sig_dst_ip(sig));
    dst == Ipv4Addr::new(127, 0, 0, 1) || dst == src_ip
}

/// the before-frag ownership filter: only OUTGOING frags, loopback
/// pinned to shard 0, everything else round-robined by sequence
pub(crate) fn accept_frag(shard: u64, shard_cnt: u64, src_ip: Ipv4Addr, sig: u64, seq: u64) -> bool {
    if sig_proto(sig) != Some(Proto::Outgoing) {
        return false;
    }
    if route_loopback(src_ip, sig) {
        shard == 0
    } else {
        seq % shard_cnt == shard
    }
}

/// compressed publish timestamp
fn ts_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0)
}

/// the rx classifier. every frame the xdp program forwards is ipv4/udp
/// on one of the configured ports; anything else is a programming or
/// deployment error and terminates the shard.
fn classify(ports: &ListenPorts, outs: &mut OutSet, metrics: &NetMetrics, pkt: &[u8]) {
    if pkt.len() > NET_MTU {
        panic!("received a frame larger than the mtu ({} > {NET_MTU})", pkt.len());
    }
    if pkt.len() < ETH_HEADER_SIZE + 20 {
        panic!(
            "received a {}-byte runt frame from the xdp program; it is likely misconfigured",
            pkt.len()
        );
    }

    // ethertype and ip protocol in one branch
    if packet::eth_ip_test(pkt) != packet::ETH_IP_TEST_UDP {
        panic!(
            "received a packet from the xdp program that was either not ipv4 or not udp; \
             the xdp program is likely misconfigured"
        );
    }

    let iplen = packet::ip_hdr_len(pkt);
    let udp = ETH_HEADER_SIZE + iplen;
    if udp + UDP_HEADER_SIZE > pkt.len() {
        metrics.rx_undersized.inc();
        return;
    }

    let src_ip = packet::src_ip(pkt);
    let src_port = packet::udp_src_port(pkt, udp);
    let dst_port = packet::udp_dst_port(pkt, udp);

    let (proto, out) = if dst_port != 0 && dst_port == ports.shred {
        (Proto::Shred, &mut outs.shred)
    } else if dst_port != 0 && dst_port == ports.quic_transaction {
        (Proto::TpuQuic, &mut outs.quic)
    } else if dst_port != 0 && dst_port == ports.legacy_transaction {
        (Proto::TpuUdp, &mut outs.quic)
    } else if dst_port != 0 && dst_port == ports.gossip {
        (Proto::Gossip, &mut outs.gossip)
    } else if dst_port != 0 && dst_port == ports.repair_intake {
        (Proto::Repair, &mut outs.repair)
    } else if dst_port != 0 && dst_port == ports.repair_serve {
        (Proto::Repair, &mut outs.repair)
    } else {
        panic!(
            "received a udp packet on port {dst_port} which was not expected; only the \
             following ports should be forwarded by the xdp program: {} (excluding any \
             0 ports, which are disabled). the installed program is likely stale",
            ports.candidates().iter().join(", ")
        );
    };
    let Some(out) = out.as_mut() else {
        panic!("port {dst_port} is configured but its output ring is not bound");
    };

    unsafe {
        ptr::copy_nonoverlapping(pkt.as_ptr(), chunk_to_ptr(out.base, out.chunk), pkt.len());
    }
    let sig = pack_sig(
        src_ip,
        src_port,
        0,
        proto,
        ETH_HEADER_SIZE + UDP_HEADER_SIZE + iplen,
    );
    out.producer
        .publish(sig, out.chunk, pkt.len() as u16, 0, 0, ts_now());
    out.chunk = chunk_next(out.chunk, out.chunk0, out.wmark);
}
