// end-to-end dispatcher scenarios over in-memory rings and capture
// sinks in place of the xdp sockets

use {
    std::{
        net::Ipv4Addr,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
    xdp_netmux::{
        aio::{AioError, IoCounters, NetIo},
        config::{ListenPorts, NetConfig},
        dispatch::{Dispatcher, InLink, OutLink, OutSet},
        metrics::NetMetrics,
        netlink::{MacAddress, Neighbor, RouteEntry, NUD_REACHABLE, RTN_UNICAST},
        packet,
        ring::{chunk_to_ptr, RingBuf, RingPoll},
        route::Resolver,
        sig::{self, Proto},
    },
};

const SRC_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SRC_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// capture sink standing in for an xsk endpoint
#[derive(Clone, Default)]
struct TxSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TxSink {
    fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
}

impl NetIo for TxSink {
    fn service(&mut self, _rx: &mut dyn FnMut(&[u8])) -> bool {
        false
    }

    fn send(&mut self, batch: &[&[u8]], _flush: bool) -> Result<usize, AioError> {
        let mut frames = self.frames.lock().unwrap();
        for buf in batch {
            frames.push(buf.to_vec());
        }
        Ok(batch.len())
    }

    fn counters(&self) -> IoCounters {
        let frames = self.frames.lock().unwrap();
        IoCounters {
            tx_pkts: frames.len() as u64,
            tx_bytes: frames.iter().map(|f| f.len() as u64).sum(),
            ..Default::default()
        }
    }
}

fn config() -> NetConfig {
    NetConfig {
        interface: "eth0".to_string(),
        src_ip_addr: SRC_IP,
        src_mac_addr: SRC_MAC,
        ports: ListenPorts {
            shred: 8003,
            quic_transaction: 8002,
            legacy_transaction: 8001,
            gossip: 8000,
            repair_intake: 8004,
            repair_serve: 8005,
        },
        ..Default::default()
    }
}

struct Rings {
    quic: RingBuf,
    shred: RingBuf,
    gossip: RingBuf,
    repair: RingBuf,
    inbound: RingBuf,
}

fn rings() -> Rings {
    Rings {
        quic: RingBuf::alloc(8, 4).unwrap(),
        shred: RingBuf::alloc(8, 4).unwrap(),
        gossip: RingBuf::alloc(8, 4).unwrap(),
        repair: RingBuf::alloc(8, 4).unwrap(),
        inbound: RingBuf::alloc(2048, 4).unwrap(),
    }
}

fn outs(r: &Rings) -> OutSet {
    OutSet {
        quic: Some(OutLink::new(&r.quic)),
        shred: Some(OutLink::new(&r.shred)),
        gossip: Some(OutLink::new(&r.gossip)),
        repair: Some(OutLink::new(&r.repair)),
    }
}

fn dispatcher(
    r: &Rings,
    shard: u64,
    shard_cnt: u64,
    io: Vec<Box<dyn NetIo>>,
    resolver: Resolver,
    metrics: Arc<NetMetrics>,
) -> Dispatcher {
    Dispatcher::new(
        &config(),
        shard,
        shard_cnt,
        io,
        vec![InLink::new(&r.inbound)],
        outs(r),
        resolver,
        metrics,
    )
    .unwrap()
}

fn empty_resolver() -> Resolver {
    Resolver::with_tables(SRC_IP, &[], &[])
}

/// 100-byte udp frame: aa->bb, 10.0.0.1:5000 -> 10.0.0.2:dst_port
fn udp_frame(dst_port: u16) -> Vec<u8> {
    let mut f = vec![0u8; 100];
    f[0..6].copy_from_slice(&[0xaa; 6]);
    f[6..12].copy_from_slice(&[0xbb; 6]);
    f[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    f[14] = 0x45; // ihl 5
    f[23] = 17; // udp
    f[26..30].copy_from_slice(&[10, 0, 0, 1]);
    f[30..34].copy_from_slice(&[10, 0, 0, 2]);
    let udp = 14 + 20;
    f[udp..udp + 2].copy_from_slice(&5000u16.to_be_bytes());
    f[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
    for (i, b) in f[udp + 8..].iter_mut().enumerate() {
        *b = i as u8;
    }
    f
}

/// queue an outgoing frag of `sz` bytes filled with `fill`
fn publish_outgoing(r: &Rings, dst: Ipv4Addr, sz: u16, fill: u8) {
    let mut prod = r.inbound.producer();
    let chunk = r.inbound.chunk0();
    unsafe {
        std::slice::from_raw_parts_mut(chunk_to_ptr(r.inbound.base(), chunk), sz as usize)
            .fill(fill);
    }
    let sig = sig::pack_sig(0, 0, u32::from(dst), Proto::Outgoing, 0);
    prod.publish(sig, chunk, sz, 0, 0, 0);
}

#[test]
fn quic_rx_happy_path() {
    let r = rings();
    let mut cons = r.quic.consumer();
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(TxSink::default())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );

    let frame = udp_frame(8002);
    d.rx_packet(&frame);

    match cons.poll() {
        RingPoll::Frag { seq, meta } => {
            assert_eq!(seq, 0);
            assert_eq!(sig::sig_proto(meta.sig), Some(Proto::TpuQuic));
            assert_eq!(sig::sig_src_ip(meta.sig), u32::from(Ipv4Addr::new(10, 0, 0, 1)));
            assert_eq!(sig::sig_src_port(meta.sig), 5000);
            assert_eq!(sig::sig_hdr_sz(meta.sig), 42);
            assert_eq!(meta.sz, 100);
            let chunk = meta.chunk as u64;
            assert!(r.quic.chunk0() <= chunk && chunk <= r.quic.wmark());
            let payload =
                unsafe { std::slice::from_raw_parts(chunk_to_ptr(r.quic.base(), chunk), 100) };
            assert_eq!(payload, &frame[..]);
        }
        other => panic!("expected one quic frag, got {other:?}"),
    }
    assert!(matches!(cons.poll(), RingPoll::Empty));
}

#[test]
fn every_port_maps_to_its_ring_and_tag() {
    let r = rings();
    let mut quic = r.quic.consumer();
    let mut shred = r.shred.consumer();
    let mut gossip = r.gossip.consumer();
    let mut repair = r.repair.consumer();
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(TxSink::default())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );

    for port in [8000, 8001, 8002, 8003, 8004, 8005] {
        d.rx_packet(&udp_frame(port));
    }

    let tag = |poll: RingPoll| match poll {
        RingPoll::Frag { meta, .. } => sig::sig_proto(meta.sig).unwrap(),
        other => panic!("expected frag, got {other:?}"),
    };

    assert_eq!(tag(gossip.poll()), Proto::Gossip);
    assert!(matches!(gossip.poll(), RingPoll::Empty));

    // legacy and quic transactions share the ring with distinct tags
    assert_eq!(tag(quic.poll()), Proto::TpuUdp);
    assert_eq!(tag(quic.poll()), Proto::TpuQuic);
    assert!(matches!(quic.poll(), RingPoll::Empty));

    assert_eq!(tag(shred.poll()), Proto::Shred);
    assert!(matches!(shred.poll(), RingPoll::Empty));

    assert_eq!(tag(repair.poll()), Proto::Repair);
    assert_eq!(tag(repair.poll()), Proto::Repair);
    assert!(matches!(repair.poll(), RingPoll::Empty));
}

#[test]
#[should_panic(expected = "9999")]
fn unknown_port_is_fatal() {
    let r = rings();
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(TxSink::default())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );
    d.rx_packet(&udp_frame(9999));
}

#[test]
#[should_panic(expected = "not ipv4 or not udp")]
fn non_udp_frame_is_fatal() {
    let r = rings();
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(TxSink::default())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );
    let mut frame = udp_frame(8002);
    frame[23] = 6; // tcp
    d.rx_packet(&frame);
}

#[test]
fn undersized_udp_is_dropped_with_counter() {
    let r = rings();
    let mut cons = r.quic.consumer();
    let metrics = Arc::new(NetMetrics::new());
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(TxSink::default())],
        empty_resolver(),
        Arc::clone(&metrics),
    );

    let mut frame = udp_frame(8002);
    frame.truncate(36); // udp header would end at 42
    d.rx_packet(&frame);

    assert_eq!(metrics.rx_undersized.get(), 1);
    assert!(matches!(cons.poll(), RingPoll::Empty));
}

#[test]
fn loopback_tx_zeroes_macs_and_stays_on_shard_zero() {
    let r = rings();
    let (tx0, lo0) = (TxSink::default(), TxSink::default());
    let tx1 = TxSink::default();
    let metrics = Arc::new(NetMetrics::new());
    let mut d0 = dispatcher(
        &r,
        0,
        2,
        vec![Box::new(tx0.clone()), Box::new(lo0.clone())],
        empty_resolver(),
        Arc::clone(&metrics),
    );
    let mut d1 = dispatcher(
        &r,
        1,
        2,
        vec![Box::new(tx1.clone())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );

    publish_outgoing(&r, Ipv4Addr::new(127, 0, 0, 1), 200, 0x5a);

    assert!(d0.poll_inbound());
    assert!(d1.poll_inbound());
    assert!(!d0.poll_inbound());

    let sent = lo0.frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 200);
    assert!(sent[0][..12].iter().all(|&b| b == 0));
    assert!(sent[0][12..].iter().all(|&b| b == 0x5a));
    assert!(tx0.frames().is_empty());
    assert!(tx1.frames().is_empty(), "shard 1 must drop loopback frags");

    d0.metrics_write();
    assert_eq!(metrics.sent_packets.get(), 1);
    assert_eq!(metrics.sent_bytes.get(), 200);
    assert_eq!(metrics.tx_dropped.get(), 0);
}

#[test]
fn own_address_routes_like_loopback() {
    let r = rings();
    let (tx, lo) = (TxSink::default(), TxSink::default());
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(tx.clone()), Box::new(lo.clone())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );

    publish_outgoing(&r, SRC_IP, 80, 0x11);
    assert!(d.poll_inbound());
    assert_eq!(lo.frames().len(), 1);
    assert!(tx.frames().is_empty());
}

#[test]
fn arp_miss_probes_and_drops() {
    let r = rings();
    let tx = TxSink::default();
    let resolver = Resolver::with_tables(
        SRC_IP,
        &[],
        &[RouteEntry {
            dst: Ipv4Addr::new(10, 0, 0, 0),
            prefix_len: 24,
            gateway: None,
            oif: 2,
            pref_src: Some(SRC_IP),
            rtype: RTN_UNICAST,
        }],
    );
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(tx.clone())],
        resolver,
        Arc::new(NetMetrics::new()),
    );

    publish_outgoing(&r, Ipv4Addr::new(10, 0, 0, 99), 90, 0x22);
    let before = Instant::now();
    assert!(d.poll_inbound());

    // no payload went out, exactly one arp request did
    let sent = tx.frames();
    assert_eq!(sent.len(), 1);
    let probe = &sent[0];
    assert_eq!(probe.len(), packet::ARP_FRAME_SZ);
    assert_eq!(&probe[0..6], &[0xff; 6]);
    assert_eq!(&probe[6..12], &SRC_MAC.0);
    assert_eq!(&probe[12..14], &[0x08, 0x06]);
    assert_eq!(&probe[20..22], &[0x00, 0x01]); // arp request
    assert_eq!(&probe[22..28], &SRC_MAC.0);
    assert_eq!(&probe[28..32], &[10, 0, 0, 1]);
    assert_eq!(&probe[32..38], &[0u8; 6]);
    assert_eq!(&probe[38..42], &[10, 0, 0, 99]);
    assert!(probe[packet::ARP_PROBE_SZ..].iter().all(|&b| b == 0));

    // refresh deadline was pulled from lazy-60s to right about now
    assert!(d.next_table_refresh() <= before + Duration::from_millis(10));

    // a second frag to the same hop retries without another probe
    publish_outgoing(&r, Ipv4Addr::new(10, 0, 0, 99), 90, 0x22);
    assert!(d.poll_inbound());
    assert_eq!(tx.frames().len(), 1);
}

#[test]
fn resolved_frag_gets_patched_macs() {
    let r = rings();
    let tx = TxSink::default();
    let next_hop_mac = MacAddress([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
    let resolver = Resolver::with_tables(
        SRC_IP,
        &[Neighbor {
            ip: Ipv4Addr::new(10, 0, 0, 2),
            mac: Some(next_hop_mac),
            ifindex: 2,
            state: NUD_REACHABLE,
        }],
        &[RouteEntry {
            dst: Ipv4Addr::new(10, 0, 0, 0),
            prefix_len: 24,
            gateway: None,
            oif: 2,
            pref_src: Some(SRC_IP),
            rtype: RTN_UNICAST,
        }],
    );
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(tx.clone())],
        resolver,
        Arc::new(NetMetrics::new()),
    );

    publish_outgoing(&r, Ipv4Addr::new(10, 0, 0, 2), 120, 0x33);
    assert!(d.poll_inbound());

    let sent = tx.frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 120);
    assert_eq!(&sent[0][0..6], &next_hop_mac.0);
    assert_eq!(&sent[0][6..12], &SRC_MAC.0);
    assert!(sent[0][12..].iter().all(|&b| b == 0x33));
    assert_eq!(d.tx_dropped(), 0);
}

#[test]
fn no_route_drops_silently() {
    let r = rings();
    let tx = TxSink::default();
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(tx.clone())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );

    publish_outgoing(&r, Ipv4Addr::new(192, 168, 44, 7), 64, 0x44);
    assert!(d.poll_inbound());
    assert!(tx.frames().is_empty());
    assert_eq!(d.tx_dropped(), 0);
}

#[test]
fn sharding_splits_exactly_by_seq() {
    let r = rings();
    let dst = Ipv4Addr::new(10, 0, 0, 2);
    let neighbors = [Neighbor {
        ip: dst,
        mac: Some(MacAddress([1, 2, 3, 4, 5, 6])),
        ifindex: 2,
        state: NUD_REACHABLE,
    }];
    let routes = [RouteEntry {
        dst: Ipv4Addr::new(10, 0, 0, 0),
        prefix_len: 24,
        gateway: None,
        oif: 2,
        pref_src: Some(SRC_IP),
        rtype: RTN_UNICAST,
    }];

    const N: u64 = 4;
    let mut shards = Vec::new();
    for shard in 0..N {
        let tx = TxSink::default();
        let d = dispatcher(
            &r,
            shard,
            N,
            vec![Box::new(tx.clone())],
            Resolver::with_tables(SRC_IP, &neighbors, &routes),
            Arc::new(NetMetrics::new()),
        );
        shards.push((d, tx));
    }

    // 1000 outgoing frags with sig noise in the port field
    let mut prod = r.inbound.producer();
    let chunk = r.inbound.chunk0();
    let mut lcg = 1u64;
    for _ in 0..1000 {
        lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let sig = sig::pack_sig(0, (lcg >> 33) as u16, u32::from(dst), Proto::Outgoing, 0);
        prod.publish(sig, chunk, 64, 0, 0, 0);
    }

    for (d, tx) in shards.iter_mut() {
        while d.poll_inbound() {}
        assert_eq!(tx.frames().len(), 250);
        assert_eq!(d.tx_dropped(), 0);
    }
}

#[test]
fn chunk_cursor_wraps_and_overwrites() {
    let r = rings();
    let mut cons = r.quic.consumer();
    let mut d = dispatcher(
        &r,
        0,
        1,
        vec![Box::new(TxSink::default())],
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    );

    // the quic data region holds 4 chunks; the 5th publish must land
    // back on chunk0 with fresh bytes
    let mut frames = Vec::new();
    let mut chunks = Vec::new();
    for i in 0..5u8 {
        let mut frame = udp_frame(8002);
        *frame.last_mut().unwrap() = 0xf0 | i;
        d.rx_packet(&frame);
        match cons.poll() {
            RingPoll::Frag { meta, .. } => chunks.push(meta.chunk as u64),
            other => panic!("expected frag, got {other:?}"),
        }
        frames.push(frame);
    }

    assert_eq!(chunks[4], r.quic.chunk0());
    assert_eq!(chunks[0], chunks[4], "cursor must wrap to the first chunk");
    assert_eq!(chunks[..4].iter().collect::<std::collections::HashSet<_>>().len(), 4);

    let payload =
        unsafe { std::slice::from_raw_parts(chunk_to_ptr(r.quic.base(), chunks[4]), 100) };
    assert_eq!(payload, &frames[4][..], "chunk0 must hold the latest publish");
}

#[test]
fn configured_port_without_ring_is_rejected() {
    let r = rings();
    let err = Dispatcher::new(
        &config(),
        0,
        1,
        vec![Box::new(TxSink::default())],
        vec![InLink::new(&r.inbound)],
        OutSet {
            quic: Some(OutLink::new(&r.quic)),
            shred: None,
            gossip: Some(OutLink::new(&r.gossip)),
            repair: Some(OutLink::new(&r.repair)),
        },
        empty_resolver(),
        Arc::new(NetMetrics::new()),
    )
    .err()
    .expect("shred port is set but its ring is missing");
    assert!(err.to_string().contains("shred"));
}
