// AF_XDP socket driver
//
// owns one socket bound to one nic queue: the UMEM frame pool and the
// four kernel-shared rings (fill / completion for the pool, rx / tx for
// the traffic). `service` is the single non-blocking pump that recycles
// completions, keeps the fill ring stocked, and hands received frames
// to the caller.
//
// ring indices are free-running u32s; the kernel requires power-of-two
// ring sizes so `index & (size - 1)` addresses the slot. the producer
// side publishes with a release store, the consumer side acquires the
// peer index before reading descriptors.

use {
    crate::{aio::IoCounters, metrics::NetMetrics, NetError, NET_MTU},
    std::{
        io, mem,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        ptr,
        sync::atomic::{AtomicU32, Ordering},
    },
    libc::{c_void, MSG_DONTWAIT},
};

// uapi/linux/if_xdp.h
const AF_XDP: i32 = 44;
const SOL_XDP: i32 = 283;

const XDP_MMAP_OFFSETS: i32 = 1;
const XDP_RX_RING: i32 = 2;
const XDP_TX_RING: i32 = 3;
const XDP_UMEM_REG: i32 = 4;
const XDP_UMEM_FILL_RING: i32 = 5;
const XDP_UMEM_COMPLETION_RING: i32 = 6;
const XDP_STATISTICS: i32 = 7;

const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

const XDP_RING_NEED_WAKEUP: u32 = 1;

const XDP_PGOFF_RX_RING: i64 = 0;
const XDP_PGOFF_TX_RING: i64 = 0x80000000;
const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x100000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x180000000;

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

/// rx/tx ring descriptor, struct xdp_desc in the kernel
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

/// kernel drop/error statistics, struct xdp_statistics v1
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XdpStatistics {
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    pub rx_ring_full: u64,
    pub rx_fill_ring_empty_descs: u64,
    pub tx_ring_empty_descs: u64,
}

const XDP_STATISTICS_V0_SZ: u32 = 24;
const XDP_STATISTICS_V1_SZ: u32 = 48;

#[derive(Clone, Copy, Debug)]
pub struct XskConfig {
    pub rx_depth: u32,
    pub tx_depth: u32,
    pub zero_copy: bool,
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// one mmap'd ring shared with the kernel
struct RingMap {
    map_ptr: *mut c_void,
    map_len: usize,
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    flags: *const AtomicU32,
    desc: *mut u8,
    size: u32,
}

impl RingMap {
    fn mmap(
        fd: RawFd,
        pgoff: i64,
        off: &XdpRingOffset,
        size: u32,
        entry_sz: usize,
    ) -> Result<RingMap, NetError> {
        let map_len = off.desc as usize + size as usize * entry_sz;
        let map_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff,
            )
        };
        if map_ptr == libc::MAP_FAILED {
            return Err(NetError::Sys("mmap(xdp ring)", errno()));
        }
        let base = map_ptr as *mut u8;
        Ok(unsafe {
            RingMap {
                map_ptr,
                map_len,
                producer: base.add(off.producer as usize) as *const AtomicU32,
                consumer: base.add(off.consumer as usize) as *const AtomicU32,
                flags: base.add(off.flags as usize) as *const AtomicU32,
                desc: base.add(off.desc as usize),
                size,
            }
        })
    }

    /// ring over anonymous memory, for exercising the index protocol
    /// without a kernel socket
    #[cfg(test)]
    fn anonymous(size: u32, entry_sz: usize) -> RingMap {
        let hdr = 64usize;
        let map_len = hdr + size as usize * entry_sz;
        let map_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(map_ptr, libc::MAP_FAILED);
        let base = map_ptr as *mut u8;
        unsafe {
            RingMap {
                map_ptr,
                map_len,
                producer: base as *const AtomicU32,
                consumer: base.add(4) as *const AtomicU32,
                flags: base.add(8) as *const AtomicU32,
                desc: base.add(hdr),
                size,
            }
        }
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map_ptr, self.map_len);
        }
    }
}

/// user-producer ring (fill, tx)
struct ProdRing<T: Copy> {
    ring: RingMap,
    cached_prod: u32,
    cached_cons: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> ProdRing<T> {
    fn new(ring: RingMap) -> Self {
        let cached_prod = unsafe { (*ring.producer).load(Ordering::Relaxed) };
        let cached_cons = unsafe { (*ring.consumer).load(Ordering::Relaxed) }
            .wrapping_add(ring.size);
        ProdRing {
            ring,
            cached_prod,
            cached_cons,
            _marker: std::marker::PhantomData,
        }
    }

    fn free_slots(&mut self) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if free > 0 {
            return free;
        }
        // the kernel consumer may have moved on; its index stays behind
        // ours by at most `size` in the wrapping space
        self.cached_cons = unsafe { (*self.ring.consumer).load(Ordering::Acquire) }
            .wrapping_add(self.ring.size);
        self.cached_cons.wrapping_sub(self.cached_prod)
    }

    fn push(&mut self, v: T) -> bool {
        if self.free_slots() == 0 {
            return false;
        }
        let idx = (self.cached_prod & (self.ring.size - 1)) as usize;
        unsafe {
            *(self.ring.desc as *mut T).add(idx) = v;
        }
        self.cached_prod = self.cached_prod.wrapping_add(1);
        true
    }

    fn commit(&mut self) {
        unsafe {
            (*self.ring.producer).store(self.cached_prod, Ordering::Release);
        }
    }

    fn needs_wakeup(&self) -> bool {
        unsafe { (*self.ring.flags).load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0 }
    }
}

/// user-consumer ring (rx, completion)
struct ConsRing<T: Copy> {
    ring: RingMap,
    cached_prod: u32,
    cached_cons: u32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> ConsRing<T> {
    fn new(ring: RingMap) -> Self {
        let cached_prod = unsafe { (*ring.producer).load(Ordering::Acquire) };
        let cached_cons = unsafe { (*ring.consumer).load(Ordering::Relaxed) };
        ConsRing {
            ring,
            cached_prod,
            cached_cons,
            _marker: std::marker::PhantomData,
        }
    }

    fn pop(&mut self) -> Option<T> {
        if self.cached_cons == self.cached_prod {
            self.cached_prod = unsafe { (*self.ring.producer).load(Ordering::Acquire) };
            if self.cached_cons == self.cached_prod {
                return None;
            }
        }
        let idx = (self.cached_cons & (self.ring.size - 1)) as usize;
        let v = unsafe { *(self.ring.desc as *const T).add(idx) };
        self.cached_cons = self.cached_cons.wrapping_add(1);
        Some(v)
    }

    fn commit(&mut self) {
        unsafe {
            (*self.ring.consumer).store(self.cached_cons, Ordering::Release);
        }
    }
}

struct Umem {
    ptr: *mut u8,
    len: usize,
}

impl Drop for Umem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut c_void, self.len);
        }
    }
}

/// one AF_XDP socket bound to one nic queue
pub struct Xsk {
    fd: OwnedFd,
    umem: Umem,
    fill: ProdRing<u64>,
    completion: ConsRing<u64>,
    rx: ConsRing<XdpDesc>,
    tx: ProdRing<XdpDesc>,
    /// frame addresses not currently lent to the kernel
    free: Vec<u64>,
    counters: IoCounters,
    ifindex: u32,
    queue_id: u32,
}

#[inline(always)]
fn frame_base(addr: u64) -> u64 {
    addr & !(NET_MTU as u64 - 1)
}

impl Xsk {
    /// create an AF_XDP socket, register its UMEM, map the four rings
    /// and bind to `ifindex` queue `queue_id`
    pub fn bind(ifindex: u32, queue_id: u32, cfg: XskConfig) -> Result<Xsk, NetError> {
        assert!(cfg.rx_depth.is_power_of_two() && cfg.tx_depth.is_power_of_two());

        let fd = unsafe { libc::socket(AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(NetError::Sys("socket(AF_XDP)", errno()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let frame_cnt = ((cfg.rx_depth + cfg.tx_depth) * 2) as usize;
        let umem_len = frame_cnt * NET_MTU;
        let umem_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                umem_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if umem_ptr == libc::MAP_FAILED {
            return Err(NetError::Sys("mmap(umem)", errno()));
        }
        let umem = Umem {
            ptr: umem_ptr as *mut u8,
            len: umem_len,
        };
        if unsafe { libc::mlock(umem_ptr, umem_len) } != 0 {
            log::warn!("mlock(umem) failed (errno {}), frames may page out", errno());
        }

        let reg = XdpUmemReg {
            addr: umem.ptr as u64,
            len: umem_len as u64,
            chunk_size: NET_MTU as u32,
            headroom: 0,
            flags: 0,
        };
        setsockopt(&fd, XDP_UMEM_REG, &reg)?;
        setsockopt(&fd, XDP_UMEM_FILL_RING, &cfg.rx_depth)?;
        setsockopt(&fd, XDP_UMEM_COMPLETION_RING, &cfg.tx_depth)?;
        setsockopt(&fd, XDP_RX_RING, &cfg.rx_depth)?;
        setsockopt(&fd, XDP_TX_RING, &cfg.tx_depth)?;

        let mut off = XdpMmapOffsets::default();
        let mut optlen = mem::size_of::<XdpMmapOffsets>() as u32;
        let rc = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut off as *mut _ as *mut c_void,
                &mut optlen,
            )
        };
        if rc != 0 {
            return Err(NetError::Sys("getsockopt(XDP_MMAP_OFFSETS)", errno()));
        }
        if optlen as usize != mem::size_of::<XdpMmapOffsets>() {
            return Err(NetError::Config(
                "kernel does not report xdp ring flags offsets (pre-5.4)".to_string(),
            ));
        }

        let raw = fd.as_raw_fd();
        let fill = ProdRing::new(RingMap::mmap(
            raw,
            XDP_UMEM_PGOFF_FILL_RING,
            &off.fr,
            cfg.rx_depth,
            mem::size_of::<u64>(),
        )?);
        let completion = ConsRing::new(RingMap::mmap(
            raw,
            XDP_UMEM_PGOFF_COMPLETION_RING,
            &off.cr,
            cfg.tx_depth,
            mem::size_of::<u64>(),
        )?);
        let rx = ConsRing::new(RingMap::mmap(
            raw,
            XDP_PGOFF_RX_RING,
            &off.rx,
            cfg.rx_depth,
            mem::size_of::<XdpDesc>(),
        )?);
        let tx = ProdRing::new(RingMap::mmap(
            raw,
            XDP_PGOFF_TX_RING,
            &off.tx,
            cfg.tx_depth,
            mem::size_of::<XdpDesc>(),
        )?);

        let mode = if cfg.zero_copy { XDP_ZEROCOPY } else { XDP_COPY };
        let sa = SockaddrXdp {
            sxdp_family: AF_XDP as u16,
            sxdp_flags: mode | XDP_USE_NEED_WAKEUP,
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: 0,
        };
        let rc = unsafe {
            libc::bind(
                raw,
                &sa as *const _ as *const libc::sockaddr,
                mem::size_of::<SockaddrXdp>() as u32,
            )
        };
        if rc != 0 {
            return Err(NetError::Sys("bind(AF_XDP)", errno()));
        }

        let free = (0..frame_cnt as u64).map(|i| i * NET_MTU as u64).collect();

        log::info!(
            "xsk bound: ifindex {ifindex} queue {queue_id} rx {} tx {} {}",
            cfg.rx_depth,
            cfg.tx_depth,
            if cfg.zero_copy { "zero-copy" } else { "copy" },
        );

        Ok(Xsk {
            fd,
            umem,
            fill,
            completion,
            rx,
            tx,
            free,
            counters: IoCounters::default(),
            ifindex,
            queue_id,
        })
    }

    /// insert this socket into the xdp program's socket map
    pub fn activate(&self, prog: &mut crate::program::XdpProgram) -> Result<(), NetError> {
        prog.register_socket(self.queue_id, self.fd.as_raw_fd())
    }

    /// drive all four rings once. received frames, up to `burst`, are
    /// handed to `rx` as borrowed slices valid for the duration of the
    /// call. never blocks; returns whether any work was done.
    pub fn service(&mut self, burst: usize, rx: &mut dyn FnMut(&[u8])) -> bool {
        let mut busy = false;

        // completed transmits back to the free pool
        let mut n = 0usize;
        while let Some(addr) = self.completion.pop() {
            self.free.push(frame_base(addr));
            n += 1;
        }
        if n > 0 {
            self.completion.commit();
            busy = true;
        }

        // keep the kernel stocked with rx frames
        let mut n = 0usize;
        while !self.free.is_empty() {
            let addr = *self.free.last().unwrap();
            if !self.fill.push(addr) {
                break;
            }
            self.free.pop();
            n += 1;
        }
        if n > 0 {
            self.fill.commit();
            busy = true;
            if self.fill.needs_wakeup() {
                self.wake_rx();
            }
        }

        // drain received frames
        let base = self.umem.ptr;
        let mut n = 0usize;
        while n < burst {
            let Some(desc) = self.rx.pop() else { break };
            let len = desc.len as usize;
            self.counters.rx_pkts += 1;
            self.counters.rx_bytes += len as u64;
            let buf = unsafe { std::slice::from_raw_parts(base.add(desc.addr as usize), len) };
            rx(buf);
            self.free.push(frame_base(desc.addr));
            n += 1;
        }
        if n > 0 {
            self.rx.commit();
            busy = true;
        }

        busy
    }

    /// copy one frame into a free UMEM frame and queue it on the tx
    /// ring. false means the frame was dropped (pool or ring full).
    pub fn tx_enqueue(&mut self, buf: &[u8]) -> bool {
        assert!(buf.len() <= NET_MTU);
        let Some(addr) = self.free.pop() else {
            return false;
        };
        if self.tx.free_slots() == 0 {
            self.free.push(addr);
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.umem.ptr.add(addr as usize), buf.len());
        }
        self.tx.push(XdpDesc {
            addr,
            len: buf.len() as u32,
            options: 0,
        });
        self.counters.tx_pkts += 1;
        self.counters.tx_bytes += buf.len() as u64;
        true
    }

    /// publish queued tx descriptors and kick the kernel if it asked
    pub fn tx_flush(&mut self) {
        self.tx.commit();
        if self.tx.needs_wakeup() {
            self.wake_tx();
        }
    }

    fn wake_tx(&self) {
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                ptr::null(),
                0,
                MSG_DONTWAIT,
                ptr::null(),
                0,
            )
        };
        if rc < 0 {
            let e = errno();
            // transient driver backpressure is expected here
            if e != libc::EAGAIN && e != libc::EBUSY && e != libc::ENOBUFS {
                log::warn!("xsk tx wakeup failed (errno {e})");
            }
        }
    }

    fn wake_rx(&self) {
        unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                ptr::null_mut(),
                0,
                MSG_DONTWAIT,
                ptr::null_mut(),
                ptr::null_mut(),
            );
        }
    }

    /// fetch kernel drop/error statistics into the metrics sink.
    /// invalid-descriptor counters are zero in correct operation; a
    /// nonzero value means we published garbage and must not continue.
    pub fn poll_statistics(&self, metrics: &NetMetrics) {
        let mut stats = XdpStatistics::default();
        let mut optlen = mem::size_of::<XdpStatistics>() as u32;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                SOL_XDP,
                XDP_STATISTICS,
                &mut stats as *mut _ as *mut c_void,
                &mut optlen,
            )
        };
        if rc != 0 {
            panic!("getsockopt(SOL_XDP, XDP_STATISTICS) failed (errno {})", errno());
        }

        match optlen {
            XDP_STATISTICS_V1_SZ => {
                metrics.xdp_rx_dropped_other.set(stats.rx_dropped);
                metrics.xdp_rx_dropped_ring_full.set(stats.rx_ring_full);
                // occasionally nonzero; counted, never asserted zero
                metrics
                    .xdp_rx_fill_ring_empty
                    .set(stats.rx_fill_ring_empty_descs);
                metrics.xdp_tx_ring_empty.set(stats.tx_ring_empty_descs);
            }
            XDP_STATISTICS_V0_SZ => {
                metrics.xdp_rx_dropped_other.set(stats.rx_dropped);
            }
            n => panic!("getsockopt(SOL_XDP, XDP_STATISTICS) returned unexpected size {n}"),
        }
        if stats.rx_invalid_descs != 0 || stats.tx_invalid_descs != 0 {
            panic!(
                "xsk published invalid descriptors (rx {} tx {}), ring accounting is corrupt",
                stats.rx_invalid_descs, stats.tx_invalid_descs
            );
        }
    }

    pub fn counters(&self) -> IoCounters {
        self.counters
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }
}

impl AsRawFd for Xsk {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn setsockopt<T>(fd: &OwnedFd, opt: i32, val: &T) -> Result<(), NetError> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_XDP,
            opt,
            val as *const T as *const c_void,
            mem::size_of::<T>() as u32,
        )
    };
    if rc != 0 {
        return Err(NetError::Sys("setsockopt(SOL_XDP)", errno()));
    }
    Ok(())
}
