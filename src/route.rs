// cached next-hop and l2 resolution
//
// the resolver mirrors the kernel's neighbor and main routing tables
// into shard-local caches and answers, for one destination ip, where
// the frame has to go on the wire. it never blocks the fast path: a
// miss is reported as ProbeRequired/Retry and the frame is dropped,
// the dispatcher pulls the refresh deadline in and upstream resends.

use {
    crate::netlink::{
        MacAddress, Neighbor, NetlinkSocket, RouteEntry, NUD_FAILED, NUD_INCOMPLETE, NUD_NOARP,
        NUD_PERMANENT, RTN_BROADCAST, RTN_LOCAL, RTN_MULTICAST,
    },
    ahash::AHashMap,
    std::{
        io,
        net::Ipv4Addr,
        os::fd::RawFd,
        time::{Duration, Instant},
    },
};

/// default interval between kernel table refreshes
pub const TABLE_REFRESH_LAZY: Duration = Duration::from_secs(60);
/// refresh interval after a probe-required or retry event
pub const TABLE_REFRESH_FAST: Duration = Duration::from_micros(200);

/// resolution outcome for one destination ip
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// deliver locally (127/8 or one of our own addresses)
    Loopback,
    NoRoute,
    /// next hop known but no arp entry; probe and drop
    ProbeRequired { next_hop: Ipv4Addr, ifindex: u32 },
    /// arp resolution in flight; drop and re-check soon
    Retry,
    Success { mac: MacAddress, ifindex: u32 },
    Multicast,
    Broadcast,
}

#[derive(Clone, Copy)]
struct ArpEntry {
    mac: Option<MacAddress>,
    state: u16,
}

/// which table the in-flight refresh cycle is fetching next
#[derive(Clone, Copy)]
enum RefreshPhase {
    Arp,
    Routes,
}

pub struct Resolver {
    netlink: Option<NetlinkSocket>,
    arp: AHashMap<Ipv4Addr, ArpEntry>,
    /// sorted by prefix length, longest first
    routes: Vec<RouteEntry>,
    src_ip: Ipv4Addr,
    phase: RefreshPhase,
}

impl Resolver {
    /// resolver backed by a live netlink socket. blocks only here, at
    /// bootstrap, to warm both tables before the loop starts.
    pub fn new(src_ip: Ipv4Addr) -> io::Result<Resolver> {
        let mut r = Resolver {
            netlink: Some(NetlinkSocket::open()?),
            arp: AHashMap::new(),
            routes: Vec::new(),
            src_ip,
            phase: RefreshPhase::Arp,
        };
        let deadline = Instant::now() + Duration::from_secs(1);
        while !r.refresh_step()? {
            if Instant::now() > deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "netlink table warm-up timed out",
                ));
            }
            std::thread::yield_now();
        }
        Ok(r)
    }

    /// resolver over fixed tables; refreshes are no-ops. used at
    /// bootstrap before netlink is available and by tests.
    pub fn with_tables(
        src_ip: Ipv4Addr,
        neighbors: &[Neighbor],
        routes: &[RouteEntry],
    ) -> Resolver {
        let mut r = Resolver {
            netlink: None,
            arp: AHashMap::new(),
            routes: Vec::new(),
            src_ip,
            phase: RefreshPhase::Arp,
        };
        for n in neighbors {
            r.insert_neighbor(*n);
        }
        for e in routes {
            r.insert_route(*e);
        }
        r
    }

    /// drive the arp+route refresh one non-blocking step. Ok(true)
    /// when both tables have been re-fetched; Ok(false) while a kernel
    /// reply is still in flight, poll again on a later tick.
    pub fn refresh_step(&mut self) -> io::Result<bool> {
        if self.netlink.is_none() {
            return Ok(true);
        }
        match self.phase {
            RefreshPhase::Arp => {
                let Some(neighbors) = self.netlink.as_mut().unwrap().poll_neighbors()? else {
                    return Ok(false);
                };
                self.set_neighbors(neighbors);
                self.phase = RefreshPhase::Routes;
                // kick off the route dump right away; the kernel often
                // fills it on the same poll
                if let Some(routes) = self.netlink.as_mut().unwrap().poll_routes()? {
                    self.set_routes(routes);
                    self.phase = RefreshPhase::Arp;
                    return Ok(true);
                }
                Ok(false)
            }
            RefreshPhase::Routes => {
                let Some(routes) = self.netlink.as_mut().unwrap().poll_routes()? else {
                    return Ok(false);
                };
                self.set_routes(routes);
                self.phase = RefreshPhase::Arp;
                Ok(true)
            }
        }
    }

    /// poll a one-shot neighbor refetch. Ok(true) when the arp table
    /// was just rebuilt; Ok(false) while the reply is pending or the
    /// socket is busy with a route dump.
    pub fn fetch_arp(&mut self) -> io::Result<bool> {
        if self.netlink.is_none() {
            return Ok(true);
        }
        let Some(neighbors) = self.netlink.as_mut().unwrap().poll_neighbors()? else {
            return Ok(false);
        };
        self.set_neighbors(neighbors);
        Ok(true)
    }

    fn set_neighbors(&mut self, neighbors: Vec<Neighbor>) {
        self.arp.clear();
        for n in neighbors {
            self.arp.insert(
                n.ip,
                ArpEntry {
                    mac: n.mac,
                    state: n.state,
                },
            );
        }
    }

    fn set_routes(&mut self, routes: Vec<RouteEntry>) {
        self.routes.clear();
        self.routes.extend(routes);
        self.routes.sort_by(|a, b| b.prefix_len.cmp(&a.prefix_len));
    }

    pub fn insert_neighbor(&mut self, n: Neighbor) {
        self.arp.insert(
            n.ip,
            ArpEntry {
                mac: n.mac,
                state: n.state,
            },
        );
    }

    pub fn insert_route(&mut self, e: RouteEntry) {
        self.routes.push(e);
        self.routes.sort_by(|a, b| b.prefix_len.cmp(&a.prefix_len));
    }

    /// record that a probe went out for `next_hop`, so the next lookup
    /// reports Retry instead of probing again. returns false if an
    /// entry already exists and no probe should be sent.
    pub fn note_probe_sent(&mut self, next_hop: Ipv4Addr) -> bool {
        match self.arp.get(&next_hop) {
            Some(e) if e.state & NUD_FAILED == 0 => false,
            _ => {
                self.arp.insert(
                    next_hop,
                    ArpEntry {
                        mac: None,
                        state: NUD_INCOMPLETE,
                    },
                );
                true
            }
        }
    }

    /// resolve one destination against the cached tables
    pub fn route(&self, dst: Ipv4Addr) -> Route {
        if dst.is_loopback() || dst == self.src_ip {
            return Route::Loopback;
        }
        if dst.is_multicast() {
            return Route::Multicast;
        }
        if dst == Ipv4Addr::BROADCAST {
            return Route::Broadcast;
        }

        let Some(entry) = self.lookup_route(dst) else {
            return Route::NoRoute;
        };
        match entry.rtype {
            RTN_LOCAL => return Route::Loopback,
            RTN_BROADCAST => return Route::Broadcast,
            RTN_MULTICAST => return Route::Multicast,
            _ => {}
        }

        let next_hop = entry.gateway.unwrap_or(dst);
        let ifindex = entry.oif;
        match self.arp.get(&next_hop) {
            None => Route::ProbeRequired { next_hop, ifindex },
            Some(e) if e.state & NUD_FAILED != 0 => Route::ProbeRequired { next_hop, ifindex },
            Some(e) => match e.mac {
                Some(mac) if e.state & NUD_INCOMPLETE == 0 => Route::Success { mac, ifindex },
                Some(mac) if e.state & (NUD_PERMANENT | NUD_NOARP) != 0 => {
                    Route::Success { mac, ifindex }
                }
                _ => Route::Retry,
            },
        }
    }

    /// resolve for an imminent transmit: on a probe-required miss,
    /// another shard may already have resolved the address, so try one
    /// non-blocking arp refetch before reporting the miss. if the
    /// kernel reply is not in yet the frame is dropped either way.
    pub fn resolve_for_tx(&mut self, dst: Ipv4Addr) -> Route {
        let first = self.route(dst);
        if let Route::ProbeRequired { .. } = first {
            if matches!(self.fetch_arp(), Ok(true)) {
                return self.route(dst);
            }
        }
        first
    }

    fn lookup_route(&self, dst: Ipv4Addr) -> Option<&RouteEntry> {
        let dst = u32::from(dst);
        self.routes.iter().find(|r| {
            let mask = if r.prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - r.prefix_len as u32)
            };
            dst & mask == u32::from(r.dst) & mask
        })
    }

    pub fn netlink_fd(&self) -> Option<RawFd> {
        self.netlink.as_ref().map(|n| n.as_raw_fd())
    }
}
