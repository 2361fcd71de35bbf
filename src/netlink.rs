// rtnetlink reader for the neighbor (arp) and routing tables
//
// a dump request is a single datagram; the kernel answers with a
// multipart stream terminated by NLMSG_DONE. the socket is strictly
// non-blocking: a poll that finds no data reports the dump as still in
// flight and the caller re-polls on a later housekeeping iteration, so
// a slow reply never parks the shard's cooperative loop. at most one
// dump is in flight per socket (the kernel rejects overlapping dumps).

use {
    std::{
        fmt, io, mem,
        net::Ipv4Addr,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        ptr,
        str::FromStr,
    },
    libc::{c_void, nlmsghdr, sockaddr_nl, AF_INET, AF_NETLINK, NETLINK_ROUTE, SOCK_RAW},
};

pub const NUD_INCOMPLETE: u16 = 0x01;
pub const NUD_REACHABLE: u16 = 0x02;
pub const NUD_STALE: u16 = 0x04;
pub const NUD_DELAY: u16 = 0x08;
pub const NUD_PROBE: u16 = 0x10;
pub const NUD_FAILED: u16 = 0x20;
pub const NUD_NOARP: u16 = 0x40;
pub const NUD_PERMANENT: u16 = 0x80;

const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PREFSRC: u16 = 7;

const RT_TABLE_MAIN: u8 = 254;

pub const RTN_UNICAST: u8 = 1;
pub const RTN_LOCAL: u8 = 2;
pub const RTN_BROADCAST: u8 = 3;
pub const RTN_MULTICAST: u8 = 5;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for MacAddress {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let mut mac = [0u8; 6];
        let mut parts = s.split(':');
        for byte in mac.iter_mut() {
            *byte = u8::from_str_radix(parts.next().ok_or(())?, 16).map_err(|_| ())?;
        }
        if parts.next().is_some() {
            return Err(());
        }
        Ok(MacAddress(mac))
    }
}

/// one arp table entry as reported by the kernel
#[derive(Clone, Copy, Debug)]
pub struct Neighbor {
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddress>,
    pub ifindex: u32,
    pub state: u16,
}

/// one routing table entry (main table, ipv4 unicast and friends)
#[derive(Clone, Copy, Debug)]
pub struct RouteEntry {
    pub dst: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub oif: u32,
    pub pref_src: Option<Ipv4Addr>,
    pub rtype: u8,
}

// netlink structs libc does not carry

#[repr(C)]
struct NdMsg {
    ndm_family: u8,
    ndm_pad1: u8,
    ndm_pad2: u16,
    ndm_ifindex: i32,
    ndm_state: u16,
    ndm_flags: u8,
    ndm_type: u8,
}

#[repr(C)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

#[repr(C)]
struct RtAttr {
    rta_len: u16,
    rta_type: u16,
}

const NLMSG_HDRLEN: usize = 16;

#[inline]
fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// an in-flight dump: request type plus the multipart data received so
/// far, accumulated across polls
struct PendingDump {
    msg_type: u16,
    buf: Vec<u8>,
}

/// abandon a dump whose reply grew past any sane table size
const DUMP_MAX_BYTES: usize = 1 << 22;

pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
    pending: Option<PendingDump>,
}

impl NetlinkSocket {
    pub fn open() -> io::Result<NetlinkSocket> {
        unsafe {
            let fd = libc::socket(
                AF_NETLINK,
                SOCK_RAW | libc::SOCK_NONBLOCK,
                NETLINK_ROUTE,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let mut addr: sockaddr_nl = mem::zeroed();
            addr.nl_family = AF_NETLINK as u16;
            if libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<sockaddr_nl>() as u32,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }

            Ok(NetlinkSocket {
                fd,
                seq: 1,
                pending: None,
            })
        }
    }

    /// poll the ipv4 neighbor table dump. Ok(None) means the reply is
    /// still in flight (or another dump holds the socket); poll again
    /// on a later iteration.
    pub fn poll_neighbors(&mut self) -> io::Result<Option<Vec<Neighbor>>> {
        let Some(buf) = self.poll_dump(libc::RTM_GETNEIGH)? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        walk_msgs(&buf, |ty, payload| {
            if ty == libc::RTM_NEWNEIGH {
                if let Some(n) = parse_neigh(payload) {
                    out.push(n);
                }
            }
        });
        Ok(Some(out))
    }

    /// poll the ipv4 main routing table dump, same contract as
    /// `poll_neighbors`
    pub fn poll_routes(&mut self) -> io::Result<Option<Vec<RouteEntry>>> {
        let Some(buf) = self.poll_dump(libc::RTM_GETROUTE)? else {
            return Ok(None);
        };
        let mut out = Vec::new();
        walk_msgs(&buf, |ty, payload| {
            if ty == libc::RTM_NEWROUTE {
                if let Some(r) = parse_route(payload) {
                    out.push(r);
                }
            }
        });
        Ok(Some(out))
    }

    /// drive one dump without blocking: start it if idle, drain
    /// whatever datagrams already arrived, and return the full reply
    /// once NLMSG_DONE shows up
    fn poll_dump(&mut self, msg_type: u16) -> io::Result<Option<Vec<u8>>> {
        match &self.pending {
            // a different dump owns the socket; let it finish first
            Some(p) if p.msg_type != msg_type => return Ok(None),
            Some(_) => {}
            None => {
                self.send_dump(msg_type)?;
                self.pending = Some(PendingDump {
                    msg_type,
                    buf: Vec::new(),
                });
            }
        }

        let mut chunk = vec![0u8; 1 << 16];
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    chunk.as_mut_ptr() as *mut c_void,
                    chunk.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    // nothing buffered yet; the reply is still on its way
                    return Ok(None);
                }
                self.pending = None;
                return Err(err);
            }
            if n == 0 {
                return Ok(None);
            }
            let part = &chunk[..n as usize];
            let done = dump_finished(part);
            let pending = self.pending.as_mut().unwrap();
            pending.buf.extend_from_slice(part);
            if pending.buf.len() > DUMP_MAX_BYTES {
                self.pending = None;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "netlink dump reply exceeded the size bound",
                ));
            }
            if done {
                return Ok(Some(self.pending.take().unwrap().buf));
            }
        }
    }

    fn send_dump(&mut self, msg_type: u16) -> io::Result<()> {
        // request: nlmsghdr + rtgenmsg-shaped family byte, padded
        #[repr(C)]
        struct DumpReq {
            hdr: nlmsghdr,
            family: u8,
            _pad: [u8; 3],
        }

        self.seq = self.seq.wrapping_add(1);
        let mut req: DumpReq = unsafe { mem::zeroed() };
        req.hdr.nlmsg_len = mem::size_of::<DumpReq>() as u32;
        req.hdr.nlmsg_type = msg_type;
        req.hdr.nlmsg_flags = (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16;
        req.hdr.nlmsg_seq = self.seq;
        req.family = AF_INET as u8;

        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                &req as *const _ as *const c_void,
                mem::size_of::<DumpReq>(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// scan one datagram for NLMSG_DONE / NLMSG_ERROR
fn dump_finished(buf: &[u8]) -> bool {
    let mut done = false;
    walk_msgs(buf, |ty, payload| {
        if ty == libc::NLMSG_DONE as u16 {
            done = true;
        } else if ty == libc::NLMSG_ERROR as u16 {
            let errno = if payload.len() >= 4 {
                i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]])
            } else {
                0
            };
            if errno != 0 {
                log::warn!("netlink dump error: errno {}", -errno);
            }
            done = true;
        }
    });
    done
}

/// walk a sequence of netlink messages, handing (type, payload) to `f`
fn walk_msgs(buf: &[u8], mut f: impl FnMut(u16, &[u8])) {
    let mut off = 0usize;
    while off + NLMSG_HDRLEN <= buf.len() {
        let hdr: nlmsghdr =
            unsafe { ptr::read_unaligned(buf[off..].as_ptr() as *const nlmsghdr) };
        let len = hdr.nlmsg_len as usize;
        if len < NLMSG_HDRLEN || off + len > buf.len() {
            break;
        }
        f(hdr.nlmsg_type, &buf[off + NLMSG_HDRLEN..off + len]);
        off += align4(len);
    }
}

/// iterate the rtattrs following a fixed header of `hdr_len` bytes
fn walk_attrs(payload: &[u8], hdr_len: usize, mut f: impl FnMut(u16, &[u8])) {
    let mut off = align4(hdr_len);
    while off + mem::size_of::<RtAttr>() <= payload.len() {
        let attr: RtAttr =
            unsafe { ptr::read_unaligned(payload[off..].as_ptr() as *const RtAttr) };
        let len = attr.rta_len as usize;
        if len < mem::size_of::<RtAttr>() || off + len > payload.len() {
            break;
        }
        f(attr.rta_type, &payload[off + mem::size_of::<RtAttr>()..off + len]);
        off += align4(len);
    }
}

fn ip4_attr(data: &[u8]) -> Option<Ipv4Addr> {
    if data.len() < 4 {
        return None;
    }
    Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn parse_neigh(payload: &[u8]) -> Option<Neighbor> {
    if payload.len() < mem::size_of::<NdMsg>() {
        return None;
    }
    let nd: NdMsg = unsafe { ptr::read_unaligned(payload.as_ptr() as *const NdMsg) };
    if nd.ndm_family != AF_INET as u8 {
        return None;
    }

    let mut ip = None;
    let mut mac = None;
    walk_attrs(payload, mem::size_of::<NdMsg>(), |ty, data| match ty {
        NDA_DST => ip = ip4_attr(data),
        NDA_LLADDR => {
            if data.len() >= 6 {
                mac = Some(MacAddress([
                    data[0], data[1], data[2], data[3], data[4], data[5],
                ]));
            }
        }
        _ => {}
    });

    Some(Neighbor {
        ip: ip?,
        mac,
        ifindex: nd.ndm_ifindex as u32,
        state: nd.ndm_state,
    })
}

fn parse_route(payload: &[u8]) -> Option<RouteEntry> {
    if payload.len() < mem::size_of::<RtMsg>() {
        return None;
    }
    let rt: RtMsg = unsafe { ptr::read_unaligned(payload.as_ptr() as *const RtMsg) };
    if rt.rtm_family != AF_INET as u8 || rt.rtm_table != RT_TABLE_MAIN {
        return None;
    }

    let mut dst = None;
    let mut gateway = None;
    let mut oif = 0u32;
    let mut pref_src = None;
    walk_attrs(payload, mem::size_of::<RtMsg>(), |ty, data| match ty {
        RTA_DST => dst = ip4_attr(data),
        RTA_GATEWAY => gateway = ip4_attr(data),
        RTA_PREFSRC => pref_src = ip4_attr(data),
        RTA_OIF => {
            if data.len() >= 4 {
                oif = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
            }
        }
        _ => {}
    });

    Some(RouteEntry {
        // default route carries no RTA_DST
        dst: dst.unwrap_or(Ipv4Addr::UNSPECIFIED),
        prefix_len: rt.rtm_dst_len,
        gateway,
        oif,
        pref_src,
        rtype: rt.rtm_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_attr(buf: &mut Vec<u8>, ty: u16, data: &[u8]) {
        let len = (mem::size_of::<RtAttr>() + data.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&ty.to_ne_bytes());
        buf.extend_from_slice(data);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    fn wrap_msg(ty: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = (NLMSG_HDRLEN + payload.len()) as u32;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&ty.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
        buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid
        buf.extend_from_slice(payload);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    #[test]
    fn parses_reachable_neighbor() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[AF_INET as u8, 0, 0, 0]); // family + pads
        payload.extend_from_slice(&2i32.to_ne_bytes()); // ifindex
        payload.extend_from_slice(&NUD_REACHABLE.to_ne_bytes());
        payload.extend_from_slice(&[0, 0]); // flags + type
        push_attr(&mut payload, NDA_DST, &[10, 0, 0, 2]);
        push_attr(&mut payload, NDA_LLADDR, &[1, 2, 3, 4, 5, 6]);

        let buf = wrap_msg(libc::RTM_NEWNEIGH, &payload);
        let mut got = Vec::new();
        walk_msgs(&buf, |ty, p| {
            assert_eq!(ty, libc::RTM_NEWNEIGH);
            got.push(parse_neigh(p).unwrap());
        });
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(got[0].mac, Some(MacAddress([1, 2, 3, 4, 5, 6])));
        assert_eq!(got[0].ifindex, 2);
        assert_eq!(got[0].state, NUD_REACHABLE);
    }

    #[test]
    fn parses_gateway_route() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[
            AF_INET as u8,
            24,            // dst_len
            0,
            0,
            RT_TABLE_MAIN, // table
            0,
            0,
            RTN_UNICAST,   // type
        ]);
        payload.extend_from_slice(&0u32.to_ne_bytes()); // flags
        push_attr(&mut payload, RTA_DST, &[10, 0, 0, 0]);
        push_attr(&mut payload, RTA_GATEWAY, &[10, 0, 0, 1]);
        push_attr(&mut payload, RTA_OIF, &3u32.to_ne_bytes());

        let buf = wrap_msg(libc::RTM_NEWROUTE, &payload);
        let mut got = Vec::new();
        walk_msgs(&buf, |_, p| got.push(parse_route(p).unwrap()));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].dst, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(got[0].prefix_len, 24);
        assert_eq!(got[0].gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(got[0].oif, 3);
        assert_eq!(got[0].rtype, RTN_UNICAST);
    }

    #[test]
    fn skips_foreign_table() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[AF_INET as u8, 32, 0, 0, 255, 0, 0, RTN_LOCAL]);
        payload.extend_from_slice(&0u32.to_ne_bytes());
        push_attr(&mut payload, RTA_DST, &[10, 0, 0, 1]);
        assert!(parse_route(&payload).is_none());
    }

    #[test]
    fn live_dump_completes_without_blocking() {
        // rtnetlink dumps need no privileges; skip quietly in
        // environments that forbid the socket entirely
        let Ok(mut sock) = NetlinkSocket::open() else {
            return;
        };
        for _ in 0..10_000 {
            match sock.poll_neighbors() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::yield_now(),
                Err(_) => return,
            }
        }
        panic!("neighbor dump never completed");
    }

    #[test]
    fn mac_address_parse_and_display() {
        let mac: MacAddress = "02:ab:cd:00:11:ff".parse().unwrap();
        assert_eq!(mac.0, [0x02, 0xab, 0xcd, 0x00, 0x11, 0xff]);
        assert_eq!(mac.to_string(), "02:ab:cd:00:11:ff");
        assert!("02:ab:cd".parse::<MacAddress>().is_err());
        assert!("02:ab:cd:00:11:ff:00".parse::<MacAddress>().is_err());
    }
}
