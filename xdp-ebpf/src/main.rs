#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, XskMap},
    programs::XdpContext,
};
use core::mem;

// maps queue_id -> AF_XDP socket fd, filled by the userspace installer
#[map]
static XSKS_MAP: XskMap = XskMap::with_max_entries(64, 0);

// the six udp listen ports we own; 0 entries are disabled
#[map]
static LISTEN_PORTS: Array<u16> = Array::with_max_entries(6, 0);

const ETH_HDR_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IPPROTO_UDP: u8 = 17;

#[xdp]
pub fn xdp_dispatch(ctx: XdpContext) -> u32 {
    match try_dispatch(&ctx) {
        Ok(action) => action,
        Err(_) => xdp_action::XDP_PASS,
    }
}

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    if start + offset + mem::size_of::<T>() > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[inline(always)]
fn try_dispatch(ctx: &XdpContext) -> Result<u32, ()> {
    // everything that is not udp/ipv4 on one of our ports stays with
    // the kernel stack
    let ethertype = u16::from_be(unsafe { *ptr_at::<u16>(ctx, 12)? });
    if ethertype != ETHERTYPE_IPV4 {
        return Ok(xdp_action::XDP_PASS);
    }

    let ip_proto = unsafe { *ptr_at::<u8>(ctx, ETH_HDR_LEN + 9)? };
    if ip_proto != IPPROTO_UDP {
        return Ok(xdp_action::XDP_PASS);
    }

    let ihl = (unsafe { *ptr_at::<u8>(ctx, ETH_HDR_LEN)? } & 0x0f) as usize;
    let udp_off = ETH_HDR_LEN + ihl * 4;
    let dst_port = u16::from_be(unsafe { *ptr_at::<u16>(ctx, udp_off + 2)? });

    let mut owned = false;
    for i in 0..6u32 {
        if let Some(port) = LISTEN_PORTS.get(i) {
            if *port != 0 && *port == dst_port {
                owned = true;
            }
        }
    }
    if !owned {
        return Ok(xdp_action::XDP_PASS);
    }

    // steer to the socket bound to the receiving queue
    let queue_id = unsafe { (*ctx.ctx).rx_queue_index };
    XSKS_MAP.redirect(queue_id, 0).map_err(|_| ())?;
    Ok(xdp_action::XDP_REDIRECT)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
