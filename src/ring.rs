// SPSC meta+data ring shared with the worker stages
//
// a ring is a power-of-two array of frag meta entries plus a data region
// carved into MTU-sized chunks. the producer writes the payload into a
// chunk, writes the meta entry at seq % depth, then advances a published
// sequence cell with release ordering; a consumer that observes the new
// sequence is therefore guaranteed to observe the entry and the payload.
// all addressing is (base, byte offset) so the same layout works when the
// mapping is shared across processes.

use {
    crate::NET_MTU,
    std::{
        io, ptr,
        sync::atomic::{AtomicU64, Ordering},
    },
};

/// meta-ring entry describing one published payload chunk
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FragMeta {
    pub sig: u64,
    pub chunk: u32,
    pub sz: u16,
    pub ctl: u16,
    pub tsorig: u32,
    pub tspub: u32,
}

/// resolve a chunk offset to a linear address
#[inline(always)]
pub fn chunk_to_ptr(base: *mut u8, chunk: u64) -> *mut u8 {
    unsafe { base.add(chunk as usize) }
}

/// advance to the next chunk, wrapping to chunk0 past the watermark.
/// wraps after exactly (wmark - chunk0) / MTU + 1 steps.
#[inline(always)]
pub fn chunk_next(chunk: u64, chunk0: u64, wmark: u64) -> u64 {
    let next = chunk + NET_MTU as u64;
    if next > wmark {
        chunk0
    } else {
        next
    }
}

/// one ring's backing memory: [ seq cell | meta entries | data chunks ].
/// created MAP_SHARED so forked shards and the consuming stage observe
/// the same bytes.
pub struct RingBuf {
    base: *mut u8,
    len: usize,
    depth: u64,
    chunk0: u64,
    wmark: u64,
}

// the mapping is plain shared memory; the SPSC discipline is on the
// producer/consumer handles, not the buffer itself
unsafe impl Send for RingBuf {}
unsafe impl Sync for RingBuf {}

const META_OFF: usize = 64;

impl RingBuf {
    /// map a fresh ring with `depth` meta entries (power of two) and
    /// `chunk_cnt` payload chunks
    pub fn alloc(depth: u64, chunk_cnt: u64) -> io::Result<RingBuf> {
        assert!(depth.is_power_of_two(), "ring depth must be a power of two");
        assert!(chunk_cnt > 0);

        let meta_bytes = depth as usize * std::mem::size_of::<FragMeta>();
        let chunk0 = (META_OFF + meta_bytes + 63) & !63;
        let len = chunk0 + chunk_cnt as usize * NET_MTU;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(RingBuf {
            base: base as *mut u8,
            len,
            depth,
            chunk0: chunk0 as u64,
            wmark: chunk0 as u64 + (chunk_cnt - 1) * NET_MTU as u64,
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// lowest valid chunk offset of the data region
    #[inline]
    pub fn chunk0(&self) -> u64 {
        self.chunk0
    }

    /// last valid chunk starting offset
    #[inline]
    pub fn wmark(&self) -> u64 {
        self.wmark
    }

    fn sync(&self) -> *const AtomicU64 {
        self.base as *const AtomicU64
    }

    fn meta(&self) -> *mut FragMeta {
        unsafe { self.base.add(META_OFF) as *mut FragMeta }
    }

    /// producer handle. exactly one may be live per ring.
    pub fn producer(&self) -> RingProducer {
        let sync = self.sync();
        let seq = unsafe { (*sync).load(Ordering::Acquire) };
        RingProducer {
            meta: self.meta(),
            sync,
            depth: self.depth,
            seq,
        }
    }

    /// consumer handle, joined at the current published sequence
    pub fn consumer(&self) -> RingConsumer {
        let sync = self.sync();
        let seq = unsafe { (*sync).load(Ordering::Acquire) };
        RingConsumer {
            meta: self.meta() as *const FragMeta,
            sync,
            depth: self.depth,
            seq,
        }
    }
}

impl Drop for RingBuf {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// publishing side of a ring. the caller copies the payload into the
/// chunk first; `publish` makes entry and payload visible atomically
/// from the consumer's point of view.
pub struct RingProducer {
    meta: *mut FragMeta,
    sync: *const AtomicU64,
    depth: u64,
    seq: u64,
}

unsafe impl Send for RingProducer {}

impl RingProducer {
    pub fn publish(&mut self, sig: u64, chunk: u64, sz: u16, ctl: u16, tsorig: u32, tspub: u32) {
        let slot = (self.seq & (self.depth - 1)) as usize;
        unsafe {
            *self.meta.add(slot) = FragMeta {
                sig,
                chunk: chunk as u32,
                sz,
                ctl,
                tsorig,
                tspub,
            };
            // payload and meta stores are ordered before the seq advance
            (*self.sync).store(self.seq + 1, Ordering::Release);
        }
        self.seq += 1;
    }

    /// next sequence number to be published
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// result of one consumer poll
#[derive(Clone, Copy, Debug)]
pub enum RingPoll {
    Empty,
    Frag { seq: u64, meta: FragMeta },
    /// fell more than one lap behind the producer; the consumer was
    /// resynced to the published sequence and `0` frags were skipped
    Overrun(u64),
}

/// consuming side of a ring. the consumer must stay within one lap of
/// the producer; falling behind is detected, not prevented.
pub struct RingConsumer {
    meta: *const FragMeta,
    sync: *const AtomicU64,
    depth: u64,
    seq: u64,
}

unsafe impl Send for RingConsumer {}

impl RingConsumer {
    pub fn poll(&mut self) -> RingPoll {
        let published = unsafe { (*self.sync).load(Ordering::Acquire) };
        if published == self.seq {
            return RingPoll::Empty;
        }
        if published.wrapping_sub(self.seq) > self.depth {
            let skipped = published - self.seq;
            self.seq = published;
            return RingPoll::Overrun(skipped);
        }
        let slot = (self.seq & (self.depth - 1)) as usize;
        let meta = unsafe { *self.meta.add(slot) };
        let seq = self.seq;
        self.seq += 1;
        RingPoll::Frag { seq, meta }
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}
