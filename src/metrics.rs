// operational counters shared with the metrics reporter

use std::sync::atomic::{AtomicU64, Ordering};

/// cache-line aligned counter so adjacent counters never share a line
#[repr(align(64))]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    #[inline(always)]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    /// overwrite with an externally aggregated value
    #[inline(always)]
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new()
    }
}

/// counter sink for one shard. rx/tx totals are rotated in by the
/// dispatcher's metrics phase; drop counters are incremented in place.
#[derive(Default)]
pub struct NetMetrics {
    pub received_packets: Counter,
    pub received_bytes: Counter,
    pub sent_packets: Counter,
    pub sent_bytes: Counter,
    pub tx_dropped: Counter,
    pub xdp_rx_dropped_other: Counter,
    pub xdp_rx_dropped_ring_full: Counter,
    /// kernel found the fill ring empty on packet arrival. occasionally
    /// nonzero in practice, so counted rather than asserted zero.
    pub xdp_rx_fill_ring_empty: Counter,
    /// kernel found the tx ring empty on a transmit wakeup; same story
    pub xdp_tx_ring_empty: Counter,
    /// frames whose udp header ran past the end of the packet
    pub rx_undersized: Counter,
}

impl NetMetrics {
    pub const fn new() -> Self {
        NetMetrics {
            received_packets: Counter::new(),
            received_bytes: Counter::new(),
            sent_packets: Counter::new(),
            sent_bytes: Counter::new(),
            tx_dropped: Counter::new(),
            xdp_rx_dropped_other: Counter::new(),
            xdp_rx_dropped_ring_full: Counter::new(),
            xdp_rx_fill_ring_empty: Counter::new(),
            xdp_tx_ring_empty: Counter::new(),
            rx_undersized: Counter::new(),
        }
    }
}
