// batched packet i/o seam between the dispatcher and the xsk driver
//
// the dispatcher talks to `NetIo` only, so the egress path can be
// pointed at a capture sink in tests and at a real socket in
// production. `XskAio` is the production implementation: it owns the
// socket and adds the aio-depth batching on both directions.

use {
    crate::xsk::Xsk,
    std::os::fd::{AsRawFd, RawFd},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum AioError {
    /// not every frame in the batch could be queued; the excess was
    /// dropped, upstream owns any retransmit
    #[error("transmit backpressure, {sent} of {requested} frames queued")]
    Again { sent: usize, requested: usize },
}

/// rx/tx totals of one io endpoint
#[derive(Clone, Copy, Debug, Default)]
pub struct IoCounters {
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
}

impl IoCounters {
    pub fn accumulate(&mut self, other: IoCounters) {
        self.rx_pkts += other.rx_pkts;
        self.rx_bytes += other.rx_bytes;
        self.tx_pkts += other.tx_pkts;
        self.tx_bytes += other.tx_bytes;
    }
}

/// duplex packet endpoint. the receive callback must consume every
/// frame it is handed; there is no backpressure this far up the stack.
pub trait NetIo {
    /// drive the endpoint once, delivering received frames to `rx`.
    /// non-blocking; returns whether any work was done.
    fn service(&mut self, rx: &mut dyn FnMut(&[u8])) -> bool;

    /// queue a batch of frames for transmit, flushing to the wire when
    /// `flush` is set or the aio depth is reached
    fn send(&mut self, batch: &[&[u8]], flush: bool) -> Result<usize, AioError>;

    fn counters(&self) -> IoCounters;

    /// kernel statistics pass, meaningful for real sockets only
    fn poll_stats(&mut self, _metrics: &crate::metrics::NetMetrics) {}

    /// descriptor for the sandbox allowlist, if the endpoint has one
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// batched adapter over one AF_XDP socket
pub struct XskAio {
    xsk: Xsk,
    aio_depth: usize,
    pending: usize,
}

impl XskAio {
    pub fn new(xsk: Xsk, aio_depth: usize) -> XskAio {
        assert!(aio_depth > 0);
        XskAio {
            xsk,
            aio_depth,
            pending: 0,
        }
    }
}

impl NetIo for XskAio {
    fn service(&mut self, rx: &mut dyn FnMut(&[u8])) -> bool {
        self.xsk.service(self.aio_depth, rx)
    }

    fn send(&mut self, batch: &[&[u8]], flush: bool) -> Result<usize, AioError> {
        let mut sent = 0usize;
        for buf in batch {
            if !self.xsk.tx_enqueue(buf) {
                break;
            }
            sent += 1;
            self.pending += 1;
        }
        if self.pending > 0 && (flush || self.pending >= self.aio_depth) {
            self.xsk.tx_flush();
            self.pending = 0;
        }
        if sent < batch.len() {
            return Err(AioError::Again {
                sent,
                requested: batch.len(),
            });
        }
        Ok(sent)
    }

    fn counters(&self) -> IoCounters {
        self.xsk.counters()
    }

    fn poll_stats(&mut self, metrics: &crate::metrics::NetMetrics) {
        self.xsk.poll_statistics(metrics);
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.xsk.as_raw_fd())
    }
}
