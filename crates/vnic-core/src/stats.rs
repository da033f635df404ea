//! Per-queue counters.
//!
//! Written only by the context that owns the ring; `Relaxed` atomics let
//! a management thread read them without coordination.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct QueueStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    doorbells: AtomicU64,
    /// Completions naming a request id that was not in flight.
    bad_req_id: AtomicU64,
    /// Stale transmit slots seen by the watchdog, summed over scans.
    missing_tx: AtomicU64,
    /// Refills that posted fewer buffers than they allocated.
    refill_partial: AtomicU64,
    /// Refills that could not allocate at all.
    mbuf_alloc_fail: AtomicU64,
    /// Hardware reported an unusable descriptor count.
    bad_desc_num: AtomicU64,
    /// `prepare_tx` failed after admission passed.
    prepare_ctx_err: AtomicU64,
    l3_csum_bad: AtomicU64,
    l4_csum_good: AtomicU64,
    l4_csum_bad: AtomicU64,
    /// Received packets dropped during reassembly.
    rx_drops: AtomicU64,
    /// Transmit packets dropped (too many segments).
    tx_dropped: AtomicU64,
    /// Transmit bursts stopped on a full ring.
    tx_busy: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $inc:ident),* $(,)?) => {
        impl QueueStats {
            $(
                #[inline]
                pub fn $inc(&self, n: u64) {
                    self.$name.fetch_add(n, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> QueueStatsSnapshot {
                QueueStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }

        /// Point-in-time copy of `QueueStats`.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct QueueStatsSnapshot {
            $(pub $name: u64,)*
        }
    };
}

counter! {
    packets => add_packets,
    bytes => add_bytes,
    doorbells => add_doorbells,
    bad_req_id => add_bad_req_id,
    missing_tx => add_missing_tx,
    refill_partial => add_refill_partial,
    mbuf_alloc_fail => add_mbuf_alloc_fail,
    bad_desc_num => add_bad_desc_num,
    prepare_ctx_err => add_prepare_ctx_err,
    l3_csum_bad => add_l3_csum_bad,
    l4_csum_good => add_l4_csum_good,
    l4_csum_bad => add_l4_csum_bad,
    rx_drops => add_rx_drops,
    tx_dropped => add_tx_dropped,
    tx_busy => add_tx_busy,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// One packet of `len` bytes.
    #[inline]
    pub fn record_packet(&self, len: u64) {
        self.add_packets(1);
        self.add_bytes(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let s = QueueStats::new();
        s.record_packet(64);
        s.record_packet(1500);
        s.add_doorbells(1);
        s.add_missing_tx(3);
        let snap = s.snapshot();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.bytes, 1564);
        assert_eq!(snap.doorbells, 1);
        assert_eq!(snap.missing_tx, 3);
        assert_eq!(snap.refill_partial, 0);
        s.reset();
        assert_eq!(s.snapshot(), QueueStatsSnapshot::default());
    }
}
