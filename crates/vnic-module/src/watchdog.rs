//! Missing transmit completion detection.
//!
//! Every submitted tx request stamps its slot with the clock. A periodic
//! `tick` walks a few queues per call, round robin, and counts slots
//! older than the timeout. Each stale slot is logged once; the count is
//! added to `missing_tx` on every scan it is seen in. A scan that counts
//! more than the queue's threshold requests `MissingTxCompletion`.

use crate::tx_ring::TxRing;

use vnic_core::config::WatchdogConfig;
use vnic_core::queue::CompletionQueue;
use vnic_core::reset::{ResetReason, ResetRequest, ResetSignal};

/// Submission time of one tx slot. `timestamp == 0` means idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotTimer {
    pub timestamp: u64,
    pub warned: bool,
}

impl SlotTimer {
    pub const IDLE: Self = Self { timestamp: 0, warned: false };

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.timestamp == 0
    }
}

/// Result of scanning one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueScan {
    /// Slots past the timeout.
    pub missed: u32,
    /// Of those, slots logged for the first time.
    pub newly_warned: u32,
}

pub struct Watchdog {
    cfg: WatchdogConfig,
    next_qid: usize,
    reset: ResetSignal,
}

impl Watchdog {
    pub fn new(cfg: WatchdogConfig, reset: ResetSignal) -> Self {
        Self { cfg, next_qid: 0, reset }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.cfg
    }

    /// Queue the next tick starts from.
    pub fn next_qid(&self) -> usize {
        self.next_qid
    }

    /// Scan one queue at `now_ns`.
    pub fn check<Q: CompletionQueue>(&self, ring: &mut TxRing<Q>, now_ns: u64) -> Result<QueueScan, ResetRequest> {
        let timeout = match self.cfg.timeout {
            Some(t) => t.as_nanos() as u64,
            None => return Ok(QueueScan::default()),
        };
        let qid = ring.qid();
        let threshold = ring.missing_threshold();
        let scan = scan_timers(qid, ring.timers_mut(), now_ns, timeout);

        ring.stats().add_missing_tx(scan.missed as u64);
        if scan.missed > threshold {
            tracing::error!(qid, missed = scan.missed, threshold, "missing tx completions above threshold");
            return Err(self.reset.trigger(ResetReason::MissingTxCompletion));
        }
        Ok(scan)
    }

    /// Scan up to `queue_budget` queues, continuing where the last tick
    /// stopped. `None` entries are queues not started. Returns the total
    /// of missing completions seen.
    pub fn tick<Q: CompletionQueue>(
        &mut self,
        rings: &mut [Option<TxRing<Q>>],
        now_ns: u64,
    ) -> Result<u32, ResetRequest> {
        if self.cfg.timeout.is_none() || rings.is_empty() {
            return Ok(0);
        }
        if let Some(reason) = self.reset.pending() {
            tracing::trace!(%reason, "reset pending, watchdog idle");
            return Ok(0);
        }

        let n = rings.len();
        let budget = self.cfg.queue_budget.min(n);
        let stall_ns = self.cfg.stall_delay.map(|d| d.as_nanos() as u64);
        let mut qid = self.next_qid % n;
        let mut total = 0;

        for _ in 0..budget {
            if let Some(ring) = rings[qid].as_mut() {
                let stalled = stall_ns.map_or(false, |d| now_ns.saturating_sub(ring.last_cleanup_ns()) > d);
                if stalled {
                    tracing::debug!(qid, "tx queue not polled, completion check skipped");
                } else {
                    match self.check(ring, now_ns) {
                        Ok(scan) => total += scan.missed,
                        Err(req) => {
                            self.next_qid = (qid + 1) % n;
                            return Err(req);
                        }
                    }
                }
            }
            qid = (qid + 1) % n;
        }
        self.next_qid = qid;
        Ok(total)
    }
}

fn scan_timers(qid: u16, timers: &mut [SlotTimer], now_ns: u64, timeout_ns: u64) -> QueueScan {
    let mut scan = QueueScan::default();
    for (req_id, t) in timers.iter_mut().enumerate() {
        if t.is_idle() {
            continue;
        }
        let delay = now_ns.saturating_sub(t.timestamp);
        if delay <= timeout_ns {
            continue;
        }
        if !t.warned {
            tracing::warn!(qid, req_id, delay_us = delay / 1_000, "tx completion missing");
            t.warned = true;
            scan.newly_warned += 1;
        }
        scan.missed += 1;
    }
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, SegmentPool};
    use crate::sim_queue::{SimCq, SimDevice};
    use vnic_core::clock::{Clock, ManualClock};
    use vnic_core::config::RingConfig;
    use vnic_core::desc::{Direction, QueueSpec};
    use vnic_core::queue::QueueFactory;

    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    const SEC: u64 = 1_000_000_000;

    struct Fixture {
        dev: SimDevice,
        clock: ManualClock,
        pool: SegmentPool,
        reset: ResetSignal,
        rings: Vec<Option<TxRing<SimCq>>>,
        hw: Vec<u16>,
    }

    fn fixture(queues: usize, size: u16) -> Fixture {
        let mut dev = SimDevice::new();
        let clock = ManualClock::new(1_000);
        let pool = SegmentPool::with_identity(&PoolConfig::new(2048, 256)).unwrap();
        let reset = ResetSignal::new();
        let mut rings = Vec::new();
        let mut hw = Vec::new();
        for qid in 0..queues {
            let id = dev
                .create_queue(QueueSpec { direction: Direction::Tx, size, numa_node: -1 })
                .unwrap();
            let (sq, cq) = dev.queue_handles(id).unwrap();
            let shared: Arc<dyn Clock> = Arc::new(clock.clone());
            let ring = TxRing::new(
                qid as u16,
                &RingConfig::default().with_size(size),
                sq,
                cq,
                pool.cache(8),
                shared,
                reset.clone(),
            )
            .unwrap();
            rings.push(Some(ring));
            hw.push(id);
        }
        Fixture { dev, clock, pool, reset, rings, hw }
    }

    fn send(f: &mut Fixture, qid: usize, n: usize) {
        let mut cache = f.pool.cache(0);
        let mut q: VecDeque<_> = (0..n).map(|_| cache.packet_from_bytes(&[0u8; 64]).unwrap()).collect();
        let ring = f.rings[qid].as_mut().unwrap();
        assert_eq!(ring.tx_burst(&mut q).unwrap(), n);
    }

    fn watchdog(reset: &ResetSignal, timeout_secs: u64) -> Watchdog {
        let cfg = WatchdogConfig {
            timeout: Some(Duration::from_secs(timeout_secs)),
            ..WatchdogConfig::default()
        };
        Watchdog::new(cfg, reset.clone())
    }

    #[test]
    fn test_warn_once_count_twice() {
        let mut f = fixture(1, 64);
        send(&mut f, 0, 1);
        let wd = watchdog(&f.reset, 1);
        let ring = f.rings[0].as_mut().unwrap();

        let first = wd.check(ring, 1_000 + SEC + 1).unwrap();
        assert_eq!(first, QueueScan { missed: 1, newly_warned: 1 });
        let second = wd.check(ring, 1_000 + SEC + 2).unwrap();
        assert_eq!(second, QueueScan { missed: 1, newly_warned: 0 });

        assert_eq!(ring.stats().snapshot().missing_tx, 2);
        assert!(f.reset.pending().is_none());
    }

    #[test]
    fn test_within_timeout_not_counted() {
        let mut f = fixture(1, 64);
        send(&mut f, 0, 3);
        let wd = watchdog(&f.reset, 1);
        let ring = f.rings[0].as_mut().unwrap();
        assert_eq!(wd.check(ring, 1_000 + SEC).unwrap().missed, 0);
    }

    #[test]
    fn test_completion_clears_timer() {
        let mut f = fixture(1, 64);
        send(&mut f, 0, 2);
        f.dev.complete_tx(f.hw[0], 2);
        let wd = watchdog(&f.reset, 1);
        let ring = f.rings[0].as_mut().unwrap();
        ring.tx_cleanup(0).unwrap();
        assert_eq!(wd.check(ring, 100 * SEC).unwrap().missed, 0);
    }

    #[test]
    fn test_threshold_exceeded_requests_reset() {
        let mut f = fixture(1, 64);
        send(&mut f, 0, 5);
        let ring = f.rings[0].as_mut().unwrap();
        ring.set_missing_threshold(4);
        let wd = watchdog(&f.reset, 1);
        let err = wd.check(ring, 10 * SEC).unwrap_err();
        assert_eq!(err.reason(), ResetReason::MissingTxCompletion);
        assert_eq!(f.reset.pending(), Some(ResetReason::MissingTxCompletion));
    }

    #[test]
    fn test_default_threshold_from_ring_size() {
        let f = fixture(1, 64);
        assert_eq!(f.rings[0].as_ref().unwrap().missing_threshold(), 32);
    }

    #[test]
    fn test_disabled_timeout() {
        let mut f = fixture(1, 64);
        send(&mut f, 0, 5);
        let cfg = WatchdogConfig { timeout: None, ..WatchdogConfig::default() };
        let mut wd = Watchdog::new(cfg, f.reset.clone());
        assert_eq!(wd.tick(&mut f.rings, u64::MAX / 2).unwrap(), 0);
        assert_eq!(f.rings[0].as_ref().unwrap().stats().snapshot().missing_tx, 0);
    }

    #[test]
    fn test_tick_round_robin_budget() {
        let mut f = fixture(5, 64);
        for qid in 0..5 {
            send(&mut f, qid, 1);
        }
        let mut wd = watchdog(&f.reset, 1);
        let now = 10 * SEC;

        // Budget 3: queues 0..3, then 3, 4, 0.
        assert_eq!(wd.tick(&mut f.rings, now).unwrap(), 3);
        assert_eq!(wd.next_qid(), 3);
        assert_eq!(wd.tick(&mut f.rings, now).unwrap(), 3);
        assert_eq!(wd.next_qid(), 1);

        let counts: Vec<u64> = f
            .rings
            .iter()
            .map(|r| r.as_ref().unwrap().stats().snapshot().missing_tx)
            .collect();
        assert_eq!(counts, vec![2, 1, 1, 1, 1]);
    }

    #[test]
    fn test_tick_skips_unstarted_queues() {
        let mut f = fixture(2, 64);
        send(&mut f, 1, 1);
        f.rings[0] = None;
        let mut wd = watchdog(&f.reset, 1);
        assert_eq!(wd.tick(&mut f.rings, 10 * SEC).unwrap(), 1);
    }

    #[test]
    fn test_pending_reset_short_circuits() {
        let mut f = fixture(1, 64);
        send(&mut f, 0, 1);
        f.reset.trigger(ResetReason::InvalidTxReqId);
        let mut wd = watchdog(&f.reset, 1);
        assert_eq!(wd.tick(&mut f.rings, 10 * SEC).unwrap(), 0);
        assert_eq!(f.rings[0].as_ref().unwrap().stats().snapshot().missing_tx, 0);
    }

    #[test]
    fn test_stalled_queue_skipped() {
        let mut f = fixture(1, 64);
        send(&mut f, 0, 1);
        let cfg = WatchdogConfig {
            timeout: Some(Duration::from_secs(1)),
            stall_delay: Some(Duration::from_secs(2)),
            ..WatchdogConfig::default()
        };
        let mut wd = Watchdog::new(cfg, f.reset.clone());

        // Last cleanup at construction (t=1000ns): 10s ago, queue is stalled.
        assert_eq!(wd.tick(&mut f.rings, 10 * SEC).unwrap(), 0);

        // A cleanup pass (nothing completed) marks the queue as polled.
        f.clock.set(10 * SEC);
        f.rings[0].as_mut().unwrap().tx_cleanup(0).unwrap();
        assert_eq!(wd.tick(&mut f.rings, 10 * SEC + 1).unwrap(), 1);
    }
}
