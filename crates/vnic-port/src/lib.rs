//! # vnic-port: Port surface
//!
//! A `Port` owns one device (`QueueFactory`) and a table of receive and
//! transmit queues addressed by queue index. Each queue goes through
//!
//! ```text
//!   configure_*_ring ──▶ start_ring ──▶ rx_burst / tx_burst ──▶ stop_ring
//!   (size, pool)         (device queue,   (datapath)            (quiesce, drain,
//!                         ring, populate)                        force free)
//! ```
//!
//! The port also owns the reset latch all its rings share and drives the
//! completion watchdog over its transmit rings.
//!
//! Ports live in a `PortRegistry` the application constructs; there is no
//! process-wide port table.

use vnic_core::clock::{Clock, MonotonicClock};
use vnic_core::config::{PortConfig, MAX_PORTS, MIN_RING_DESC, RX_BUF_MIN_SIZE};
use vnic_core::desc::{Direction, QueueId, QueueSpec};
use vnic_core::error::{Result, VnicError};
use vnic_core::queue::QueueFactory;
use vnic_core::reset::{ResetReason, ResetSignal};
use vnic_core::stats::QueueStatsSnapshot;
use vnic_module::pool::DEFAULT_CACHE_CAPACITY;
use vnic_module::{Packet, RxRing, SegmentPool, TxRing, Watchdog};

use std::collections::VecDeque;
use std::sync::Arc;

/// Per-queue settings recorded by `configure_*_ring`.
struct QueueConf {
    size: u16,
    numa_node: i32,
    pool: SegmentPool,
    /// Device queue while started.
    hw_id: Option<QueueId>,
}

pub struct Port<F: QueueFactory> {
    port_id: u16,
    factory: F,
    cfg: PortConfig,
    clock: Arc<dyn Clock>,
    reset: ResetSignal,
    rx_confs: Vec<Option<QueueConf>>,
    tx_confs: Vec<Option<QueueConf>>,
    rx_rings: Vec<Option<RxRing<F::Cq>>>,
    tx_rings: Vec<Option<TxRing<F::Cq>>>,
    watchdog: Watchdog,
}

impl<F: QueueFactory> Port<F> {
    pub fn new(port_id: u16, factory: F, cfg: PortConfig) -> Result<Self> {
        Self::with_clock(port_id, factory, cfg, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(port_id: u16, factory: F, cfg: PortConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        cfg.validate()?;
        let n = cfg.num_queues as usize;
        let reset = ResetSignal::new();
        let watchdog = Watchdog::new(cfg.watchdog.clone(), reset.clone());
        tracing::info!(port_id, queues = n, max_ring_size = cfg.max_ring_size, "port created");
        Ok(Self {
            port_id,
            factory,
            cfg,
            clock,
            reset,
            rx_confs: (0..n).map(|_| None).collect(),
            tx_confs: (0..n).map(|_| None).collect(),
            rx_rings: (0..n).map(|_| None).collect(),
            tx_rings: (0..n).map(|_| None).collect(),
            watchdog,
        })
    }

    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    pub fn config(&self) -> &PortConfig {
        &self.cfg
    }

    pub fn num_queues(&self) -> u16 {
        self.cfg.num_queues
    }

    pub fn configure_rx_ring(&mut self, qid: u16, size: u16, numa_node: i32, pool: &SegmentPool) -> Result<()> {
        if pool.segment_size() < RX_BUF_MIN_SIZE {
            return Err(VnicError::BufferTooSmall { size: pool.segment_size(), min: RX_BUF_MIN_SIZE });
        }
        self.configure(Direction::Rx, qid, size, numa_node, pool)
    }

    pub fn configure_tx_ring(&mut self, qid: u16, size: u16, numa_node: i32, pool: &SegmentPool) -> Result<()> {
        self.configure(Direction::Tx, qid, size, numa_node, pool)
    }

    fn configure(&mut self, dir: Direction, qid: u16, size: u16, numa_node: i32, pool: &SegmentPool) -> Result<()> {
        let max = self.cfg.max_ring_size;
        if !size.is_power_of_two() || size < MIN_RING_DESC || size > max {
            return Err(VnicError::InvalidRingSize {
                size: size as usize,
                min: MIN_RING_DESC as usize,
                max: max as usize,
            });
        }
        let slot = self.conf_slot(dir, qid)?;
        if slot.is_some() {
            return Err(VnicError::AlreadyConfigured(qid));
        }
        *slot = Some(QueueConf { size, numa_node, pool: pool.clone(), hw_id: None });
        tracing::debug!(port_id = self.port_id, %dir, qid, size, numa_node, "queue configured");
        Ok(())
    }

    /// Create the device queue and the ring. Receive rings are filled
    /// with `size - 1` buffers; if that fails the device queue is torn
    /// down again.
    pub fn start_ring(&mut self, dir: Direction, qid: u16) -> Result<()> {
        let port_id = self.port_id;
        let (size, numa_node, pool) = {
            let conf = self.conf_slot(dir, qid)?.as_ref().ok_or(VnicError::NotConfigured(qid))?;
            if conf.hw_id.is_some() {
                return Err(VnicError::AlreadyStarted(qid));
            }
            (conf.size, conf.numa_node, conf.pool.clone())
        };
        let mut ring_cfg = self.cfg.ring.clone().with_size(size);
        ring_cfg.numa_node = numa_node;
        let spec = QueueSpec { direction: dir, size, numa_node };

        let hw_id = self.factory.create_queue(spec)?;
        let handles = self.factory.queue_handles(hw_id);
        let (sq, cq) = match handles {
            Ok(h) => h,
            Err(e) => {
                self.destroy_hw(dir, qid, hw_id);
                return Err(e.into());
            }
        };
        let cache = pool.cache((size as usize).min(DEFAULT_CACHE_CAPACITY));

        match dir {
            Direction::Rx => {
                let built = RxRing::new(qid, &ring_cfg, sq, cq, cache, self.reset.clone())
                    .and_then(|mut ring| ring.populate().map(|_| ring));
                match built {
                    Ok(ring) => self.rx_rings[qid as usize] = Some(ring),
                    Err(e) => {
                        self.destroy_hw(dir, qid, hw_id);
                        return Err(e);
                    }
                }
            }
            Direction::Tx => {
                let built = TxRing::new(qid, &ring_cfg, sq, cq, cache, self.clock.clone(), self.reset.clone());
                match built {
                    Ok(mut ring) => {
                        ring.set_missing_threshold(self.cfg.watchdog.threshold_for(size));
                        self.tx_rings[qid as usize] = Some(ring);
                    }
                    Err(e) => {
                        self.destroy_hw(dir, qid, hw_id);
                        return Err(e);
                    }
                }
            }
        }

        if let Some(conf) = self.conf_slot(dir, qid)?.as_mut() {
            conf.hw_id = Some(hw_id);
        }
        tracing::info!(port_id, %dir, qid, hw_id, size, "queue started");
        Ok(())
    }

    /// Quiesce the device queue, reclaim what completed, free the rest.
    pub fn stop_ring(&mut self, dir: Direction, qid: u16) -> Result<()> {
        let port_id = self.port_id;
        let hw_id = self
            .conf_slot(dir, qid)?
            .as_mut()
            .and_then(|c| c.hw_id.take())
            .ok_or(VnicError::NotStarted(qid))?;
        self.destroy_hw(dir, qid, hw_id);

        let freed = match dir {
            Direction::Rx => self.rx_rings[qid as usize].take().map_or(0, |mut ring| ring.release()),
            Direction::Tx => match self.tx_rings[qid as usize].take() {
                Some(mut ring) => {
                    if let Err(req) = ring.tx_cleanup(0) {
                        tracing::warn!(port_id, qid, reason = %req.reason(), "tx drain on stop failed");
                    }
                    ring.release()
                }
                None => 0,
            },
        };
        tracing::info!(port_id, %dir, qid, freed, "queue stopped");
        Ok(())
    }

    pub fn is_started(&self, dir: Direction, qid: u16) -> bool {
        match dir {
            Direction::Rx => self.rx_rings.get(qid as usize).is_some_and(Option::is_some),
            Direction::Tx => self.tx_rings.get(qid as usize).is_some_and(Option::is_some),
        }
    }

    /// Device queue backing `qid`, while started.
    pub fn hw_queue(&self, dir: Direction, qid: u16) -> Option<QueueId> {
        let confs = match dir {
            Direction::Rx => &self.rx_confs,
            Direction::Tx => &self.tx_confs,
        };
        confs.get(qid as usize)?.as_ref()?.hw_id
    }

    /// Transmit from the front of `pkts`. See `TxRing::tx_burst`.
    pub fn tx_burst(&mut self, qid: u16, pkts: &mut VecDeque<Packet>) -> Result<usize> {
        let ring = self.tx_ring(qid)?;
        Ok(ring.tx_burst(pkts)?)
    }

    /// Reclaim completed transmissions on `qid` (`budget` 0 = all).
    pub fn tx_cleanup(&mut self, qid: u16, budget: u16) -> Result<usize> {
        let ring = self.tx_ring(qid)?;
        Ok(ring.tx_cleanup(budget)?)
    }

    /// Receive up to `max` packets into `out`.
    pub fn rx_burst(&mut self, qid: u16, out: &mut Vec<Packet>, max: usize) -> Result<usize> {
        let ring = self
            .rx_rings
            .get_mut(qid as usize)
            .ok_or(VnicError::InvalidQueue(qid))?
            .as_mut()
            .ok_or(VnicError::NotStarted(qid))?;
        Ok(ring.recv_burst(out, max)?)
    }

    /// Counters of a started queue.
    pub fn stats(&self, dir: Direction, qid: u16) -> Option<QueueStatsSnapshot> {
        match dir {
            Direction::Rx => self.rx_rings.get(qid as usize)?.as_ref().map(|r| r.stats().snapshot()),
            Direction::Tx => self.tx_rings.get(qid as usize)?.as_ref().map(|r| r.stats().snapshot()),
        }
    }

    /// One watchdog pass over the transmit rings. Call periodically.
    pub fn watchdog_tick(&mut self) -> Result<u32> {
        let now = self.clock.now_ns();
        Ok(self.watchdog.tick(&mut self.tx_rings, now)?)
    }

    /// First reset reason raised on this port, if any.
    pub fn reset_reason(&self) -> Option<ResetReason> {
        self.reset.pending()
    }

    /// Clear the reset latch after the application has restarted the
    /// affected queues. Returns the reason that was latched.
    pub fn acknowledge_reset(&self) -> Option<ResetReason> {
        self.reset.clear()
    }

    /// Stop every started queue.
    pub fn stop_all(&mut self) {
        for qid in 0..self.cfg.num_queues {
            for dir in [Direction::Tx, Direction::Rx] {
                if self.is_started(dir, qid) {
                    if let Err(e) = self.stop_ring(dir, qid) {
                        tracing::warn!(port_id = self.port_id, %dir, qid, error = %e, "stop failed");
                    }
                }
            }
        }
    }

    fn tx_ring(&mut self, qid: u16) -> Result<&mut TxRing<F::Cq>> {
        self.tx_rings
            .get_mut(qid as usize)
            .ok_or(VnicError::InvalidQueue(qid))?
            .as_mut()
            .ok_or(VnicError::NotStarted(qid))
    }

    fn conf_slot(&mut self, dir: Direction, qid: u16) -> Result<&mut Option<QueueConf>> {
        let confs = match dir {
            Direction::Rx => &mut self.rx_confs,
            Direction::Tx => &mut self.tx_confs,
        };
        confs.get_mut(qid as usize).ok_or(VnicError::InvalidQueue(qid))
    }

    fn destroy_hw(&mut self, dir: Direction, qid: u16, hw_id: QueueId) {
        if let Err(e) = self.factory.destroy_queue(hw_id) {
            tracing::warn!(port_id = self.port_id, %dir, qid, hw_id, error = %e, "device queue destroy failed");
        }
    }
}

impl<F: QueueFactory> Drop for Port<F> {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Explicit table of ports, at most `MAX_PORTS` by default.
pub struct PortRegistry<F: QueueFactory> {
    ports: Vec<Port<F>>,
    capacity: usize,
}

impl<F: QueueFactory> Default for PortRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: QueueFactory> PortRegistry<F> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PORTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { ports: Vec::with_capacity(capacity), capacity }
    }

    pub fn register(&mut self, port: Port<F>) -> Result<u16> {
        let id = port.port_id();
        if self.ports.iter().any(|p| p.port_id() == id) {
            return Err(VnicError::PortExists(id));
        }
        if self.ports.len() >= self.capacity {
            return Err(VnicError::RegistryFull(self.capacity));
        }
        self.ports.push(port);
        tracing::debug!(port_id = id, ports = self.ports.len(), "port registered");
        Ok(id)
    }

    pub fn get(&self, port_id: u16) -> Option<&Port<F>> {
        self.ports.iter().find(|p| p.port_id() == port_id)
    }

    pub fn get_mut(&mut self, port_id: u16) -> Option<&mut Port<F>> {
        self.ports.iter_mut().find(|p| p.port_id() == port_id)
    }

    /// Remove and return the port. Dropping it stops its queues.
    pub fn unregister(&mut self, port_id: u16) -> Option<Port<F>> {
        let pos = self.ports.iter().position(|p| p.port_id() == port_id)?;
        Some(self.ports.swap_remove(pos))
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn port_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().map(|p| p.port_id())
    }

    /// Watchdog pass over every port. Returns the first reset request.
    pub fn watchdog_tick_all(&mut self) -> Result<u32> {
        let mut total = 0;
        for port in self.ports.iter_mut() {
            total += port.watchdog_tick()?;
        }
        Ok(total)
    }
}
