//! `TxRing`: transmit ring engine.
//!
//! Accepts outbound packets, maps their segment chains to device buffers,
//! fills the offload context, submits, and reclaims completed requests.
//!
//! ## Placement
//!
//! | Policy   | Inline header                      | DMA buffers             |
//! |----------|------------------------------------|-------------------------|
//! | `Host`   | none                               | every segment           |
//! | `Device` | first `min(pkt_len, max_header)`   | the unpushed remainder  |
//!
//! In push mode a header longer than the first segment is copied into a
//! per-ring bounce buffer so it is contiguous, and the bytes it covers in
//! later segments (`delta`) are skipped before DMA buffers resume.
//!
//! ## Doorbells
//!
//! Submissions accumulate without a doorbell until the device asks for
//! one (`doorbell_needed`, push-mode burst limit) or the burst ends; then
//! one doorbell plus one completion-head update covers the batch.

use crate::packet::Packet;
use crate::pool::{PoolCache, SegmentPool};
use crate::ring::RingState;
use crate::watchdog::SlotTimer;

use vnic_core::clock::Clock;
use vnic_core::config::{PlacementPolicy, RingConfig, WatchdogConfig, CLEANUP_BUF_THRESH};
use vnic_core::desc::{DmaBuf, L3Proto, L4Proto, TxContext, TxMeta};
use vnic_core::error::{PoolError, Result};
use vnic_core::offload::{OffloadFlags, PacketType, QueueOffloads};
use vnic_core::queue::{CompletionQueue, SubmissionQueue};
use vnic_core::reset::{ResetReason, ResetRequest, ResetSignal};
use vnic_core::stats::QueueStats;

use std::collections::VecDeque;
use std::sync::Arc;

/// Extra descriptors a packet may need beyond its segments: one for a
/// header split and one for metadata.
const TX_EXTRA_DESCS: u16 = 2;

#[derive(Default)]
struct TxSlot {
    pkt: Option<Packet>,
    tx_descs: u16,
}

enum Xmit {
    Sent,
    Dropped,
    Busy(Packet),
    Foreign(Packet, PoolError),
    Reset(Packet, ResetRequest),
}

enum PushHeader {
    None,
    /// First `n` bytes of the head segment.
    Inline(usize),
    /// First `n` bytes of the bounce buffer.
    Copied(usize),
}

/// Offload fields of a `TxContext`.
#[derive(Debug, Default, Clone, Copy)]
struct TxOffload {
    meta: TxMeta,
    meta_valid: bool,
    l3_proto: L3Proto,
    l4_proto: L4Proto,
    l3_csum_enable: bool,
    l4_csum_enable: bool,
    df: bool,
}

pub struct TxRing<Q: CompletionQueue> {
    qid: u16,
    ring: RingState,
    slots: Box<[TxSlot]>,
    timers: Box<[SlotTimer]>,
    sq: Q::Sq,
    cq: Q,
    pool: SegmentPool,
    cache: PoolCache,
    placement: PlacementPolicy,
    offloads: QueueOffloads,
    disable_meta_caching: bool,
    fast_free: bool,
    max_sgl: u16,
    free_thresh: u16,
    missing_threshold: u32,
    bufs: Vec<DmaBuf>,
    push_buf: Box<[u8]>,
    free_batch: Vec<Packet>,
    batch_segs: usize,
    pending_doorbell: bool,
    last_cleanup_ns: u64,
    clock: Arc<dyn Clock>,
    stats: QueueStats,
    reset: ResetSignal,
}

impl<Q: CompletionQueue> TxRing<Q> {
    pub fn new(
        qid: u16,
        cfg: &RingConfig,
        sq: Q::Sq,
        cq: Q,
        cache: PoolCache,
        clock: Arc<dyn Clock>,
        reset: ResetSignal,
    ) -> Result<Self> {
        cfg.validate()?;
        let size = cfg.size as usize;
        let now = clock.now_ns();
        Ok(Self {
            qid,
            ring: RingState::new(cfg.size),
            slots: (0..size).map(|_| TxSlot::default()).collect(),
            timers: vec![SlotTimer::IDLE; size].into_boxed_slice(),
            sq,
            cq,
            pool: cache.pool().clone(),
            cache,
            placement: cfg.placement,
            offloads: cfg.offloads,
            disable_meta_caching: cfg.disable_meta_caching,
            fast_free: cfg.fast_free,
            max_sgl: cfg.max_sgl,
            free_thresh: cfg.tx_free_thresh(),
            missing_threshold: WatchdogConfig::default().threshold_for(cfg.size),
            bufs: Vec::with_capacity(cfg.max_sgl as usize + 1),
            push_buf: vec![0u8; cfg.placement.push_header_size()].into_boxed_slice(),
            free_batch: Vec::with_capacity(if cfg.fast_free { CLEANUP_BUF_THRESH } else { 0 }),
            batch_segs: 0,
            pending_doorbell: false,
            last_cleanup_ns: now,
            clock,
            stats: QueueStats::new(),
            reset,
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn size(&self) -> u16 {
        self.ring.size()
    }

    /// Packets submitted and not yet reclaimed.
    pub fn in_use(&self) -> u16 {
        self.ring.in_use()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Stale slots per watchdog scan tolerated before a reset.
    pub fn missing_threshold(&self) -> u32 {
        self.missing_threshold
    }

    pub fn set_missing_threshold(&mut self, threshold: u32) {
        self.missing_threshold = threshold;
    }

    /// Clock reading at the end of the last `tx_cleanup`.
    pub fn last_cleanup_ns(&self) -> u64 {
        self.last_cleanup_ns
    }

    pub(crate) fn timers_mut(&mut self) -> &mut [SlotTimer] {
        &mut self.timers
    }

    /// Submit packets from the front of `pkts`.
    ///
    /// Returns how many packets were taken off the queue: submitted, or
    /// dropped for exceeding the scatter-gather limit (`tx_dropped`). The
    /// burst stops at the first packet the ring has no room for; that
    /// packet and everything behind it stay in `pkts`.
    ///
    /// A packet built on another pool stops the burst with
    /// `PoolError::ForeignSegment` and stays at the front of `pkts`;
    /// packets sent before it are already submitted.
    pub fn tx_burst(&mut self, pkts: &mut VecDeque<Packet>) -> Result<usize> {
        if self.sq.free_entries() < self.free_thresh {
            self.tx_cleanup(0)?;
        }

        let mut taken = 0;
        while let Some(pkt) = pkts.pop_front() {
            match self.xmit(pkt) {
                Xmit::Sent | Xmit::Dropped => taken += 1,
                Xmit::Busy(pkt) => {
                    pkts.push_front(pkt);
                    break;
                }
                Xmit::Foreign(pkt, e) => {
                    pkts.push_front(pkt);
                    self.ring_doorbell();
                    return Err(e.into());
                }
                Xmit::Reset(pkt, req) => {
                    pkts.push_front(pkt);
                    self.ring_doorbell();
                    return Err(req.into());
                }
            }
        }
        self.ring_doorbell();
        Ok(taken)
    }

    /// Reclaim up to `budget` completed packets (0 = `size - 1`).
    ///
    /// One `comp_ack` and one completion-head update per call.
    pub fn tx_cleanup(&mut self, budget: u16) -> std::result::Result<usize, ResetRequest> {
        let limit = match budget {
            0 => self.ring.size() - 1,
            n => n,
        } as usize;
        let mut cleaned = 0;
        let mut total_descs: u32 = 0;
        let mut outcome = Ok(());

        while cleaned < limit {
            let req_id = match self.cq.next_tx_req_id() {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(e) => {
                    self.stats.add_bad_req_id(1);
                    tracing::error!(qid = self.qid, error = %e, "tx completion error");
                    outcome = Err(self.reset.trigger(ResetReason::InvalidTxReqId));
                    break;
                }
            };
            let pkt = if self.ring.is_valid_id(req_id) {
                self.slots[req_id as usize].pkt.take()
            } else {
                None
            };
            let pkt = match pkt {
                Some(pkt) => pkt,
                None => {
                    self.stats.add_bad_req_id(1);
                    tracing::error!(qid = self.qid, req_id, "invalid tx request id");
                    outcome = Err(self.reset.trigger(ResetReason::InvalidTxReqId));
                    break;
                }
            };

            let slot = &mut self.slots[req_id as usize];
            total_descs += slot.tx_descs as u32;
            slot.tx_descs = 0;
            self.timers[req_id as usize] = SlotTimer::IDLE;

            if self.fast_free {
                self.batch_segs += pkt.nb_segs() as usize;
                self.free_batch.push(pkt);
                if self.batch_segs >= CLEANUP_BUF_THRESH {
                    self.flush_free_batch();
                }
            } else {
                self.cache.recycle_packet(pkt);
            }
            self.ring.recycle_id(req_id);
            cleaned += 1;
        }
        self.flush_free_batch();

        if cleaned > 0 {
            self.sq.comp_ack(total_descs.min(u16::MAX as u32) as u16);
            self.cq.update_head();
        }
        self.last_cleanup_ns = self.clock.now_ns();
        outcome.map(|()| cleaned)
    }

    /// Free every in-flight packet without waiting for completions.
    /// Called on queue stop after the device queue is destroyed, and on drop.
    pub fn release(&mut self) -> usize {
        let mut freed = 0;
        for (slot, timer) in self.slots.iter_mut().zip(self.timers.iter_mut()) {
            if let Some(pkt) = slot.pkt.take() {
                self.cache.recycle_packet(pkt);
                freed += 1;
            }
            *timer = SlotTimer::IDLE;
        }
        self.flush_free_batch();
        self.cache.flush();
        if freed > 0 {
            tracing::debug!(qid = self.qid, freed, "tx ring released in-flight packets");
        }
        freed
    }

    fn xmit(&mut self, pkt: Packet) -> Xmit {
        if pkt.pool_id() != self.pool.id() {
            tracing::warn!(qid = self.qid, pool = pkt.pool_id(), "tx packet from a foreign pool");
            let e = PoolError::ForeignSegment { expected: self.pool.id(), found: pkt.pool_id() };
            return Xmit::Foreign(pkt, e);
        }

        let nb_segs = pkt.nb_segs();
        if nb_segs > self.max_sgl {
            tracing::warn!(qid = self.qid, nb_segs, max_sgl = self.max_sgl, "tx packet over scatter-gather limit, dropped");
            self.cache.recycle_packet(pkt);
            self.stats.add_tx_dropped(1);
            return Xmit::Dropped;
        }

        let need = nb_segs + TX_EXTRA_DESCS;
        if !self.sq.have_space(need) || self.ring.free() == 0 {
            if let Err(req) = self.tx_cleanup(0) {
                return Xmit::Reset(pkt, req);
            }
            if !self.sq.have_space(need) || self.ring.free() == 0 {
                self.stats.add_tx_busy(1);
                return Xmit::Busy(pkt);
            }
        }
        let req_id = match self.ring.peek_free_id() {
            Some(id) => id,
            None => return Xmit::Busy(pkt),
        };

        self.bufs.clear();
        let push = map_segments(&self.pool, &pkt, self.placement, &mut self.push_buf, &mut self.bufs);
        let push_header: &[u8] = match push {
            PushHeader::None => &[],
            PushHeader::Inline(n) => &self.pool.data(pkt.head())[..n],
            PushHeader::Copied(n) => &self.push_buf[..n],
        };
        let off = offload_context(&pkt, self.offloads, self.disable_meta_caching);
        let ctx = TxContext {
            req_id,
            bufs: &self.bufs,
            push_header,
            meta: off.meta,
            meta_valid: off.meta_valid,
            l3_proto: off.l3_proto,
            l4_proto: off.l4_proto,
            l3_csum_enable: off.l3_csum_enable,
            l4_csum_enable: off.l4_csum_enable,
            df: off.df,
        };

        if self.sq.doorbell_needed(&ctx) {
            self.sq.write_doorbell();
            self.stats.add_doorbells(1);
            self.pending_doorbell = false;
        }

        let tx_descs = match self.sq.prepare_tx(&ctx) {
            Ok(n) => n,
            Err(e) => {
                self.stats.add_prepare_ctx_err(1);
                tracing::error!(qid = self.qid, req_id, error = %e, "tx prepare failed after admission");
                let req = self.reset.trigger(ResetReason::DriverInvalidState);
                return Xmit::Reset(pkt, req);
            }
        };

        let pkt_len = pkt.pkt_len() as u64;
        let slot = &mut self.slots[req_id as usize];
        debug_assert!(slot.pkt.is_none(), "tx slot {} busy", req_id);
        slot.pkt = Some(pkt);
        slot.tx_descs = tx_descs;
        self.timers[req_id as usize] = SlotTimer { timestamp: self.clock.now_ns(), warned: false };
        self.ring.commit_use();
        self.pending_doorbell = true;
        self.stats.record_packet(pkt_len);
        Xmit::Sent
    }

    fn ring_doorbell(&mut self) {
        if self.pending_doorbell {
            self.sq.write_doorbell();
            self.stats.add_doorbells(1);
            self.cq.update_head();
            self.pending_doorbell = false;
        }
    }

    fn flush_free_batch(&mut self) {
        if !self.free_batch.is_empty() {
            for pkt in self.free_batch.drain(..) {
                self.cache.recycle_packet(pkt);
            }
            self.batch_segs = 0;
        }
    }
}

impl<Q: CompletionQueue> Drop for TxRing<Q> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Fill `bufs` with the DMA part of `pkt`; copy or borrow the push header.
fn map_segments(
    pool: &SegmentPool,
    pkt: &Packet,
    placement: PlacementPolicy,
    push_buf: &mut [u8],
    bufs: &mut Vec<DmaBuf>,
) -> PushHeader {
    let max_header = placement.push_header_size();
    if max_header == 0 {
        bufs.extend(pkt.segments(pool).map(|s| DmaBuf { addr: s.iova, len: s.data.len() as u32 }));
        return PushHeader::None;
    }

    let push_len = (pkt.pkt_len() as usize).min(max_header);
    let mut segs = pkt.segments(pool);
    let first = match segs.next() {
        Some(s) => s,
        None => return PushHeader::None,
    };
    let first_len = first.data.len();

    let (header, mut delta) = if push_len > first_len {
        pkt.copy_prefix(pool, &mut push_buf[..push_len]);
        (PushHeader::Copied(push_len), push_len - first_len)
    } else {
        (PushHeader::Inline(push_len), 0)
    };

    if first_len > push_len {
        bufs.push(DmaBuf {
            addr: first.iova + push_len as u64,
            len: (first_len - push_len) as u32,
        });
    }
    for seg in segs {
        let len = seg.data.len();
        if delta >= len {
            delta -= len;
            continue;
        }
        bufs.push(DmaBuf { addr: seg.iova + delta as u64, len: (len - delta) as u32 });
        delta = 0;
    }
    header
}

fn offload_context(pkt: &Packet, offloads: QueueOffloads, disable_meta_caching: bool) -> TxOffload {
    let mut off = TxOffload::default();
    let ol = pkt.ol_flags;

    if ol.intersects(OffloadFlags::TX_OFFLOAD_MASK) && offloads.intersects(QueueOffloads::TX_CKSUM_MASK) {
        if ol.contains(OffloadFlags::TX_IPV4) {
            off.l3_proto = L3Proto::Ipv4;
            off.l3_csum_enable =
                ol.contains(OffloadFlags::TX_IP_CKSUM) && offloads.contains(QueueOffloads::TX_IPV4_CKSUM);
            off.df = pkt.packet_type.contains(PacketType::L4_NONFRAG);
        } else if ol.contains(OffloadFlags::TX_IPV6) {
            off.l3_proto = L3Proto::Ipv6;
            off.df = true;
        }

        if ol.contains(OffloadFlags::TX_UDP_CKSUM) && offloads.contains(QueueOffloads::TX_UDP_CKSUM) {
            off.l4_proto = L4Proto::Udp;
            off.l4_csum_enable = true;
        } else if ol.contains(OffloadFlags::TX_TCP_CKSUM) && offloads.contains(QueueOffloads::TX_TCP_CKSUM) {
            off.l4_proto = L4Proto::Tcp;
            off.l4_csum_enable = true;
        }

        off.meta = TxMeta {
            mss: 0,
            l3_hdr_len: pkt.l3_len,
            l3_hdr_offset: pkt.l2_len,
            l4_hdr_len: pkt.l4_len,
        };
        off.meta_valid = true;
    } else if disable_meta_caching {
        off.meta_valid = true;
    }
    off
}
