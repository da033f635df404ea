//! `RxRing`: receive ring engine.
//!
//! Posts free segments as receive descriptors, harvests completed
//! descriptors into packets, translates hardware metadata into offload
//! flags, and refills once enough descriptors have been consumed.
//!
//! ```text
//!   PoolCache ──alloc_bulk──▶ refill ──add_rx_desc──▶ device
//!                                                       │ DMA
//!   caller ◀──recv_burst── assemble ◀──rx_packet────────┘
//! ```
//!
//! Every descriptor the device reports for an in-flight id is consumed
//! exactly once: its id is recycled and `next_to_clean` advances, whether
//! the packet it belongs to is delivered or dropped. A zero-length
//! descriptor after the first drops the packet whole and ends the burst.
//! An id with no posted buffer is not in flight; it is never recycled and
//! requests a reset.

use crate::packet::Packet;
use crate::pool::{PoolCache, Segment, SegmentPool};
use crate::ring::RingState;

use vnic_core::config::{RingConfig, PKT_MAX_BUFS};
use vnic_core::desc::{DmaBuf, L3Proto, L4Proto, RxBufInfo, RxContext};
use vnic_core::error::{HwError, Result, VnicError};
use vnic_core::offload::{OffloadFlags, PacketType, QueueOffloads};
use vnic_core::queue::{CompletionQueue, SubmissionQueue};
use vnic_core::reset::{ResetReason, ResetRequest, ResetSignal};
use vnic_core::stats::QueueStats;

#[derive(Default)]
struct RxSlot {
    seg: Option<Segment>,
    buf: DmaBuf,
}

pub struct RxRing<Q: CompletionQueue> {
    qid: u16,
    ring: RingState,
    slots: Box<[RxSlot]>,
    sq: Q::Sq,
    cq: Q,
    pool: SegmentPool,
    cache: PoolCache,
    /// Refill staging, reused across calls.
    scratch: Vec<Segment>,
    buf_info: [RxBufInfo; PKT_MAX_BUFS],
    free_thresh: u16,
    offloads: QueueOffloads,
    stats: QueueStats,
    reset: ResetSignal,
}

impl<Q: CompletionQueue> RxRing<Q> {
    pub fn new(
        qid: u16,
        cfg: &RingConfig,
        sq: Q::Sq,
        cq: Q,
        cache: PoolCache,
        reset: ResetSignal,
    ) -> Result<Self> {
        cfg.validate()?;
        let size = cfg.size as usize;
        Ok(Self {
            qid,
            ring: RingState::new(cfg.size),
            slots: (0..size).map(|_| RxSlot::default()).collect(),
            sq,
            cq,
            pool: cache.pool().clone(),
            cache,
            scratch: Vec::with_capacity(size),
            buf_info: [RxBufInfo::default(); PKT_MAX_BUFS],
            free_thresh: cfg.rx_free_thresh(),
            offloads: cfg.offloads,
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

    /// Descriptors posted and not yet harvested.
    pub fn in_use(&self) -> u16 {
        self.ring.in_use()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Fill the ring at queue start: `size - 1` buffers or an error.
    pub fn populate(&mut self) -> Result<usize> {
        let wanted = self.ring.free() as usize;
        let posted = self.refill(wanted as u16);
        if posted < wanted {
            return Err(VnicError::PopulateFailed { qid: self.qid, posted, wanted });
        }
        tracing::debug!(qid = self.qid, posted, "rx ring populated");
        Ok(posted)
    }

    /// Post up to `count` fresh buffers. Returns how many were posted.
    ///
    /// Allocation is all-or-nothing; an allocation failure posts nothing
    /// and is counted. A post failure stops the loop, returns the unposted
    /// segments to the pool and counts a partial refill.
    pub fn refill(&mut self, count: u16) -> usize {
        let count = count.min(self.ring.free()) as usize;
        if count == 0 {
            return 0;
        }

        let mut segs = std::mem::take(&mut self.scratch);
        segs.clear();
        if let Err(e) = self.cache.alloc_bulk(&mut segs, count) {
            self.stats.add_mbuf_alloc_fail(1);
            tracing::debug!(qid = self.qid, count, error = %e, "rx refill: no buffers");
            self.scratch = segs;
            return 0;
        }

        let seg_len = self.pool.segment_size() as u32;
        let mut posted = 0;
        let mut iter = segs.drain(..);
        let mut partial = false;
        while let Some(seg) = iter.next() {
            let req_id = match self.ring.peek_free_id() {
                Some(id) => id,
                None => {
                    self.cache.recycle(seg);
                    partial = true;
                    break;
                }
            };
            let buf = DmaBuf { addr: self.pool.iova(&seg), len: seg_len };
            if let Err(e) = self.sq.add_rx_desc(buf, req_id) {
                tracing::warn!(qid = self.qid, req_id, error = %e, "rx refill: post failed");
                self.cache.recycle(seg);
                partial = true;
                break;
            }
            let slot = &mut self.slots[req_id as usize];
            debug_assert!(slot.seg.is_none(), "rx slot {} already posted", req_id);
            slot.seg = Some(seg);
            slot.buf = buf;
            self.ring.commit_use();
            posted += 1;
        }
        if partial {
            for seg in iter.by_ref() {
                self.cache.recycle(seg);
            }
            self.stats.add_refill_partial(1);
            tracing::warn!(qid = self.qid, posted, count, "rx refill partial");
        }
        drop(iter);
        self.scratch = segs;

        if posted > 0 {
            self.sq.write_doorbell();
            self.stats.add_doorbells(1);
        }
        posted
    }

    /// Harvest up to `budget` packets into `out`. Returns packets added.
    ///
    /// Hardware errors and ring-corruption evidence latch a reset and
    /// return `Err`; packets harvested before that stay in `out`.
    pub fn recv_burst(&mut self, out: &mut Vec<Packet>, budget: usize) -> std::result::Result<usize, ResetRequest> {
        let budget = budget.min(self.ring.in_use() as usize);
        let mut recv = 0;

        while recv < budget {
            let ctx = match self.cq.rx_packet(&mut self.sq, &mut self.buf_info) {
                Ok(ctx) => ctx,
                Err(e) => return Err(self.hw_error(e)),
            };
            if ctx.descs == 0 {
                break;
            }
            let descs = ctx.descs as usize;
            if descs > PKT_MAX_BUFS || descs > self.ring.in_use() as usize {
                self.stats.add_bad_desc_num(1);
                tracing::error!(qid = self.qid, descs, in_use = self.ring.in_use(), "rx descriptor count out of range");
                return Err(self.reset.trigger(ResetReason::TooManyRxDescs));
            }

            match self.assemble(descs)? {
                Some(mut pkt) => {
                    self.apply_offloads(&mut pkt, &ctx);
                    self.stats.record_packet(pkt.pkt_len() as u64);
                    out.push(pkt);
                    recv += 1;
                }
                None => break,
            }
        }

        let free = self.sq.free_entries();
        if free > self.free_thresh {
            self.refill(free);
        }
        Ok(recv)
    }

    /// Free every posted buffer. Called on queue stop, after the device
    /// queue is destroyed, and on drop.
    pub fn release(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if let Some(seg) = slot.seg.take() {
                self.cache.recycle(seg);
                freed += 1;
            }
        }
        self.cache.flush();
        if freed > 0 {
            tracing::debug!(qid = self.qid, freed, "rx ring released");
        }
        freed
    }

    fn hw_error(&mut self, e: HwError) -> ResetRequest {
        let reason = match e {
            HwError::TooManyDescs => {
                self.stats.add_bad_desc_num(1);
                ResetReason::TooManyRxDescs
            }
            HwError::MalformedDesc => ResetReason::MalformedRxDescriptor,
            HwError::InvalidReqId(_) => {
                self.stats.add_bad_req_id(1);
                ResetReason::InvalidRxReqId
            }
            _ => ResetReason::Unknown,
        };
        tracing::error!(qid = self.qid, error = %e, "rx completion error");
        self.reset.trigger(reason)
    }

    /// Build one packet from `buf_info[..descs]`, consuming every descriptor.
    fn assemble(&mut self, descs: usize) -> std::result::Result<Option<Packet>, ResetRequest> {
        let mut pkt: Option<Packet> = None;
        let mut dropped = false;

        for i in 0..descs {
            let info = self.buf_info[i];
            let id = info.req_id;
            // An empty slot means the id is not in flight; recycling it
            // would hand the same id out twice.
            let taken = if self.ring.is_valid_id(id) { self.slots[id as usize].seg.take() } else { None };
            let mut seg = match taken {
                Some(seg) if info.len as u32 <= self.slots[id as usize].buf.len => seg,
                Some(seg) => {
                    self.slots[id as usize].seg = Some(seg);
                    if let Some(p) = pkt.take() {
                        self.cache.recycle_packet(p);
                    }
                    tracing::error!(qid = self.qid, req_id = id, len = info.len, "rx descriptor length exceeds buffer");
                    return Err(self.reset.trigger(ResetReason::MalformedRxDescriptor));
                }
                None => {
                    if let Some(p) = pkt.take() {
                        self.cache.recycle_packet(p);
                    }
                    self.stats.add_bad_req_id(1);
                    tracing::error!(qid = self.qid, req_id = id, "invalid rx request id: not in flight");
                    return Err(self.reset.trigger(ResetReason::InvalidRxReqId));
                }
            };
            self.ring.recycle_id(id);

            if dropped || (i > 0 && info.len == 0) {
                dropped = true;
                self.cache.recycle(seg);
                continue;
            }
            self.pool.set_data_len(&mut seg, info.len as usize);
            match pkt.as_mut() {
                None => pkt = Some(Packet::new(&self.pool, seg)),
                Some(p) => p.append(&self.pool, seg),
            }
        }

        if dropped {
            if let Some(p) = pkt.take() {
                self.cache.recycle_packet(p);
            }
            self.stats.add_rx_drops(1);
            tracing::warn!(qid = self.qid, descs, "rx packet dropped: empty fragment");
            return Ok(None);
        }
        Ok(pkt)
    }

    fn apply_offloads(&self, pkt: &mut Packet, ctx: &RxContext) {
        let mut flags = OffloadFlags::empty();
        let mut ptype = PacketType::empty();
        let csum = self.offloads.contains(QueueOffloads::RX_CHECKSUM);

        match ctx.l3_proto {
            L3Proto::Ipv4 => {
                ptype |= PacketType::L3_IPV4;
                if csum {
                    if ctx.l3_csum_err {
                        flags |= OffloadFlags::RX_L3_CKSUM_BAD;
                        self.stats.add_l3_csum_bad(1);
                    } else {
                        flags |= OffloadFlags::RX_L3_CKSUM_GOOD;
                    }
                }
            }
            L3Proto::Ipv6 => ptype |= PacketType::L3_IPV6,
            L3Proto::Unknown => {}
        }

        let l4_known = match ctx.l4_proto {
            L4Proto::Tcp => {
                ptype |= PacketType::L4_TCP;
                true
            }
            L4Proto::Udp => {
                ptype |= PacketType::L4_UDP;
                true
            }
            L4Proto::Unknown => false,
        };
        if ctx.frag {
            ptype |= PacketType::L4_FRAG;
        } else if l4_known {
            ptype |= PacketType::L4_NONFRAG;
        }

        if csum {
            if l4_known && !ctx.frag && ctx.l4_csum_checked {
                if ctx.l4_csum_err {
                    flags |= OffloadFlags::RX_L4_CKSUM_BAD;
                    self.stats.add_l4_csum_bad(1);
                } else {
                    flags |= OffloadFlags::RX_L4_CKSUM_GOOD;
                    self.stats.add_l4_csum_good(1);
                }
            } else {
                flags |= OffloadFlags::RX_L4_CKSUM_UNKNOWN;
            }
        }

        if self.offloads.contains(QueueOffloads::RSS_HASH) && l4_known && !ctx.frag {
            flags |= OffloadFlags::RX_RSS_HASH;
            pkt.rss_hash = ctx.hash;
        }

        pkt.ol_flags = flags;
        pkt.packet_type = ptype;
    }
}

impl<Q: CompletionQueue> Drop for RxRing<Q> {
    fn drop(&mut self) {
        self.release();
    }
}
