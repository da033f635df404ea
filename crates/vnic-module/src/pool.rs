//! `SegmentPool`: fixed-size segment allocator for the rings.
//!
//! Segments live in an arena carved out of large mmap'd blocks at
//! construction time. A `Segment` is a move-only handle to one arena
//! entry; only the pool creates them and freeing consumes them, so a
//! segment can't be freed twice or used after free.
//!
//! ## Tiers
//!
//! | Tier   | Type          | Owner             | Structure         |
//! |--------|---------------|-------------------|-------------------|
//! | shared | `SegmentPool` | any thread (Arc)  | `ArrayQueue<u32>` |
//! | local  | `PoolCache`   | one ring / thread | `Vec<u32>` stack  |
//!
//! `PoolCache::alloc_bulk` drains the local stack, then the shared queue.
//! Frees fill the local stack up to its capacity and overflow to the
//! shared queue. The cache capacity is a constructor parameter.
//!
//! Bus addresses are computed once per block through a `DmaMapper` and
//! stored per segment, so `iova()` is a field read.

use crate::backing::BackingBlock;
use crate::packet::Packet;

use vnic_core::dma::{DmaMapper, IdentityMapper};
use vnic_core::error::PoolError;

use crossbeam_queue::ArrayQueue;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Chain terminator.
pub(crate) const NO_LINK: u32 = u32::MAX;

pub const DEFAULT_SEGMENT_SIZE: usize = 2048;
pub const DEFAULT_SEGMENT_COUNT: usize = 4096;
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bytes per segment.
    pub segment_size: usize,
    pub segment_count: usize,
    /// Bytes per backing block. Rounded down to whole segments.
    pub block_size: usize,
    /// mlock the backing blocks.
    pub lock_memory: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
            lock_memory: false,
        }
    }
}

impl PoolConfig {
    pub fn new(segment_size: usize, segment_count: usize) -> Self {
        Self { segment_size, segment_count, ..Self::default() }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock_memory = lock;
        self
    }

    fn validate(&self) -> Result<usize, PoolError> {
        if self.segment_size == 0 || self.segment_size > u32::MAX as usize {
            return Err(PoolError::InvalidGeometry("segment size out of range"));
        }
        if self.segment_count == 0 || self.segment_count >= NO_LINK as usize {
            return Err(PoolError::InvalidGeometry("segment count out of range"));
        }
        let per_block = self.block_size / self.segment_size;
        if per_block == 0 {
            return Err(PoolError::InvalidGeometry("block smaller than one segment"));
        }
        Ok(per_block)
    }
}

/// Owned handle to one pool segment. Not `Clone`: exactly one handle
/// exists per allocated segment.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a Segment leaks it from its pool"]
pub struct Segment {
    pool: u32,
    idx: u32,
}

impl Segment {
    #[inline]
    pub fn pool_id(&self) -> u32 {
        self.pool
    }

    /// Arena index, unique among live segments of the pool.
    #[inline]
    pub fn index(&self) -> u32 {
        self.idx
    }
}

pub(crate) struct SegMeta {
    pub(crate) data_len: u32,
    pub(crate) next: u32,
}

struct SegSlot {
    buf: *mut u8,
    iova: u64,
    meta: UnsafeCell<SegMeta>,
}

struct PoolInner {
    id: u32,
    seg_size: usize,
    slots: Box<[SegSlot]>,
    free: ArrayQueue<u32>,
    /// Segments handed out and not yet returned. Caches do not count.
    outstanding: AtomicUsize,
    _blocks: Vec<BackingBlock>,
}

// Safety: a slot's buffer and metadata are only touched by whoever holds
// its `Segment` handle or the `Packet` whose chain links it, and that
// owner is unique. The free queue and counters are atomic.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl PoolInner {
    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            tracing::error!(
                pool = self.id,
                outstanding,
                "segment pool dropped with outstanding segments"
            );
        }
    }
}

/// Shared handle to a segment pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct SegmentPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentPool")
            .field("id", &self.inner.id)
            .field("segment_size", &self.inner.seg_size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// `SegmentPool::destroy` refused; the pool handle is returned.
#[derive(Debug, Error)]
#[error("pool {} still in use: {outstanding} segments outstanding, {handles} handles", .pool.id())]
pub struct PoolDestroyError {
    pub pool: SegmentPool,
    pub outstanding: usize,
    pub handles: usize,
}

impl SegmentPool {
    /// Build a pool, translating block addresses with `mapper`.
    pub fn new(cfg: &PoolConfig, mapper: &dyn DmaMapper) -> Result<Self, PoolError> {
        let per_block = cfg.validate()?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let seg = cfg.segment_size;

        let mut slots = Vec::with_capacity(cfg.segment_count);
        let mut blocks = Vec::new();
        let mut remaining = cfg.segment_count;
        while remaining > 0 {
            let n = remaining.min(per_block);
            let block = BackingBlock::map(n * seg, cfg.lock_memory)?;
            let base = block.as_ptr();
            let base_iova = mapper.dma_addr(base, block.len());
            for i in 0..n {
                slots.push(SegSlot {
                    // Safety: i * seg < n * seg <= block.len()
                    buf: unsafe { base.add(i * seg) },
                    iova: base_iova + (i * seg) as u64,
                    meta: UnsafeCell::new(SegMeta { data_len: 0, next: NO_LINK }),
                });
            }
            blocks.push(block);
            remaining -= n;
        }

        let free = ArrayQueue::new(cfg.segment_count);
        for idx in 0..cfg.segment_count as u32 {
            let _ = free.push(idx);
        }

        tracing::debug!(
            pool = id,
            segments = cfg.segment_count,
            segment_size = seg,
            blocks = blocks.len(),
            locked = cfg.lock_memory,
            "segment pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                seg_size: seg,
                slots: slots.into_boxed_slice(),
                free,
                outstanding: AtomicUsize::new(0),
                _blocks: blocks,
            }),
        })
    }

    /// Pool with identity DMA mapping.
    pub fn with_identity(cfg: &PoolConfig) -> Result<Self, PoolError> {
        Self::new(cfg, &IdentityMapper)
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.inner.seg_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Free segments in the shared store.
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Segments held by callers, rings or packets.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }

    /// New local cache holding at most `capacity` segments.
    pub fn cache(&self, capacity: usize) -> PoolCache {
        PoolCache { pool: self.clone(), stack: Vec::with_capacity(capacity), capacity }
    }

    /// One segment straight from the shared store.
    pub fn alloc(&self) -> Result<Segment, PoolError> {
        match self.inner.free.pop() {
            Some(idx) => Ok(self.hand_out(idx)),
            None => Err(PoolError::Exhausted { requested: 1, available: 0 }),
        }
    }

    /// Return one segment straight to the shared store. A segment of
    /// another pool is refused and left with the caller's drop.
    pub fn free(&self, seg: Segment) -> Result<(), PoolError> {
        self.owns(seg.pool)?;
        self.give_back(seg.idx);
        Ok(())
    }

    /// Consume the last handle to an idle pool. Refuses while segments or
    /// other handles (caches, rings, clones) are still live.
    pub fn destroy(self) -> Result<(), PoolDestroyError> {
        let handles = Arc::strong_count(&self.inner);
        let outstanding = self.outstanding();
        if handles > 1 || outstanding > 0 {
            return Err(PoolDestroyError { pool: self, outstanding, handles });
        }
        tracing::debug!(pool = self.id(), "segment pool destroyed");
        Ok(())
    }

    /// Bus address of the segment's buffer.
    ///
    /// # Panics
    ///
    /// If `seg` belongs to another pool. The same holds for every accessor
    /// below that takes a `Segment`.
    #[inline]
    pub fn iova(&self, seg: &Segment) -> u64 {
        self.check(seg);
        self.inner.slots[seg.idx as usize].iova
    }

    #[inline]
    pub fn data_len(&self, seg: &Segment) -> usize {
        self.check(seg);
        self.meta(seg.idx).data_len as usize
    }

    /// Set the used length. Panics if `len` exceeds the segment size.
    #[inline]
    pub fn set_data_len(&self, seg: &mut Segment, len: usize) {
        self.check(seg);
        assert!(len <= self.inner.seg_size, "data length {} exceeds segment size", len);
        // Safety: `&mut Segment` is the unique owner of the slot.
        unsafe { self.meta_mut(seg.idx).data_len = len as u32 };
    }

    /// The used bytes of a segment.
    pub fn data<'a>(&'a self, seg: &'a Segment) -> &'a [u8] {
        self.check(seg);
        self.bytes(seg.idx)
    }

    /// The whole buffer of a segment, for filling before `set_data_len`.
    pub fn buf_mut<'a>(&'a self, seg: &'a mut Segment) -> &'a mut [u8] {
        self.check(seg);
        let slot = &self.inner.slots[seg.idx as usize];
        // Safety: the handle is unique and borrowed mutably for 'a.
        unsafe { std::slice::from_raw_parts_mut(slot.buf, self.inner.seg_size) }
    }

    /// Copy `bytes` into the segment and set its length.
    pub fn write(&self, seg: &mut Segment, bytes: &[u8]) {
        let n = bytes.len();
        self.buf_mut(seg)[..n].copy_from_slice(bytes);
        self.set_data_len(seg, n);
    }

    // ── arena internals ──

    #[inline]
    fn check(&self, seg: &Segment) {
        assert_eq!(seg.pool, self.inner.id, "segment belongs to another pool");
    }

    #[inline]
    fn owns(&self, pool: u32) -> Result<(), PoolError> {
        if pool == self.inner.id {
            Ok(())
        } else {
            tracing::warn!(pool = self.inner.id, found = pool, "refusing segment of another pool");
            Err(PoolError::ForeignSegment { expected: self.inner.id, found: pool })
        }
    }

    #[inline]
    pub(crate) fn meta(&self, idx: u32) -> &SegMeta {
        // Safety: readers hold a shared borrow of the owning handle/packet,
        // writers an exclusive one.
        unsafe { &*self.inner.slots[idx as usize].meta.get() }
    }

    /// Safety: caller must own the segment at `idx` exclusively.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn meta_mut(&self, idx: u32) -> &mut SegMeta {
        &mut *self.inner.slots[idx as usize].meta.get()
    }

    #[inline]
    pub(crate) fn bytes(&self, idx: u32) -> &[u8] {
        let slot = &self.inner.slots[idx as usize];
        let len = self.meta(idx).data_len as usize;
        // Safety: data_len <= seg_size; the owner is borrowed shared.
        unsafe { std::slice::from_raw_parts(slot.buf, len) }
    }

    #[inline]
    pub(crate) fn iova_of(&self, idx: u32) -> u64 {
        self.inner.slots[idx as usize].iova
    }

    /// Fresh handle for a segment just taken off a free list.
    #[inline]
    fn hand_out(&self, idx: u32) -> Segment {
        // Safety: idx was free, nobody else references it.
        let meta = unsafe { self.meta_mut(idx) };
        meta.data_len = 0;
        meta.next = NO_LINK;
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Segment { pool: self.inner.id, idx }
    }

    /// Undo `hand_out`: the segment goes back to the shared store.
    #[inline]
    fn give_back(&self, idx: u32) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.push_shared(idx);
    }

    #[inline]
    fn push_shared(&self, idx: u32) {
        if self.inner.free.push(idx).is_err() {
            // Only reachable if an index was freed twice.
            tracing::error!(pool = self.inner.id, idx, "shared free store overflow");
        }
    }
}

/// Single-owner front cache of a `SegmentPool`.
///
/// `&mut self` on every operation: a cache is driven by one context.
pub struct PoolCache {
    pool: SegmentPool,
    stack: Vec<u32>,
    capacity: usize,
}

impl PoolCache {
    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Segments currently parked in this cache.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append exactly `n` segments to `out`, or none.
    ///
    /// On shortfall everything taken is put back and `Exhausted` reports
    /// how many were reachable.
    pub fn alloc_bulk(&mut self, out: &mut Vec<Segment>, n: usize) -> Result<(), PoolError> {
        if n == 0 {
            return Ok(());
        }
        let from_cache = n.min(self.stack.len());
        let from_shared = n - from_cache;

        let start = out.len();
        for _ in 0..from_shared {
            match self.pool.inner.free.pop() {
                Some(idx) => out.push(self.pool.hand_out(idx)),
                None => {
                    let got = out.len() - start;
                    for seg in out.drain(start..) {
                        self.pool.give_back(seg.idx);
                    }
                    return Err(PoolError::Exhausted { requested: n, available: from_cache + got });
                }
            }
        }

        let keep = self.stack.len() - from_cache;
        for idx in self.stack.drain(keep..) {
            out.push(self.pool.hand_out(idx));
        }
        Ok(())
    }

    pub fn alloc(&mut self) -> Result<Segment, PoolError> {
        match self.stack.pop() {
            Some(idx) => Ok(self.pool.hand_out(idx)),
            None => self.pool.alloc(),
        }
    }

    /// A segment of another pool is refused; its indices never enter
    /// this pool.
    pub fn free(&mut self, seg: Segment) -> Result<(), PoolError> {
        self.pool.owns(seg.pool)?;
        self.release(seg.idx);
        Ok(())
    }

    /// Free every segment this pool owns. Foreign segments are skipped
    /// and the last refusal is reported.
    pub fn free_bulk<I>(&mut self, segs: I) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = Segment>,
    {
        let mut outcome = Ok(());
        for seg in segs {
            if let Err(e) = self.free(seg) {
                outcome = Err(e);
            }
        }
        outcome
    }

    /// Free every segment of a packet chain. A packet built on another
    /// pool is refused whole.
    pub fn free_packet(&mut self, pkt: Packet) -> Result<(), PoolError> {
        self.pool.owns(pkt.pool_id())?;
        self.recycle_packet(pkt);
        Ok(())
    }

    pub fn free_packets<I>(&mut self, pkts: I) -> Result<(), PoolError>
    where
        I: IntoIterator<Item = Packet>,
    {
        let mut outcome = Ok(());
        for pkt in pkts {
            if let Err(e) = self.free_packet(pkt) {
                outcome = Err(e);
            }
        }
        outcome
    }

    /// `free` for segments the caller knows came from this pool.
    #[inline]
    pub(crate) fn recycle(&mut self, seg: Segment) {
        debug_assert_eq!(seg.pool, self.pool.id());
        self.release(seg.idx);
    }

    /// `free_packet` for packets the caller knows came from this pool.
    pub(crate) fn recycle_packet(&mut self, pkt: Packet) {
        debug_assert_eq!(pkt.pool_id(), self.pool.id());
        let mut idx = pkt.into_head().idx;
        debug_assert_ne!(idx, NO_LINK);
        while idx != NO_LINK {
            let next = self.pool.meta(idx).next;
            self.release(idx);
            idx = next;
        }
    }

    /// Move every cached segment to the shared store.
    pub fn flush(&mut self) -> usize {
        let n = self.stack.len();
        for idx in self.stack.drain(..) {
            self.pool.push_shared(idx);
        }
        n
    }

    /// Pull up to `n` segments from the shared store into the cache.
    pub fn prefill(&mut self, n: usize) -> usize {
        let room = self.capacity - self.stack.len();
        let mut got = 0;
        while got < n.min(room) {
            match self.pool.inner.free.pop() {
                Some(idx) => {
                    self.stack.push(idx);
                    got += 1;
                }
                None => break,
            }
        }
        got
    }

    /// Build a packet holding `bytes`, split across as many segments as
    /// needed. An empty slice yields a one-segment empty packet.
    pub fn packet_from_bytes(&mut self, bytes: &[u8]) -> Result<Packet, PoolError> {
        let seg_size = self.pool.segment_size();
        let nsegs = bytes.len().div_ceil(seg_size).max(1);
        let mut segs = Vec::with_capacity(nsegs);
        self.alloc_bulk(&mut segs, nsegs)?;

        let mut chunks = bytes.chunks(seg_size);
        let mut iter = segs.into_iter();
        let mut head = match iter.next() {
            Some(seg) => seg,
            None => return Err(PoolError::Exhausted { requested: nsegs, available: 0 }),
        };
        self.pool.write(&mut head, chunks.next().unwrap_or(&[]));
        let mut pkt = Packet::new(&self.pool, head);
        for (mut seg, chunk) in iter.zip(chunks) {
            self.pool.write(&mut seg, chunk);
            pkt.append(&self.pool, seg);
        }
        Ok(pkt)
    }

    #[inline]
    fn release(&mut self, idx: u32) {
        self.pool.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.stack.len() < self.capacity {
            self.stack.push(idx);
        } else {
            self.pool.push_shared(idx);
        }
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small_pool(count: usize) -> SegmentPool {
        SegmentPool::with_identity(&PoolConfig::new(2048, count)).unwrap()
    }

    #[test]
    fn test_geometry_rejected() {
        assert!(SegmentPool::with_identity(&PoolConfig::new(0, 8)).is_err());
        assert!(SegmentPool::with_identity(&PoolConfig::new(2048, 0)).is_err());
        let cfg = PoolConfig::new(4096, 8).with_block_size(1024);
        assert!(matches!(
            SegmentPool::with_identity(&cfg),
            Err(PoolError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_multiple_blocks_iova() {
        // 4 segments per block → 3 blocks for 10 segments.
        let cfg = PoolConfig::new(1024, 10).with_block_size(4096);
        let pool = SegmentPool::with_identity(&cfg).unwrap();
        assert_eq!(pool.capacity(), 10);
        let mut cache = pool.cache(0);
        let mut segs = Vec::new();
        cache.alloc_bulk(&mut segs, 10).unwrap();
        for seg in &segs {
            let data_ptr = pool.data(seg).as_ptr() as u64;
            assert_eq!(pool.iova(seg), data_ptr);
        }
        cache.free_bulk(segs).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_alloc_bulk_all_or_nothing() {
        let pool = small_pool(8);
        let mut cache = pool.cache(4);
        let mut out = Vec::new();
        cache.alloc_bulk(&mut out, 6).unwrap();
        assert_eq!(out.len(), 6);

        let mut more = Vec::new();
        let err = cache.alloc_bulk(&mut more, 3).unwrap_err();
        assert_eq!(err, PoolError::Exhausted { requested: 3, available: 2 });
        assert!(more.is_empty());
        assert_eq!(pool.available(), 2);

        cache.free_bulk(out).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_cache_capacity_overflow() {
        let pool = small_pool(16);
        let mut cache = pool.cache(4);
        let mut out = Vec::new();
        cache.alloc_bulk(&mut out, 10).unwrap();
        cache.free_bulk(out).unwrap();
        assert_eq!(cache.len(), 4);
        assert_eq!(pool.available(), 12);
        assert_eq!(pool.outstanding(), 0);

        // Next allocation drains the cache first.
        let mut out = Vec::new();
        cache.alloc_bulk(&mut out, 4).unwrap();
        assert!(cache.is_empty());
        assert_eq!(pool.available(), 12);
        cache.free_bulk(out).unwrap();
    }

    #[test]
    fn test_cache_drop_flushes() {
        let pool = small_pool(8);
        {
            let mut cache = pool.cache(8);
            assert_eq!(cache.prefill(5), 5);
            assert_eq!(pool.available(), 3);
            assert_eq!(pool.outstanding(), 0);
        }
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_segments_reset_on_alloc() {
        let pool = small_pool(1);
        let mut seg = pool.alloc().unwrap();
        pool.write(&mut seg, b"hello");
        assert_eq!(pool.data(&seg), b"hello");
        pool.free(seg).unwrap();
        let seg = pool.alloc().unwrap();
        assert_eq!(pool.data_len(&seg), 0);
        pool.free(seg).unwrap();
    }

    #[test]
    fn test_packet_from_bytes_chains() {
        let pool = SegmentPool::with_identity(&PoolConfig::new(1024, 8)).unwrap();
        let mut cache = pool.cache(8);
        let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let pkt = cache.packet_from_bytes(&payload).unwrap();
        assert_eq!(pkt.nb_segs(), 3);
        assert_eq!(pkt.pkt_len(), 2500);
        assert_eq!(pkt.to_vec(&pool), payload);
        assert_eq!(pool.outstanding(), 3);
        cache.free_packet(pkt).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_destroy_refuses_outstanding() {
        let pool = small_pool(4);
        let seg = pool.alloc().unwrap();
        let err = pool.destroy().unwrap_err();
        assert_eq!(err.outstanding, 1);
        let pool = err.pool;
        pool.free(seg).unwrap();
        pool.destroy().unwrap();
    }

    #[test]
    fn test_destroy_refuses_live_cache() {
        let pool = small_pool(4);
        let cache = pool.cache(2);
        let err = pool.destroy().unwrap_err();
        assert_eq!(err.handles, 2);
        drop(cache);
        err.pool.destroy().unwrap();
    }

    #[test]
    fn test_foreign_segment_refused() {
        let a = small_pool(2);
        let b = small_pool(2);
        let seg = b.alloc().unwrap();
        let idx = seg.index();
        assert_eq!(a.free(seg), Err(PoolError::ForeignSegment { expected: a.id(), found: b.id() }));

        let mut cache = a.cache(4);
        let seg = Segment { pool: b.id(), idx };
        assert!(matches!(cache.free(seg), Err(PoolError::ForeignSegment { .. })));
        assert!(cache.is_empty());
        assert_eq!(a.available(), 2);
        assert_eq!(a.outstanding(), 0);
        b.free(Segment { pool: b.id(), idx }).unwrap();
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn test_foreign_packet_refused() {
        let a = small_pool(4);
        let b = small_pool(4);
        let mut ca = a.cache(8);
        let mut cb = b.cache(8);
        let pkt = cb.packet_from_bytes(b"foreign").unwrap();
        let err = ca.free_packet(pkt).unwrap_err();
        assert_eq!(err, PoolError::ForeignSegment { expected: a.id(), found: b.id() });
        assert!(ca.is_empty());

        // Pool A still hands out exactly its own four segments, once each.
        let mut live = Vec::new();
        assert!(matches!(ca.alloc_bulk(&mut live, 5), Err(PoolError::Exhausted { available: 4, .. })));
        ca.alloc_bulk(&mut live, 4).unwrap();
        let distinct: HashSet<u32> = live.iter().map(|s| s.index()).collect();
        assert_eq!(distinct.len(), 4);
        assert_eq!(a.outstanding(), 4);
        ca.free_bulk(live).unwrap();
    }

    #[test]
    fn test_free_bulk_skips_foreign() {
        let a = small_pool(4);
        let b = small_pool(4);
        let mut ca = a.cache(8);
        let mine = a.alloc().unwrap();
        let theirs = b.alloc().unwrap();
        let theirs_idx = theirs.index();
        assert!(ca.free_bulk(vec![mine, theirs]).is_err());
        assert_eq!(a.outstanding(), 0);
        assert_eq!(ca.len(), 1);
        b.free(Segment { pool: b.id(), idx: theirs_idx }).unwrap();
    }

    #[test]
    fn test_outstanding_consistent_under_concurrent_flush() {
        use std::sync::atomic::AtomicBool;

        let pool = small_pool(128);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let pool = pool.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut cache = pool.cache(64);
                while !stop.load(Ordering::Relaxed) {
                    cache.prefill(64);
                    cache.flush();
                }
            })
        };
        for _ in 0..20_000 {
            assert_eq!(pool.outstanding(), 0);
        }
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
        assert_eq!(pool.available(), 128);
    }

    #[test]
    #[should_panic(expected = "another pool")]
    fn test_foreign_segment_accessor_panics() {
        let a = small_pool(1);
        let b = small_pool(1);
        let seg = a.alloc().unwrap();
        let _ = b.iova(&seg);
    }

    mod conservation {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Alloc(usize),
            Free(usize),
            Flush,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..12).prop_map(Op::Alloc),
                (0usize..12).prop_map(Op::Free),
                Just(Op::Flush),
            ]
        }

        proptest! {
            #[test]
            fn prop_pool_conservation(ops in prop::collection::vec(op(), 1..64), cap in 0usize..8) {
                let pool = SegmentPool::with_identity(&PoolConfig::new(256, 32)).unwrap();
                let mut cache = pool.cache(cap);
                let mut live: Vec<Segment> = Vec::new();

                for op in ops {
                    match op {
                        Op::Alloc(n) => {
                            let before = live.len();
                            match cache.alloc_bulk(&mut live, n) {
                                Ok(()) => prop_assert_eq!(live.len(), before + n),
                                Err(PoolError::Exhausted { requested, available }) => {
                                    prop_assert_eq!(live.len(), before);
                                    prop_assert_eq!(requested, n);
                                    prop_assert!(available < n);
                                }
                                Err(e) => prop_assert!(false, "unexpected {:?}", e),
                            }
                        }
                        Op::Free(n) => {
                            let n = n.min(live.len());
                            let tail = live.split_off(live.len() - n);
                            prop_assert!(cache.free_bulk(tail).is_ok());
                        }
                        Op::Flush => {
                            cache.flush();
                        }
                    }

                    prop_assert!(live.len() <= pool.capacity());
                    prop_assert_eq!(pool.outstanding(), live.len());
                    let distinct: HashSet<u32> = live.iter().map(|s| s.index()).collect();
                    prop_assert_eq!(distinct.len(), live.len());
                    prop_assert!(cache.len() <= cap);
                }

                prop_assert!(cache.free_bulk(live).is_ok());
                prop_assert_eq!(pool.outstanding(), 0);
            }
        }
    }
}
