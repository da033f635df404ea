//! `Packet`: a segment chain plus per-packet metadata.
//!
//! The packet owns its head `Segment`; the rest of the chain hangs off
//! the head through arena links inside the pool. Dropping a `Packet`
//! without `PoolCache::free_packet` leaks its segments.

use crate::pool::{Segment, SegmentPool, NO_LINK};

use vnic_core::offload::{OffloadFlags, PacketType};

#[derive(Debug)]
#[must_use = "dropping a Packet leaks its segments"]
pub struct Packet {
    head: Segment,
    tail: u32,
    nb_segs: u16,
    pkt_len: u32,
    pub ol_flags: OffloadFlags,
    pub packet_type: PacketType,
    /// Valid when `ol_flags` has `RX_RSS_HASH`.
    pub rss_hash: u32,
    pub l2_len: u8,
    pub l3_len: u8,
    pub l4_len: u8,
}

impl Packet {
    /// One-segment packet. Its length is the segment's data length.
    pub fn new(pool: &SegmentPool, head: Segment) -> Self {
        let len = pool.data_len(&head) as u32;
        let tail = head.index();
        Self {
            head,
            tail,
            nb_segs: 1,
            pkt_len: len,
            ol_flags: OffloadFlags::empty(),
            packet_type: PacketType::empty(),
            rss_hash: 0,
            l2_len: 0,
            l3_len: 0,
            l4_len: 0,
        }
    }

    /// Link `seg` after the last segment. The packet takes ownership.
    pub fn append(&mut self, pool: &SegmentPool, seg: Segment) {
        assert_eq!(seg.pool_id(), self.head.pool_id(), "segment belongs to another pool");
        let len = pool.data_len(&seg) as u32;
        let idx = seg.index();
        // Safety: `&mut self` owns the whole chain, including the tail.
        unsafe { pool.meta_mut(self.tail).next = idx };
        self.tail = idx;
        self.nb_segs += 1;
        self.pkt_len += len;
    }

    #[inline]
    pub fn nb_segs(&self) -> u16 {
        self.nb_segs
    }

    /// Total bytes across the chain.
    #[inline]
    pub fn pkt_len(&self) -> u32 {
        self.pkt_len
    }

    #[inline]
    pub fn pool_id(&self) -> u32 {
        self.head.pool_id()
    }

    #[inline]
    pub fn head(&self) -> &Segment {
        &self.head
    }

    /// Request transmit offloads. Header lengths feed the device metadata.
    pub fn set_tx_offload(&mut self, flags: OffloadFlags, l2_len: u8, l3_len: u8, l4_len: u8) {
        self.ol_flags |= flags & OffloadFlags::TX_OFFLOAD_MASK;
        self.l2_len = l2_len;
        self.l3_len = l3_len;
        self.l4_len = l4_len;
    }

    pub fn segments<'a>(&'a self, pool: &'a SegmentPool) -> Segments<'a> {
        assert_eq!(pool.id(), self.pool_id(), "packet belongs to another pool");
        Segments { pool, next: self.head.index(), remaining: self.nb_segs }
    }

    /// Copy the first `dst.len()` bytes of the packet into `dst`.
    /// Returns bytes copied.
    pub fn copy_prefix(&self, pool: &SegmentPool, dst: &mut [u8]) -> usize {
        let mut off = 0;
        for seg in self.segments(pool) {
            if off == dst.len() {
                break;
            }
            let n = seg.data.len().min(dst.len() - off);
            dst[off..off + n].copy_from_slice(&seg.data[..n]);
            off += n;
        }
        off
    }

    pub fn to_vec(&self, pool: &SegmentPool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pkt_len as usize);
        for seg in self.segments(pool) {
            out.extend_from_slice(seg.data);
        }
        out
    }

    pub(crate) fn into_head(self) -> Segment {
        self.head
    }
}

/// One segment of a chain as seen by the device.
#[derive(Debug, Clone, Copy)]
pub struct SegView<'a> {
    pub data: &'a [u8],
    pub iova: u64,
}

pub struct Segments<'a> {
    pool: &'a SegmentPool,
    next: u32,
    remaining: u16,
}

impl<'a> Iterator for Segments<'a> {
    type Item = SegView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.next == NO_LINK {
            return None;
        }
        let idx = self.next;
        self.next = self.pool.meta(idx).next;
        self.remaining -= 1;
        Some(SegView { data: self.pool.bytes(idx), iova: self.pool.iova_of(idx) })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
