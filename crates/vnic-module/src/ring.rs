//! Ring index bookkeeping shared by the rx and tx engines.
//!
//! ```text
//!   free_ids:  [ id id id id id id id id ]   (size entries, mask = size-1)
//!                    ^ntc         ^ntu
//!   ntu (producer) takes the next free request id and post it
//!   ntc (consumer) recycles a completed request id
//! ```
//!
//! `next_to_use` and `next_to_clean` are free-running `u16` counters,
//! masked on access, so `ntu - ntc` is the in-flight count without any
//! full/empty ambiguity. One id is always held back: at most `size - 1`
//! requests are in flight.

use vnic_core::desc::RequestId;

pub struct RingState {
    size: u16,
    mask: u16,
    next_to_use: u16,
    next_to_clean: u16,
    free_ids: Box<[RequestId]>,
}

impl RingState {
    /// `size` must be a power of two, at least 2 and at most 32768.
    pub fn new(size: u16) -> Self {
        assert!(size >= 2 && size.is_power_of_two(), "ring size must be a power of two");
        assert!(size <= 1 << 15, "ring size too large for u16 indices");
        Self {
            size,
            mask: size - 1,
            next_to_use: 0,
            next_to_clean: 0,
            free_ids: (0..size).collect(),
        }
    }

    #[inline]
    pub fn size(&self) -> u16 {
        self.size
    }

    #[inline]
    pub fn in_use(&self) -> u16 {
        self.next_to_use.wrapping_sub(self.next_to_clean)
    }

    /// Ids that can still be issued.
    #[inline]
    pub fn free(&self) -> u16 {
        self.size - 1 - self.in_use()
    }

    /// Masked producer index.
    #[inline]
    pub fn next_to_use(&self) -> u16 {
        self.next_to_use & self.mask
    }

    /// Masked consumer index.
    #[inline]
    pub fn next_to_clean(&self) -> u16 {
        self.next_to_clean & self.mask
    }

    #[inline]
    pub fn is_valid_id(&self, id: RequestId) -> bool {
        id < self.size
    }

    /// Next id `commit_use` would issue.
    #[inline]
    pub fn peek_free_id(&self) -> Option<RequestId> {
        if self.free() == 0 {
            return None;
        }
        Some(self.free_ids[self.next_to_use() as usize])
    }

    #[inline]
    pub fn commit_use(&mut self) {
        debug_assert!(self.free() > 0);
        self.next_to_use = self.next_to_use.wrapping_add(1);
    }

    pub fn take_free_id(&mut self) -> Option<RequestId> {
        let id = self.peek_free_id()?;
        self.commit_use();
        Some(id)
    }

    /// Return a completed id at the consumer position.
    #[inline]
    pub fn recycle_id(&mut self, id: RequestId) {
        debug_assert!(self.in_use() > 0, "recycle on empty ring");
        debug_assert!(self.is_valid_id(id));
        let pos = self.next_to_clean() as usize;
        self.free_ids[pos] = id;
        self.next_to_clean = self.next_to_clean.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        RingState::new(100);
    }

    #[test]
    fn test_fill_holds_one_back() {
        let mut r = RingState::new(8);
        let mut ids = Vec::new();
        while let Some(id) = r.take_free_id() {
            ids.push(id);
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(r.in_use(), 7);
        assert_eq!(r.free(), 0);
        assert_eq!(r.peek_free_id(), None);
    }

    #[test]
    fn test_out_of_order_recycle() {
        let mut r = RingState::new(4);
        let a = r.take_free_id().unwrap();
        let b = r.take_free_id().unwrap();
        let c = r.take_free_id().unwrap();
        // Completions arrive c, a, b.
        r.recycle_id(c);
        r.recycle_id(a);
        r.recycle_id(b);
        assert_eq!(r.in_use(), 0);
        // Ids come back in completion order after the untouched one.
        let got: Vec<_> = std::iter::from_fn(|| r.take_free_id()).collect();
        assert_eq!(got, vec![3, c, a]);
    }

    #[test]
    fn test_wraparound() {
        let mut r = RingState::new(4);
        for _ in 0..70_000u32 {
            let id = r.take_free_id().unwrap();
            r.recycle_id(id);
        }
        assert_eq!(r.in_use(), 0);
        assert_eq!(r.free(), 3);
    }

    proptest! {
        #[test]
        fn prop_in_flight_bounded(ops in prop::collection::vec(any::<bool>(), 1..512), shift in 1u32..8) {
            let size = 1u16 << shift;
            let mut r = RingState::new(size);
            let mut in_flight = std::collections::VecDeque::new();
            for take in ops {
                if take {
                    if let Some(id) = r.take_free_id() {
                        prop_assert!(!in_flight.contains(&id));
                        in_flight.push_back(id);
                    }
                } else if let Some(id) = in_flight.pop_front() {
                    r.recycle_id(id);
                }
                prop_assert!(r.in_use() <= size - 1);
                prop_assert_eq!(r.in_use() as usize, in_flight.len());
            }
        }
    }
}
