//! Virtual → bus address translation.
//!
//! Consulted once per backing block when a pool is built; every segment's
//! bus address is then `block_base + offset` and never looked up again.

pub trait DmaMapper: Send + Sync {
    /// Bus address of `len` bytes starting at `virt`.
    fn dma_addr(&self, virt: *const u8, len: usize) -> u64;
}

/// IOVA == VA. Correct for the in-memory device model and for
/// devices behind an identity-mapped IOMMU.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl DmaMapper for IdentityMapper {
    #[inline]
    fn dma_addr(&self, virt: *const u8, _len: usize) -> u64 {
        virt as u64
    }
}

/// Fixed offset translation, for IOMMU windows that map a contiguous
/// virtual range to a contiguous bus range.
#[derive(Debug, Clone, Copy)]
pub struct OffsetMapper {
    pub offset: i64,
}

impl DmaMapper for OffsetMapper {
    #[inline]
    fn dma_addr(&self, virt: *const u8, _len: usize) -> u64 {
        (virt as u64).wrapping_add(self.offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let buf = [0u8; 16];
        assert_eq!(IdentityMapper.dma_addr(buf.as_ptr(), 16), buf.as_ptr() as u64);
    }

    #[test]
    fn test_offset_negative() {
        let m = OffsetMapper { offset: -0x1000 };
        assert_eq!(m.dma_addr(0x5000 as *const u8, 1), 0x4000);
    }
}
