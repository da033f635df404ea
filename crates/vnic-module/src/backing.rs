//! Backing memory for segment pools: anonymous mmap blocks.
//!
//! Blocks are populated up front (`MAP_POPULATE` on Linux) so the first
//! DMA into a segment never faults, and can optionally be mlock'd so they
//! stay resident.

use vnic_core::error::PoolError;

use nix::errno::Errno;
use nix::unistd::{sysconf, SysconfVar};
use std::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE;
    } else {
        const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    }
}

const FALLBACK_PAGE_SIZE: usize = 4096;

/// System page size.
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Round `len` up to a whole number of pages.
pub fn round_to_page(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// One contiguous mmap'd region. Unmapped on drop.
pub struct BackingBlock {
    base: NonNull<u8>,
    len: usize,
    locked: bool,
}

// Safety: the block is plain anonymous memory with no thread affinity.
// Access to its bytes is mediated by the pool's segment ownership.
unsafe impl Send for BackingBlock {}
unsafe impl Sync for BackingBlock {}

impl BackingBlock {
    /// Map `len` bytes (rounded up to a page). `lock` additionally mlocks.
    pub fn map(len: usize, lock: bool) -> Result<Self, PoolError> {
        if len == 0 {
            return Err(PoolError::InvalidGeometry("zero-length backing block"));
        }
        let len = round_to_page(len);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PoolError::MmapFailed(Errno::last() as i32));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(PoolError::MmapFailed(0))?;

        if lock {
            let ret = unsafe { libc::mlock(ptr, len) };
            if ret != 0 {
                let errno = Errno::last() as i32;
                unsafe {
                    libc::munmap(ptr, len);
                }
                return Err(PoolError::MlockFailed(errno));
            }
        }

        Ok(Self { base, len, locked: lock })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for BackingBlock {
    fn drop(&mut self) {
        let ptr = self.base.as_ptr() as *mut libc::c_void;
        unsafe {
            if self.locked {
                libc::munlock(ptr, self.len);
            }
            if libc::munmap(ptr, self.len) != 0 {
                tracing::warn!(len = self.len, errno = Errno::last() as i32, "munmap of backing block failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let p = page_size();
        assert!(p >= 4096);
        assert!(p.is_power_of_two());
    }

    #[test]
    fn test_round_to_page() {
        let p = page_size();
        assert_eq!(round_to_page(1), p);
        assert_eq!(round_to_page(p), p);
        assert_eq!(round_to_page(p + 1), 2 * p);
    }

    #[test]
    fn test_map_read_write() {
        let block = BackingBlock::map(10_000, false).unwrap();
        assert!(block.len() >= 10_000);
        assert_eq!(block.len() % page_size(), 0);
        unsafe {
            let p = block.as_ptr();
            // Populated anonymous memory reads as zero.
            assert_eq!(*p, 0);
            *p.add(9_999) = 0xAB;
            assert_eq!(*p.add(9_999), 0xAB);
        }
    }

    #[test]
    fn test_map_zero_rejected() {
        assert!(matches!(BackingBlock::map(0, false), Err(PoolError::InvalidGeometry(_))));
    }
}
