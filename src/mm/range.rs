//! Address Range Pool
//!
//! First-fit allocator over a process's virtual address region. Ranges
//! are kept in one base-ordered list; adjacent free neighbours are merged
//! after every release, so fragmentation stays bounded and the list never
//! holds two consecutive free, contiguous entries.

use crate::mm::VirtAddr;
use crate::{KernelError, KernelResult, PAGE_SIZE};
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// Properties of an allocated range
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RangeFlags: u32 {
        /// The physical frames mapped behind this range are owned by it
        /// and are released together with it
        const BACKED = 1 << 0;
    }
}

/// One contiguous run of virtual pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    /// First page address
    pub base: VirtAddr,
    /// Length in pages
    pub pages: usize,
    /// Currently allocated
    pub used: bool,
    /// Flags recorded at allocation time
    pub flags: RangeFlags,
}

impl AddressRange {
    /// Exclusive end address
    pub fn end(&self) -> VirtAddr {
        VirtAddr::new(self.base.as_u64() + (self.pages * PAGE_SIZE) as u64)
    }
}

/// Free-list allocator of virtual address ranges
pub struct RangePool {
    ranges: Mutex<Vec<AddressRange>>,
}

impl RangePool {
    /// Create an empty pool
    pub const fn new() -> Self {
        Self {
            ranges: Mutex::new(Vec::new()),
        }
    }

    /// Add `[start, end)` as free space, keeping the list base-ordered.
    pub fn initialize_range(&self, start: VirtAddr, end: VirtAddr) -> KernelResult<()> {
        if !start.is_aligned() || !end.is_aligned() || end.as_u64() <= start.as_u64() {
            log::warn!(
                "range pool: rejecting region {:#x}..{:#x}",
                start.as_u64(),
                end.as_u64()
            );
            return Err(KernelError::InvalidArgument);
        }
        let range = AddressRange {
            base: start,
            pages: ((end.as_u64() - start.as_u64()) as usize) / PAGE_SIZE,
            used: false,
            flags: RangeFlags::empty(),
        };
        let mut ranges = self.ranges.lock();
        let pos = ranges
            .iter()
            .position(|r| r.base.as_u64() > start.as_u64())
            .unwrap_or(ranges.len());
        ranges.insert(pos, range);
        Self::merge(&mut ranges);
        Ok(())
    }

    /// Allocate `pages` contiguous pages, first fit.
    ///
    /// A match larger than requested is split, leaving the trailing
    /// splinter free. Exhaustion is recoverable: the caller decides
    /// whether a failed reservation is fatal.
    pub fn allocate(&self, pages: usize, flags: RangeFlags) -> KernelResult<VirtAddr> {
        if pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut ranges = self.ranges.lock();
        let pos = ranges.iter().position(|r| !r.used && r.pages >= pages);
        let Some(pos) = pos else {
            log::warn!("range pool: no free range of {} pages", pages);
            return Err(KernelError::AddressSpaceExhausted);
        };

        if ranges[pos].pages > pages {
            let splinter = AddressRange {
                base: VirtAddr::new(ranges[pos].base.as_u64() + (pages * PAGE_SIZE) as u64),
                pages: ranges[pos].pages - pages,
                used: false,
                flags: RangeFlags::empty(),
            };
            ranges.insert(pos + 1, splinter);
        }
        let range = &mut ranges[pos];
        range.pages = pages;
        range.used = true;
        range.flags = flags;
        Ok(range.base)
    }

    /// Release the range starting at `base`, returning its page count.
    ///
    /// An unknown base or an already-free range is logged and leaves the
    /// pool untouched.
    pub fn free(&self, base: VirtAddr) -> KernelResult<usize> {
        let mut ranges = self.ranges.lock();
        let Some(pos) = ranges.iter().position(|r| r.base == base) else {
            log::warn!("range pool: free of untracked base {:#x}", base.as_u64());
            return Err(KernelError::NotFound);
        };
        if !ranges[pos].used {
            log::warn!("range pool: double free at {:#x}", base.as_u64());
            return Err(KernelError::InvalidArgument);
        }
        let pages = ranges[pos].pages;
        ranges[pos].used = false;
        ranges[pos].flags = RangeFlags::empty();
        Self::merge(&mut ranges);
        Ok(pages)
    }

    /// Coalesce every adjacent pair of free, contiguous ranges.
    fn merge(ranges: &mut Vec<AddressRange>) {
        let mut i = 0;
        while i + 1 < ranges.len() {
            let mergeable = !ranges[i].used
                && !ranges[i + 1].used
                && ranges[i].end() == ranges[i + 1].base;
            if mergeable {
                ranges[i].pages += ranges[i + 1].pages;
                ranges.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Look up the range starting exactly at `base`.
    pub fn range_at(&self, base: VirtAddr) -> Option<AddressRange> {
        self.ranges.lock().iter().find(|r| r.base == base).copied()
    }

    /// Allocated ranges whose frames the pool's owner must release
    pub fn backed_ranges(&self) -> Vec<AddressRange> {
        self.ranges
            .lock()
            .iter()
            .filter(|r| r.used && r.flags.contains(RangeFlags::BACKED))
            .copied()
            .collect()
    }

    /// Total pages currently allocated
    pub fn used_pages(&self) -> usize {
        self.ranges
            .lock()
            .iter()
            .filter(|r| r.used)
            .map(|r| r.pages)
            .sum()
    }

    /// Duplicate the bookkeeping (ranges, usage, flags) into a new pool.
    pub fn clone_shape(&self) -> RangePool {
        RangePool {
            ranges: Mutex::new(self.ranges.lock().clone()),
        }
    }

    /// Copy of the current range list, base-ordered.
    pub fn snapshot(&self) -> Vec<AddressRange> {
        self.ranges.lock().clone()
    }
}

impl Default for RangePool {
    fn default() -> Self {
        Self::new()
    }
}
