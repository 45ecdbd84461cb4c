//! Memory Management Subsystem
//!
//! Physical and virtual memory services:
//! - Physical frame pool (bitmap index + fast buffer)
//! - Per-process virtual address range pools
//! - Page-table construction and teardown
//!
//! # Address Space Layout
//!
//! ```text
//! Virtual Address Space (48-bit canonical):
//!
//! 0xFFFF_FFFF_FFFF_FFFF ┌──────────────────────┐
//!                       │    Kernel Image      │  (-2GB)
//! 0xFFFF_FFFF_8000_0000 ├──────────────────────┤
//!                       │  Kernel Range Pool   │  (task kernel stacks)
//! 0xFFFF_E000_0000_0000 ├──────────────────────┤
//!                       │    (kernel half)     │
//! 0xFFFF_8000_0000_0000 ├──────────────────────┤
//!                       │    (non-canonical)   │
//! 0x0000_7FFF_FFFF_FFFF ├──────────────────────┤
//!                       │  User Range Pool     │  (per process)
//! 0x0000_0000_0040_0000 ├──────────────────────┤
//!                       │    (unmapped)        │
//! 0x0000_0000_0000_0000 └──────────────────────┘
//! ```

pub mod mapper;
pub mod page;
pub mod pmm;
pub mod range;

use crate::hal::Platform;
use crate::{KernelResult, PAGE_SIZE};
use spin::Once;

pub use mapper::{AddressSpace, Mapper};
pub use page::{PageFlags, PageTable, PageTableEntry, ENTRIES_PER_TABLE, KERNEL_SPLIT_INDEX};
pub use pmm::FramePool;
pub use range::{AddressRange, RangeFlags, RangePool};

/// Global frame pool
static FRAMES: Once<FramePool> = Once::new();

/// Kernel address space (the directory active at boot)
static KERNEL_SPACE: Once<AddressSpace> = Once::new();

/// Kernel virtual range pool (task kernel stacks)
static KERNEL_RANGES: Once<RangePool> = Once::new();

/// Initialize memory management from the bootloader's memory map.
///
/// Builds the frame pool, adopts the boot address space as the kernel
/// directory, populates its kernel half so later clones stay coherent,
/// and opens the kernel range pool.
pub fn init(platform: &'static dyn Platform, regions: &[MemoryRegion]) -> KernelResult<()> {
    let frames = FRAMES.call_once(|| FramePool::new(regions));
    log::info!(
        "memory: {} frames tracked, {} free",
        frames.total_frames(),
        frames.free_frames()
    );

    let kernel = KERNEL_SPACE.call_once(|| AddressSpace::new(platform.current_address_space()));
    Mapper::new(platform, frames).populate_kernel_entries(kernel);

    let ranges = KERNEL_RANGES.call_once(RangePool::new);
    ranges.initialize_range(
        VirtAddr::new(crate::KERNEL_RANGE_BASE),
        VirtAddr::new(crate::KERNEL_RANGE_END),
    )?;

    Ok(())
}

/// The global frame pool.
///
/// # Panics
/// Panics before [`init`]; that is a boot-ordering bug.
pub fn frames() -> &'static FramePool {
    FRAMES.get().expect("mm::frames called before mm::init")
}

/// The kernel address space.
pub fn kernel_space() -> &'static AddressSpace {
    KERNEL_SPACE
        .get()
        .expect("mm::kernel_space called before mm::init")
}

/// The kernel virtual range pool.
pub fn kernel_ranges() -> &'static RangePool {
    KERNEL_RANGES
        .get()
        .expect("mm::kernel_ranges called before mm::init")
}

/// Free physical frames right now (diagnostics surface).
pub fn free_frame_count() -> usize {
    FRAMES.get().map(FramePool::free_frames).unwrap_or(0)
}

/// A region of physical memory reported by the bootloader
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical start address
    pub start: u64,
    /// Size in bytes
    pub size: u64,
    /// Region type
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    /// End address (exclusive)
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Whether the region is free for allocation
    pub fn is_usable(&self) -> bool {
        self.kind == MemoryRegionKind::Usable
    }
}

/// Memory region types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Usable RAM
    Usable,
    /// Reserved by firmware or the boot environment
    Reserved,
    /// Occupied by the kernel image
    Kernel,
}

/// Physical address type (newtype for type safety)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align down to page boundary
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Align up to page boundary
    pub const fn align_up(self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    /// Check if aligned to page boundary
    pub const fn is_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }
}

/// Virtual address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create new virtual address in canonical form (sign-extend bit 47)
    pub const fn new(addr: u64) -> Self {
        let addr = if addr & (1 << 47) != 0 {
            addr | 0xFFFF_0000_0000_0000
        } else {
            addr & 0x0000_FFFF_FFFF_FFFF
        };
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Align down to page boundary
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Align up to page boundary
    pub const fn align_up(self) -> Self {
        Self::new((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    /// Check if aligned
    pub const fn is_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    /// Address `pages` whole pages above this one
    pub const fn add_pages(self, pages: usize) -> Self {
        Self::new(self.0 + (pages * PAGE_SIZE) as u64)
    }

    /// Get page table indices for this address
    pub fn page_table_indices(self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1FF) as usize,
            ((self.0 >> 30) & 0x1FF) as usize,
            ((self.0 >> 21) & 0x1FF) as usize,
            ((self.0 >> 12) & 0x1FF) as usize,
        ]
    }

    /// Check if this is a user-space address
    pub const fn is_user(self) -> bool {
        self.0 < crate::USER_SPACE_END
    }

    /// Check if this is a kernel-space address
    pub const fn is_kernel(self) -> bool {
        self.0 >= 0xFFFF_8000_0000_0000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_addr_alignment() {
        let addr = PhysAddr::new(0x10_0123);
        assert_eq!(addr.align_down().as_u64(), 0x10_0000);
        assert_eq!(addr.align_up().as_u64(), 0x10_1000);
        assert!(PhysAddr::new(0x10_0000).is_aligned());
        assert!(!addr.is_aligned());
    }

    #[test]
    fn virt_addr_is_canonicalized() {
        let upper = VirtAddr::new(0x0000_8000_0000_0000);
        assert_eq!(upper.as_u64(), 0xFFFF_8000_0000_0000);
        assert!(upper.is_kernel());
        assert!(VirtAddr::new(0x40_0000).is_user());
    }

    #[test]
    fn page_table_indices_split_the_address() {
        let addr = VirtAddr::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12));
        assert_eq!(addr.page_table_indices(), [1, 2, 3, 4]);
    }

    #[test]
    fn add_pages_steps_by_whole_pages() {
        let addr = VirtAddr::new(0x40_0000).add_pages(3);
        assert_eq!(addr.as_u64(), 0x40_3000);
    }
}
