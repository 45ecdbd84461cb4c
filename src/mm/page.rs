//! Page Table Primitives
//!
//! The pluggable table encoding driven by the mapper: four levels of
//! 512-entry tables, one `u64` per entry. Nothing here touches hardware;
//! translation-cache maintenance and the root register are behind
//! [`crate::hal::Platform`].

use super::PhysAddr;
use bitflags::bitflags;

/// Number of entries per page table
pub const ENTRIES_PER_TABLE: usize = 512;

/// First root-table index belonging to the kernel half of the address space
pub const KERNEL_SPLIT_INDEX: usize = 256;

/// Mask selecting the frame address bits of an entry
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Entry is present
        const PRESENT = 1 << 0;
        /// Page is writable
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching
        const NO_CACHE = 1 << 4;
        /// Page has been accessed
        const ACCESSED = 1 << 5;
        /// Page has been written to
        const DIRTY = 1 << 6;
        /// Global (survives an address-space switch)
        const GLOBAL = 1 << 8;
        /// No execute
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Intermediate-table flags for kernel mappings
    pub const KERNEL_TABLE: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Intermediate-table flags for user mappings
    pub const USER_TABLE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Kernel code flags (read-only, executable)
    pub const KERNEL_CODE: Self = Self::PRESENT.union(Self::GLOBAL);

    /// Kernel data flags (read-write, no execute)
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::GLOBAL)
        .union(Self::NO_EXECUTE);

    /// User code flags
    pub const USER_CODE: Self = Self::PRESENT.union(Self::USER);

    /// User data flags
    pub const USER_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::NO_EXECUTE);
}

/// Page table entry
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create empty entry
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create entry with address and flags
    pub fn new(addr: PhysAddr, flags: PageFlags) -> Self {
        Self((addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Get flags
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Get physical address
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Check if entry is present
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// Check if entry is unused
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Clear entry
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &format_args!("{:#x}", self.addr().as_u64()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// Page table (512 entries)
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create empty page table
    pub const fn new() -> Self {
        const EMPTY: PageTableEntry = PageTableEntry::empty();
        Self {
            entries: [EMPTY; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_addr_and_flags() {
        let entry = PageTableEntry::new(PhysAddr::new(0x20_3000), PageFlags::USER_DATA);
        assert_eq!(entry.addr().as_u64(), 0x20_3000);
        assert_eq!(entry.flags(), PageFlags::USER_DATA);
        assert!(entry.is_present());
    }

    #[test]
    fn clear_makes_entry_unused() {
        let mut entry = PageTableEntry::new(PhysAddr::new(0x1000), PageFlags::KERNEL_DATA);
        entry.clear();
        assert!(entry.is_unused());
        assert!(!entry.is_present());
    }
}
