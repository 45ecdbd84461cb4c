//! Address Space Mapper
//!
//! Builds and tears down per-process page-table hierarchies. All table
//! memory is reached through the platform's physical frame window, so a
//! directory that is not active on any core is edited through exactly the
//! same path as the live one; process construction never has to switch
//! the running core's address space.
//!
//! Concurrent edits to one address space are never safe; callers hold the
//! owning process lock around mapper calls.

use super::page::{PageFlags, PageTable, PageTableEntry, ENTRIES_PER_TABLE, KERNEL_SPLIT_INDEX};
use super::pmm::FramePool;
use super::{PhysAddr, VirtAddr};
use crate::hal::Platform;
use crate::PAGE_SIZE;

/// Handle to one page-table hierarchy, identified by its root frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysAddr,
}

impl AddressSpace {
    /// Wrap an existing root frame
    pub const fn new(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Physical address of the root table
    pub const fn root(&self) -> PhysAddr {
        self.root
    }
}

/// Page-table construction and teardown service
pub struct Mapper<'a> {
    platform: &'a dyn Platform,
    frames: &'a FramePool,
}

impl<'a> Mapper<'a> {
    /// Create a mapper over the given platform and frame pool
    pub fn new(platform: &'a dyn Platform, frames: &'a FramePool) -> Self {
        Self { platform, frames }
    }

    /// View a physical frame as a page table through the frame window.
    fn table_mut(&self, frame: PhysAddr) -> &'a mut PageTable {
        unsafe { &mut *(self.platform.frame_window(frame) as *mut PageTable) }
    }

    /// Allocate and zero one frame for table storage.
    fn zeroed_table_frame(&self) -> PhysAddr {
        let frame = self.frames.allocate_frame();
        unsafe { core::ptr::write_bytes(self.platform.frame_window(frame), 0, PAGE_SIZE) };
        frame
    }

    /// Allocate a fresh root, optionally cloning a kernel half into it.
    pub fn create_address_space(&self, kernel: Option<&AddressSpace>) -> AddressSpace {
        let space = AddressSpace::new(self.zeroed_table_frame());
        if let Some(kernel) = kernel {
            self.clone_kernel_space(kernel, &space);
        }
        space
    }

    /// Copy the kernel half of `from`'s root into `into`'s root.
    ///
    /// Both directories then share the same kernel second-level tables.
    pub fn clone_kernel_space(&self, from: &AddressSpace, into: &AddressSpace) {
        if from.root() == into.root() {
            return;
        }
        let src = self.table_mut(from.root());
        let dst = self.table_mut(into.root());
        for i in KERNEL_SPLIT_INDEX..ENTRIES_PER_TABLE {
            dst[i] = src[i];
        }
    }

    /// Fill every empty kernel-half root entry with a fresh second-level
    /// table.
    ///
    /// Done once at bootstrap: with the kernel half fully populated, any
    /// later kernel mapping lands in a shared lower-level table and is
    /// visible through every cloned directory.
    pub fn populate_kernel_entries(&self, space: &AddressSpace) {
        let root = self.table_mut(space.root());
        for i in KERNEL_SPLIT_INDEX..ENTRIES_PER_TABLE {
            if !root[i].is_present() {
                root[i] = PageTableEntry::new(self.zeroed_table_frame(), PageFlags::KERNEL_TABLE);
            }
        }
    }

    /// Map `virt` to `phys` in the given directory.
    ///
    /// Intermediate levels are created on demand (zeroed, carrying
    /// `table_flags`). When the leaf slot is already populated and
    /// `allow_override` is false the call returns `false` with no state
    /// modified, so callers can tell "already satisfied" apart from an
    /// error; bootstrap callers treat that as fatal since a collision
    /// there implies layout corruption.
    ///
    /// # Panics
    /// Panics when either address is not frame-aligned: an unaligned
    /// mapping is always a caller bug, never a runtime condition.
    pub fn map_page(
        &self,
        space: &AddressSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        table_flags: PageFlags,
        flags: PageFlags,
        allow_override: bool,
    ) -> bool {
        if !virt.is_aligned() || !phys.is_aligned() {
            panic!(
                "unaligned mapping {:#x} -> {:#x}",
                virt.as_u64(),
                phys.as_u64()
            );
        }

        let indices = virt.page_table_indices();
        let mut table = self.table_mut(space.root());
        for &index in &indices[..3] {
            if !table[index].is_present() {
                table[index] = PageTableEntry::new(self.zeroed_table_frame(), table_flags);
            }
            let next = table[index].addr();
            table = self.table_mut(next);
        }

        let leaf = indices[3];
        if table[leaf].is_present() {
            if !allow_override {
                return false;
            }
            table[leaf] = PageTableEntry::new(phys, flags);
            self.platform.invalidate_translation(virt);
            return true;
        }
        table[leaf] = PageTableEntry::new(phys, flags);
        true
    }

    /// Clear the leaf slot for `virt` and invalidate its cached
    /// translation. A no-op when the address was never mapped.
    pub fn unmap_page(&self, space: &AddressSpace, virt: VirtAddr) {
        let Some(table) = self.leaf_table(space, virt) else {
            return;
        };
        let leaf = virt.page_table_indices()[3];
        if table[leaf].is_present() {
            table[leaf].clear();
            self.platform.invalidate_translation(virt);
        }
    }

    /// Leaf entry for `virt`: physical frame plus flags, if mapped.
    pub fn entry(&self, space: &AddressSpace, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let table = self.leaf_table(space, virt)?;
        let entry = &table[virt.page_table_indices()[3]];
        if entry.is_present() {
            Some((entry.addr(), entry.flags()))
        } else {
            None
        }
    }

    /// Translate a virtual address to its physical counterpart.
    pub fn translate(&self, space: &AddressSpace, virt: VirtAddr) -> Option<PhysAddr> {
        let (frame, _) = self.entry(space, virt.align_down())?;
        let offset = virt.as_u64() & (PAGE_SIZE as u64 - 1);
        Some(PhysAddr::new(frame.as_u64() + offset))
    }

    /// Load this directory on the calling core.
    pub fn switch_address_space(&self, space: &AddressSpace) {
        self.platform.switch_address_space(space.root());
    }

    /// The directory active on the calling core.
    pub fn current_address_space(&self) -> AddressSpace {
        AddressSpace::new(self.platform.current_address_space())
    }

    /// Free every user-half table frame plus the root itself.
    ///
    /// Leaf data frames are not touched; the owner releases those through
    /// its range bookkeeping before tearing the tables down. The kernel
    /// half is shared with every other directory and stays untouched.
    pub fn release_user_space(&self, space: &AddressSpace) {
        let root = self.table_mut(space.root());
        for i in 0..KERNEL_SPLIT_INDEX {
            if !root[i].is_present() {
                continue;
            }
            let l3_frame = root[i].addr();
            let l3 = self.table_mut(l3_frame);
            for j in 0..ENTRIES_PER_TABLE {
                if !l3[j].is_present() {
                    continue;
                }
                let l2_frame = l3[j].addr();
                let l2 = self.table_mut(l2_frame);
                for k in 0..ENTRIES_PER_TABLE {
                    if l2[k].is_present() {
                        self.frames.free_frame(l2[k].addr());
                    }
                }
                self.frames.free_frame(l2_frame);
            }
            self.frames.free_frame(l3_frame);
            root[i].clear();
        }
        self.frames.free_frame(space.root());
    }

    /// Walk to the leaf table for `virt` without creating levels.
    fn leaf_table(&self, space: &AddressSpace, virt: VirtAddr) -> Option<&'a mut PageTable> {
        let indices = virt.page_table_indices();
        let mut table = self.table_mut(space.root());
        for &index in &indices[..3] {
            if !table[index].is_present() {
                return None;
            }
            let next = table[index].addr();
            table = self.table_mut(next);
        }
        Some(table)
    }
}
