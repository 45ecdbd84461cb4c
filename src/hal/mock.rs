//! Test platform backed by an in-process memory arena.

use super::Platform;
use crate::mm::{MemoryRegion, MemoryRegionKind, PhysAddr, VirtAddr};
use crate::PAGE_SIZE;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

/// One page of arena storage, aligned so page-table views are well formed.
#[repr(C, align(4096))]
#[derive(Clone)]
struct PageBuf([u8; PAGE_SIZE]);

/// Platform double: physical memory is a heap arena, the rest is recorded
/// state the tests can inspect and steer.
pub struct MockPlatform {
    arena: UnsafeCell<Box<[PageBuf]>>,
    base: u64,
    frames: usize,
    cores: usize,
    core_id: AtomicUsize,
    current_root: AtomicU64,
    irq_enabled: AtomicBool,
    invalidations: Mutex<Vec<u64>>,
}

// SAFETY: the arena is only reached through raw pointers handed out by
// `frame_window`; tests are responsible for not aliasing the same frame,
// mirroring the contract real page-table memory has.
unsafe impl Sync for MockPlatform {}
unsafe impl Send for MockPlatform {}

impl MockPlatform {
    /// Default physical base of the arena.
    pub const BASE: u64 = 0x0010_0000;

    /// Single-core platform over an arena of `frames` pages.
    pub fn new(frames: usize) -> Self {
        Self::with_cores(frames, 1)
    }

    /// Platform with `cores` cores over an arena of `frames` pages.
    pub fn with_cores(frames: usize, cores: usize) -> Self {
        let arena = vec![PageBuf([0; PAGE_SIZE]); frames].into_boxed_slice();
        Self {
            arena: UnsafeCell::new(arena),
            base: Self::BASE,
            frames,
            cores,
            core_id: AtomicUsize::new(0),
            current_root: AtomicU64::new(0),
            irq_enabled: AtomicBool::new(true),
            invalidations: Mutex::new(Vec::new()),
        }
    }

    /// Leak an instance so components demanding `'static` can borrow it.
    pub fn leaked(frames: usize, cores: usize) -> &'static Self {
        Box::leak(Box::new(Self::with_cores(frames, cores)))
    }

    /// The memory map a bootloader would have handed over for the arena.
    pub fn regions(&self) -> [MemoryRegion; 1] {
        [MemoryRegion {
            start: self.base,
            size: (self.frames * PAGE_SIZE) as u64,
            kind: MemoryRegionKind::Usable,
        }]
    }

    /// Steer which core the "caller" appears to run on.
    pub fn set_core(&self, id: usize) {
        assert!(id < self.cores);
        self.core_id.store(id, Ordering::SeqCst);
    }

    /// Addresses passed to `invalidate_translation` so far.
    pub fn invalidated(&self) -> Vec<u64> {
        self.invalidations.lock().clone()
    }
}

impl Platform for MockPlatform {
    fn core_id(&self) -> usize {
        self.core_id.load(Ordering::SeqCst)
    }

    fn core_count(&self) -> usize {
        self.cores
    }

    fn disable_interrupts(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::SeqCst)
    }

    fn restore_interrupts(&self, was_enabled: bool) {
        self.irq_enabled.store(was_enabled, Ordering::SeqCst);
    }

    fn invalidate_translation(&self, addr: VirtAddr) {
        self.invalidations.lock().push(addr.as_u64());
    }

    fn current_address_space(&self) -> PhysAddr {
        PhysAddr::new(self.current_root.load(Ordering::SeqCst))
    }

    fn switch_address_space(&self, root: PhysAddr) {
        self.current_root.store(root.as_u64(), Ordering::SeqCst);
    }

    fn frame_window(&self, frame: PhysAddr) -> *mut u8 {
        let addr = frame.as_u64();
        assert!(
            addr >= self.base && addr < self.base + (self.frames * PAGE_SIZE) as u64,
            "frame {:#x} outside the mock arena",
            addr
        );
        let index = ((addr - self.base) as usize) / PAGE_SIZE;
        unsafe { (*self.arena.get())[index].0.as_mut_ptr() }
    }
}
