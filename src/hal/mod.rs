//! Hardware Abstraction
//!
//! The narrow interface the resource core consumes from the architecture
//! layer of the embedding kernel. Everything instruction-set specific
//! (privilege transitions, TLB maintenance, the address-space root
//! register, the direct physical mapping) lives behind [`Platform`], so the
//! core itself stays architecture-neutral.

use crate::mm::{PhysAddr, VirtAddr};
use spin::Once;

#[cfg(test)]
pub mod mock;

/// Architecture services consumed by the resource core.
///
/// Implemented once by the embedding kernel and registered via [`register`]
/// during boot, before any other subsystem is initialized.
pub trait Platform: Send + Sync {
    /// Index of the core executing the caller
    fn core_id(&self) -> usize;

    /// Number of cores brought up at boot
    fn core_count(&self) -> usize;

    /// Disable interrupts, returning whether they were previously enabled
    fn disable_interrupts(&self) -> bool;

    /// Restore the interrupt state returned by [`Platform::disable_interrupts`]
    fn restore_interrupts(&self, was_enabled: bool);

    /// Invalidate any cached translation for a single virtual address
    fn invalidate_translation(&self, addr: VirtAddr);

    /// Read the active address-space root of the calling core
    fn current_address_space(&self) -> PhysAddr;

    /// Load a new address-space root on the calling core
    fn switch_address_space(&self, root: PhysAddr);

    /// Kernel-accessible window onto one physical frame.
    ///
    /// Page-table edits go through this window, which is why a directory
    /// that is not the active one can be edited exactly like the live one.
    /// The returned pointer is valid for [`crate::PAGE_SIZE`] bytes.
    fn frame_window(&self, frame: PhysAddr) -> *mut u8;
}

/// RAII guard that keeps interrupts disabled for its lifetime
pub struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    /// Disable interrupts until the guard is dropped
    pub fn new(platform: &'a dyn Platform) -> Self {
        let was_enabled = platform.disable_interrupts();
        Self {
            platform,
            was_enabled,
        }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.was_enabled);
    }
}

/// Registered platform implementation
static PLATFORM: Once<&'static dyn Platform> = Once::new();

/// Register the platform implementation.
///
/// Called exactly once during boot; later calls are ignored.
pub fn register(platform: &'static dyn Platform) {
    PLATFORM.call_once(|| platform);
}

/// The registered platform.
///
/// # Panics
/// Panics if called before [`register`]; that is a boot-ordering bug.
pub fn platform() -> &'static dyn Platform {
    *PLATFORM
        .get()
        .expect("hal::platform called before registration")
}
