//! Nucleus: Resource Core for a Multi-Core Microkernel
//!
//! The subsystems every other kernel facility is built on:
//! - Physical frame allocation (bitmap + fast buffer)
//! - Per-process virtual address range allocation
//! - Page-table construction and teardown
//! - Task/process lifecycle and per-core scheduling
//! - Predicate-based blocking and syscall delegation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 External Collaborators                      │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐│
//! │  │   VFS    │ │   IPC    │ │   ELF    │ │  Syscall Entry   ││
//! │  │          │ │Transport │ │  Loader  │ │      Path        ││
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────────┬─────────┘│
//! │       │ wait_for   │            │ create/map      │ delegate │
//! │       ▼            ▼            ▼                 ▼          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Resource Core                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Per-Core    │  │  Wait/Block  │  │    Syscall       │   │
//! │  │  Schedulers  │  │  Subsystem   │  │   Delegation     │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Frame Pool  │  │ Range Pools  │  │  Address Space   │   │
//! │  │  (physical)  │  │  (virtual)   │  │     Mapper       │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │         Hardware Abstraction (`hal::Platform`)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The crate is linked into a kernel binary that supplies the boot
//! environment: entry point, panic handler, heap, interrupt stubs, and a
//! [`hal::Platform`] implementation for the target architecture.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod hal;
pub mod mm;
pub mod sys;

#[cfg(test)]
mod test_support;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Kernel virtual base address
pub const KERNEL_VIRT_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Exclusive upper bound of the user half of the address space
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Base of the per-process user allocation region
pub const USER_RANGE_BASE: u64 = 0x0000_0000_0040_0000;

/// Exclusive end of the per-process user allocation region
pub const USER_RANGE_END: u64 = 0x0000_7FFF_FFFF_F000;

/// Base of the kernel virtual range pool (task kernel stacks)
pub const KERNEL_RANGE_BASE: u64 = 0xFFFF_E000_0000_0000;

/// Exclusive end of the kernel virtual range pool
pub const KERNEL_RANGE_END: u64 = 0xFFFF_E000_4000_0000;

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types.
///
/// Physical memory exhaustion has no variant here: a kernel that cannot
/// allocate a frame for a required structure cannot continue, so that
/// path panics instead of propagating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No virtual address range large enough
    AddressSpaceExhausted,
    /// Resource not found
    NotFound,
    /// Resource already exists
    AlreadyExists,
    /// Invalid argument
    InvalidArgument,
}
