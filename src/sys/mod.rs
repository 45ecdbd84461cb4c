//! Task, Process and Scheduling Subsystem
//!
//! The execution half of the resource core: the task/process model,
//! per-core schedulers, the wait/block primitive, and the syscall
//! delegation bridge.

pub mod delegate;
pub mod process;
pub mod scheduler;
pub mod task;
pub mod wait;

use crate::hal::Platform;
use crate::mm::{self, AddressSpace, FramePool, Mapper, MemoryRegion, RangePool, VirtAddr};
use crate::KernelResult;
use alloc::format;
use alloc::vec::Vec;
use spin::Once;

pub use process::{Process, ProcessId};
pub use scheduler::{SchedulerTable, TaskInfo};
pub use task::{Context, Privilege, Task, TaskId, TaskState};

/// Shared references every resource-owning operation needs: the platform,
/// the frame pool, the kernel directory and the kernel range pool.
#[derive(Clone, Copy)]
pub struct KernelEnv {
    /// Architecture services
    pub platform: &'static dyn Platform,
    /// Physical frame pool
    pub frames: &'static FramePool,
    /// The kernel address space every process clones
    pub kernel_space: AddressSpace,
    /// Kernel virtual range pool (task kernel stacks)
    pub kernel_ranges: &'static RangePool,
}

impl KernelEnv {
    /// A mapper over this environment's platform and frame pool
    pub fn mapper(&self) -> Mapper<'static> {
        Mapper::new(self.platform, self.frames)
    }
}

/// Boot-time environment
static ENV: Once<KernelEnv> = Once::new();

/// Bring the resource core up.
///
/// Registers the platform, initializes memory management from the boot
/// memory map, creates the idle process with one idle task per core
/// (entered at `idle_entry`), and installs the scheduler table.
pub fn init(
    platform: &'static dyn Platform,
    regions: &[MemoryRegion],
    idle_entry: VirtAddr,
) -> KernelResult<()> {
    crate::hal::register(platform);
    mm::init(platform, regions)?;

    let env = *ENV.call_once(|| KernelEnv {
        platform,
        frames: mm::frames(),
        kernel_space: *mm::kernel_space(),
        kernel_ranges: mm::kernel_ranges(),
    });

    let idle_process = Process::create(&env)?;
    let mut idle_tasks = Vec::new();
    for core in 0..platform.core_count() {
        let task = process::create_task(&env, &idle_process, idle_entry, Privilege::Kernel)?;
        task.set_identifier(&format!("idle:{}", core));
        idle_tasks.push(task);
    }
    scheduler::init(SchedulerTable::new(env, idle_tasks)?);

    log::info!(
        "resource core up: {} cores, {} free frames",
        platform.core_count(),
        env.frames.free_frames()
    );
    Ok(())
}

/// The boot-time environment.
///
/// # Panics
/// Panics before [`init`]; that is a boot-ordering bug.
pub fn env() -> &'static KernelEnv {
    ENV.get().expect("sys::env called before sys::init")
}
