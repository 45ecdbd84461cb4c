//! Shared test fixtures: a mock platform wired into a full environment.

use crate::hal::mock::MockPlatform;
use crate::hal::Platform;
use crate::mm::{FramePool, Mapper, RangePool, VirtAddr};
use crate::sys::process::{self, Process};
use crate::sys::scheduler::SchedulerTable;
use crate::sys::task::{Privilege, Task};
use crate::sys::KernelEnv;
use alloc::sync::Arc;

/// Build a standalone environment over a leaked mock platform.
pub(crate) fn test_env_with(frames: usize, cores: usize) -> (KernelEnv, &'static MockPlatform) {
    let platform = MockPlatform::leaked(frames, cores);
    let pool: &'static FramePool = Box::leak(Box::new(FramePool::new(&platform.regions())));
    let kernel_ranges: &'static RangePool = Box::leak(Box::new(RangePool::new()));
    kernel_ranges
        .initialize_range(
            VirtAddr::new(crate::KERNEL_RANGE_BASE),
            VirtAddr::new(crate::KERNEL_RANGE_END),
        )
        .unwrap();

    let mapper = Mapper::new(platform, pool);
    let kernel_space = mapper.create_address_space(None);
    mapper.populate_kernel_entries(&kernel_space);
    platform.switch_address_space(kernel_space.root());

    (
        KernelEnv {
            platform,
            frames: pool,
            kernel_space,
            kernel_ranges,
        },
        platform,
    )
}

pub(crate) fn test_env(frames: usize) -> (KernelEnv, &'static MockPlatform) {
    test_env_with(frames, 1)
}

/// A full scheduler setup: table with idle tasks, plus one user process.
pub(crate) struct Fixture {
    pub table: SchedulerTable,
    pub env: KernelEnv,
    pub platform: &'static MockPlatform,
    pub process: Arc<Process>,
}

pub(crate) fn fixture(cores: usize) -> Fixture {
    let (env, platform) = test_env_with(2048, cores);
    let idle_process = Process::create(&env).unwrap();
    let idle_tasks: Vec<Arc<Task>> = (0..cores)
        .map(|core| {
            let task = process::create_task(
                &env,
                &idle_process,
                VirtAddr::new(crate::KERNEL_VIRT_BASE),
                Privilege::Kernel,
            )
            .unwrap();
            task.set_identifier(&format!("idle:{}", core));
            task
        })
        .collect();
    let table = SchedulerTable::new(env, idle_tasks).unwrap();
    let process = Process::create(&env).unwrap();
    Fixture {
        table,
        env,
        platform,
        process,
    }
}

/// Spawn a kernel-privilege task in the fixture's process.
pub(crate) fn spawn(f: &Fixture, entry: u64) -> Arc<Task> {
    process::create_task(&f.env, &f.process, VirtAddr::new(entry), Privilege::Kernel).unwrap()
}
