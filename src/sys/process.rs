//! Process Model
//!
//! A process groups tasks sharing one address space: a page-table root
//! with the kernel half cloned in, an owned range pool over the user
//! region, a task list, and loader-facing descriptors (TLS master copy,
//! image bounds). A process is destroyed only after its last task has
//! been reaped from every scheduler list.

use crate::mm::{AddressSpace, PageFlags, RangeFlags, RangePool, VirtAddr};
use crate::sys::task::{self, Context, Privilege, StackBinding, Task};
use crate::sys::KernelEnv;
use crate::{KernelError, KernelResult, PAGE_SIZE, USER_RANGE_BASE, USER_RANGE_END};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// Process ID type
pub type ProcessId = u32;

/// Kernel stack length per task, in pages (16 KB)
pub const KERNEL_STACK_PAGES: usize = 4;

/// User stack length per task, in pages (64 KB)
pub const USER_STACK_PAGES: usize = 16;

/// Next unassigned process id
static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);

fn next_process_id() -> ProcessId {
    NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed)
}

/// Thread-local-storage master copy, installed by the loader
#[derive(Debug, Clone, Copy)]
pub struct TlsMaster {
    /// Start of the master image
    pub base: VirtAddr,
    /// Image size in bytes
    pub size: usize,
    /// Required alignment
    pub alignment: usize,
}

/// Bounds of the loaded program image
#[derive(Debug, Clone, Copy)]
pub struct ImageBounds {
    /// First mapped byte
    pub start: VirtAddr,
    /// One past the last mapped byte
    pub end: VirtAddr,
}

/// Mutable process state, guarded by the process lock
pub struct ProcessInner {
    /// The task `fork` may be called on
    pub main: Option<Arc<Task>>,
    /// All live member tasks
    pub tasks: Vec<Arc<Task>>,
    /// TLS master copy descriptor
    pub tls: Option<TlsMaster>,
    /// Program image bounds
    pub image: Option<ImageBounds>,
    /// Set once teardown has run
    pub dead: bool,
}

/// A group of tasks sharing one address space
pub struct Process {
    id: ProcessId,
    space: AddressSpace,
    ranges: RangePool,
    inner: Mutex<ProcessInner>,
}

impl Process {
    /// Create a process with no tasks.
    ///
    /// Allocates a fresh page-table root, clones the kernel half into it
    /// (every process must see the kernel), and opens an empty range pool
    /// over the user region.
    pub fn create(env: &KernelEnv) -> KernelResult<Arc<Self>> {
        let mapper = env.mapper();
        let space = mapper.create_address_space(Some(&env.kernel_space));

        let ranges = RangePool::new();
        ranges.initialize_range(
            VirtAddr::new(USER_RANGE_BASE),
            VirtAddr::new(USER_RANGE_END),
        )?;

        let process = Arc::new(Self {
            id: next_process_id(),
            space,
            ranges,
            inner: Mutex::new(ProcessInner {
                main: None,
                tasks: Vec::new(),
                tls: None,
                image: None,
                dead: false,
            }),
        });
        log::debug!(
            "created process {} (root {:#x})",
            process.id,
            space.root().as_u64()
        );
        Ok(process)
    }

    /// Process id
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The process's page-table root
    pub fn space(&self) -> AddressSpace {
        self.space
    }

    /// The process's user range pool
    pub fn ranges(&self) -> &RangePool {
        &self.ranges
    }

    /// Guarded mutable state
    pub fn inner(&self) -> &Mutex<ProcessInner> {
        &self.inner
    }

    /// Install the TLS master copy descriptor (loader surface)
    pub fn set_tls(&self, tls: TlsMaster) {
        self.inner.lock().tls = Some(tls);
    }

    /// Record the program image bounds (loader surface)
    pub fn set_image(&self, image: ImageBounds) {
        self.inner.lock().image = Some(image);
    }

    /// Pages currently allocated in the user region (diagnostics surface)
    pub fn memory_pages(&self) -> usize {
        self.ranges.used_pages()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("root", &self.space.root())
            .finish()
    }
}

/// Allocate and map one kernel stack.
fn allocate_kernel_stack(env: &KernelEnv) -> KernelResult<StackBinding> {
    let mapper = env.mapper();
    let base = env.kernel_ranges.allocate(KERNEL_STACK_PAGES, RangeFlags::BACKED)?;
    for page in 0..KERNEL_STACK_PAGES {
        let virt = base.add_pages(page);
        let frame = env.frames.allocate_frame();
        if !mapper.map_page(
            &env.kernel_space,
            virt,
            frame,
            PageFlags::KERNEL_TABLE,
            PageFlags::KERNEL_DATA,
            false,
        ) {
            log::error!("kernel stack collision at {:#x}", virt.as_u64());
            return Err(KernelError::AlreadyExists);
        }
    }
    Ok(StackBinding {
        base,
        pages: KERNEL_STACK_PAGES,
    })
}

/// Create a task that will begin execution at `entry`.
///
/// Stacks come from the range pool + frame pool + mapper triad. The task
/// is linked into the process but into no scheduler list; assignment to a
/// core is a separate, explicit step so callers can pick one.
pub fn create_task(
    env: &KernelEnv,
    process: &Arc<Process>,
    entry: VirtAddr,
    privilege: Privilege,
) -> KernelResult<Arc<Task>> {
    let mapper = env.mapper();
    let kernel_stack = allocate_kernel_stack(env)?;

    let user_stack = match privilege {
        Privilege::Kernel => None,
        Privilege::User => {
            let base = match process.ranges.allocate(USER_STACK_PAGES, RangeFlags::BACKED) {
                Ok(base) => base,
                Err(err) => {
                    // The caller may retry; hand the kernel stack back.
                    release_backed_range(env, &env.kernel_space, env.kernel_ranges, kernel_stack.base);
                    return Err(err);
                }
            };
            for page in 0..USER_STACK_PAGES {
                let virt = base.add_pages(page);
                let frame = env.frames.allocate_frame();
                if !mapper.map_page(
                    &process.space,
                    virt,
                    frame,
                    PageFlags::USER_TABLE,
                    PageFlags::USER_DATA,
                    false,
                ) {
                    log::error!("user stack collision at {:#x}", virt.as_u64());
                    release_backed_range(env, &process.space, &process.ranges, base);
                    release_backed_range(env, &env.kernel_space, env.kernel_ranges, kernel_stack.base);
                    return Err(KernelError::AlreadyExists);
                }
            }
            Some(StackBinding {
                base,
                pages: USER_STACK_PAGES,
            })
        }
    };

    let stack_top = user_stack
        .as_ref()
        .map(StackBinding::top)
        .unwrap_or_else(|| kernel_stack.top());
    let context = Context::at_entry(entry, stack_top);

    let task = Task::new(
        task::next_task_id(),
        process.clone(),
        privilege,
        context,
        Some(kernel_stack),
        user_stack,
    );

    {
        let mut inner = process.inner.lock();
        inner.tasks.push(task.clone());
        if inner.main.is_none() {
            inner.main = Some(task.clone());
        }
    }

    log::debug!(
        "created task {:?} in process {} (entry {:#x})",
        task.id(),
        process.id,
        entry.as_u64()
    );
    Ok(task)
}

/// Duplicate a process from its main task.
///
/// Clones the range bookkeeping, copies every mapped page of the backed
/// ranges into fresh frames, and produces a new process whose main task
/// resumes from the source task's saved context.
pub fn fork(env: &KernelEnv, source: &Arc<Task>) -> KernelResult<(Arc<Process>, Arc<Task>)> {
    let parent = source.process().clone();
    {
        let inner = parent.inner.lock();
        let is_main = inner.main.as_ref().map_or(false, |m| m.id() == source.id());
        if !is_main {
            log::warn!("fork: task {:?} is not its process's main task", source.id());
            return Err(KernelError::InvalidArgument);
        }
    }

    let mapper = env.mapper();
    let space = mapper.create_address_space(Some(&env.kernel_space));
    let ranges = parent.ranges.clone_shape();

    for range in parent.ranges.backed_ranges() {
        for page in 0..range.pages {
            let virt = range.base.add_pages(page);
            let Some((src_frame, flags)) = mapper.entry(&parent.space, virt) else {
                continue;
            };
            let dst_frame = env.frames.allocate_frame();
            unsafe {
                core::ptr::copy_nonoverlapping(
                    env.platform.frame_window(src_frame),
                    env.platform.frame_window(dst_frame),
                    PAGE_SIZE,
                );
            }
            mapper.map_page(&space, virt, dst_frame, PageFlags::USER_TABLE, flags, false);
        }
    }

    let (tls, image) = {
        let inner = parent.inner.lock();
        (inner.tls, inner.image)
    };
    let child = Arc::new(Process {
        id: next_process_id(),
        space,
        ranges,
        inner: Mutex::new(ProcessInner {
            main: None,
            tasks: Vec::new(),
            tls,
            image,
            dead: false,
        }),
    });

    // The child's main task resumes from the parent's saved context on a
    // stack of its own: the user stack binding points at the copied pages,
    // the kernel stack is fresh.
    let kernel_stack = match allocate_kernel_stack(env) {
        Ok(stack) => stack,
        Err(err) => {
            destroy(env, &child);
            return Err(err);
        }
    };
    let (context, user_stack) = {
        let inner = source.inner().lock();
        (inner.context, inner.user_stack)
    };
    let task = Task::new(
        task::next_task_id(),
        child.clone(),
        source.privilege(),
        context,
        Some(kernel_stack),
        user_stack,
    );
    {
        let mut inner = child.inner.lock();
        inner.tasks.push(task.clone());
        inner.main = Some(task.clone());
    }

    log::info!(
        "forked process {} -> {} (task {:?})",
        parent.id,
        child.id,
        task.id()
    );
    Ok((child, task))
}

/// Release one backed range: unmap its pages, free their frames, then
/// return the range to its pool.
fn release_backed_range(env: &KernelEnv, space: &AddressSpace, pool: &RangePool, base: VirtAddr) {
    let Some(range) = pool.range_at(base) else {
        return;
    };
    if range.used && range.flags.contains(RangeFlags::BACKED) {
        let mapper = env.mapper();
        for page in 0..range.pages {
            let virt = range.base.add_pages(page);
            if let Some((frame, _)) = mapper.entry(space, virt) {
                mapper.unmap_page(space, virt);
                env.frames.free_frame(frame);
            }
        }
    }
    let _ = pool.free(base);
}

/// Called by the scheduler once a dead task has left its core's list.
///
/// Frees the task's stacks, unlinks it from its process, and tears the
/// process down when this was the last member.
pub(crate) fn task_removed(env: &KernelEnv, task: &Arc<Task>) {
    let process = task.process().clone();

    let (kernel_stack, user_stack) = {
        let mut inner = task.inner().lock();
        inner.core = None;
        inner.wait = None;
        (inner.kernel_stack.take(), inner.user_stack.take())
    };
    if let Some(stack) = kernel_stack {
        release_backed_range(env, &env.kernel_space, env.kernel_ranges, stack.base);
    }
    if let Some(stack) = user_stack {
        release_backed_range(env, &process.space, &process.ranges, stack.base);
    }

    let last = {
        let mut inner = process.inner.lock();
        inner.tasks.retain(|t| t.id() != task.id());
        if inner
            .main
            .as_ref()
            .map_or(false, |m| m.id() == task.id())
        {
            inner.main = None;
        }
        inner.tasks.is_empty() && !inner.dead
    };
    if last {
        destroy(env, &process);
    }
}

/// Tear a process down: release every remaining backed range, then the
/// user half of its page tables and the root itself.
fn destroy(env: &KernelEnv, process: &Arc<Process>) {
    for range in process.ranges.backed_ranges() {
        release_backed_range(env, &process.space, &process.ranges, range.base);
    }
    env.mapper().release_user_space(&process.space);
    process.inner.lock().dead = true;
    log::debug!("destroyed process {}", process.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_env;

    #[test]
    fn create_process_clones_the_kernel_half() {
        let (env, _) = test_env(1024);
        let process = Process::create(&env).unwrap();
        assert_ne!(process.space().root(), env.kernel_space.root());

        let mapper = env.mapper();
        // Kernel mappings made after the clone are visible in the process.
        let virt = VirtAddr::new(crate::KERNEL_RANGE_BASE);
        let frame = env.frames.allocate_frame();
        assert!(mapper.map_page(
            &env.kernel_space,
            virt,
            frame,
            PageFlags::KERNEL_TABLE,
            PageFlags::KERNEL_DATA,
            false
        ));
        assert_eq!(mapper.translate(&process.space(), virt), Some(frame));
    }

    #[test]
    fn create_task_builds_stacks_and_links() {
        let (env, _) = test_env(1024);
        let process = Process::create(&env).unwrap();
        let task = create_task(&env, &process, VirtAddr::new(0x40_0000), Privilege::User).unwrap();

        let inner = task.inner().lock();
        let kernel_stack = inner.kernel_stack.unwrap();
        let user_stack = inner.user_stack.unwrap();
        assert_eq!(inner.context.ip, 0x40_0000);
        assert_eq!(inner.context.sp, user_stack.top().as_u64());
        assert!(inner.core.is_none());
        drop(inner);

        let mapper = env.mapper();
        // Both stacks are fully mapped.
        for page in 0..KERNEL_STACK_PAGES {
            assert!(mapper
                .translate(&env.kernel_space, kernel_stack.base.add_pages(page))
                .is_some());
        }
        for page in 0..USER_STACK_PAGES {
            assert!(mapper
                .translate(&process.space(), user_stack.base.add_pages(page))
                .is_some());
        }

        let pin = process.inner().lock();
        assert_eq!(pin.tasks.len(), 1);
        assert_eq!(pin.main.as_ref().unwrap().id(), task.id());
    }

    #[test]
    fn kernel_tasks_run_on_their_kernel_stack() {
        let (env, _) = test_env(1024);
        let process = Process::create(&env).unwrap();
        let task =
            create_task(&env, &process, VirtAddr::new(0x40_0000), Privilege::Kernel).unwrap();
        let inner = task.inner().lock();
        assert!(inner.user_stack.is_none());
        assert_eq!(inner.context.sp, inner.kernel_stack.unwrap().top().as_u64());
    }

    #[test]
    fn fork_copies_backed_memory() {
        let (env, _) = test_env(1024);
        let parent = Process::create(&env).unwrap();
        let main = create_task(&env, &parent, VirtAddr::new(0x40_0000), Privilege::User).unwrap();

        // Scribble into the bottom page of the parent's user stack.
        let stack = main.inner().lock().user_stack.unwrap();
        let mapper = env.mapper();
        let parent_frame = mapper.translate(&parent.space(), stack.base).unwrap();
        unsafe { *env.platform.frame_window(parent_frame) = 0xAB };

        let (child, child_main) = fork(&env, &main).unwrap();
        let child_frame = mapper.translate(&child.space(), stack.base).unwrap();
        assert_ne!(parent_frame, child_frame);
        unsafe {
            assert_eq!(*env.platform.frame_window(child_frame), 0xAB);
            // Copies diverge afterwards.
            *env.platform.frame_window(parent_frame) = 0xCD;
            assert_eq!(*env.platform.frame_window(child_frame), 0xAB);
        }

        assert_eq!(child.memory_pages(), parent.memory_pages());
        let inner = child_main.inner().lock();
        assert_eq!(inner.context.ip, 0x40_0000);
        assert_eq!(inner.user_stack.unwrap().base, stack.base);
    }

    #[test]
    fn fork_rejects_non_main_tasks() {
        let (env, _) = test_env(1024);
        let process = Process::create(&env).unwrap();
        let _main = create_task(&env, &process, VirtAddr::new(0x40_0000), Privilege::User).unwrap();
        let second =
            create_task(&env, &process, VirtAddr::new(0x41_0000), Privilege::User).unwrap();
        assert_eq!(
            fork(&env, &second).map(|_| ()),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn reaping_the_last_task_frees_everything() {
        let (env, _) = test_env(1024);

        // Warm up the long-lived kernel-side stack tables so the balance
        // below is exact.
        let warm = Process::create(&env).unwrap();
        let warm_task =
            create_task(&env, &warm, VirtAddr::new(0x40_0000), Privilege::User).unwrap();
        task_removed(&env, &warm_task);

        let before = env.frames.free_frames();
        let kernel_before = env.kernel_ranges.used_pages();

        let process = Process::create(&env).unwrap();
        let task = create_task(&env, &process, VirtAddr::new(0x40_0000), Privilege::User).unwrap();
        task_removed(&env, &task);

        assert!(process.inner().lock().dead);
        assert_eq!(process.inner().lock().tasks.len(), 0);
        assert_eq!(env.frames.free_frames(), before);
        assert_eq!(env.kernel_ranges.used_pages(), kernel_before);
    }
}
