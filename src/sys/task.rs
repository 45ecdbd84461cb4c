//! Task Model
//!
//! A task is the unit of scheduling: saved CPU context, lifecycle state,
//! and a link back to its owning process. Tasks are `Arc`-shared — the
//! longest-living holders are the owning core's scheduler list and the
//! process's task list.

use crate::mm::VirtAddr;
use crate::sys::delegate::PendingSyscall;
use crate::sys::process::Process;
use crate::sys::wait::WaitCondition;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Task ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get raw value
    pub const fn value(&self) -> u64 {
        self.0
    }
}

/// Next unassigned task id, system-wide
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

/// Privilege level a task executes at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Kernel mode
    Kernel,
    /// User mode
    User,
}

/// Saved flags image with interrupts enabled
const FLAGS_INTERRUPTS_ENABLED: u64 = 1 << 9;

/// Saved CPU context for task switching.
///
/// The architecture layer of the embedding kernel performs the actual
/// register store/restore; this is the storage it reads and writes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// Callee-saved registers
    pub saved: [u64; 6],
    /// Instruction pointer
    pub ip: u64,
    /// Stack pointer
    pub sp: u64,
    /// Flags register image
    pub flags: u64,
}

impl Context {
    /// Initial context beginning execution at `entry` on `stack_top`
    pub fn at_entry(entry: VirtAddr, stack_top: VirtAddr) -> Self {
        Self {
            ip: entry.as_u64(),
            sp: stack_top.as_u64(),
            flags: FLAGS_INTERRUPTS_ENABLED,
            ..Default::default()
        }
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible for scheduling
    Runnable,
    /// Currently executing on some core
    Running,
    /// Waiting for its wait condition to become true
    Blocked,
    /// Terminal; reaped from its core's list at the next pass
    Dead,
}

/// One allocated stack: a virtual range plus its page count
#[derive(Debug, Clone, Copy)]
pub struct StackBinding {
    /// Lowest page of the stack
    pub base: VirtAddr,
    /// Stack length in pages
    pub pages: usize,
}

impl StackBinding {
    /// Initial stack pointer (exclusive top)
    pub fn top(&self) -> VirtAddr {
        self.base.add_pages(self.pages)
    }
}

/// Mutable task state, guarded by the task's lock.
///
/// Lock order: a core's run-queue lock may be held while taking this
/// lock, never the reverse.
pub struct TaskInner {
    /// Lifecycle state
    pub state: TaskState,
    /// Saved CPU context
    pub context: Context,
    /// Optional human-readable name
    pub identifier: Option<String>,
    /// Condition a blocked task is waiting on
    pub wait: Option<Box<dyn WaitCondition>>,
    /// In-flight delegated syscall, if any
    pub pending: Option<Arc<PendingSyscall>>,
    /// Core whose scheduler list holds this task
    pub core: Option<usize>,
    /// Kernel stack backing this task
    pub kernel_stack: Option<StackBinding>,
    /// User stack, for user-privilege tasks
    pub user_stack: Option<StackBinding>,
}

/// One schedulable execution context
pub struct Task {
    id: TaskId,
    process: Arc<Process>,
    privilege: Privilege,
    inner: Mutex<TaskInner>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        process: Arc<Process>,
        privilege: Privilege,
        context: Context,
        kernel_stack: Option<StackBinding>,
        user_stack: Option<StackBinding>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            process,
            privilege,
            inner: Mutex::new(TaskInner {
                state: TaskState::Runnable,
                context,
                identifier: None,
                wait: None,
                pending: None,
                core: None,
                kernel_stack,
                user_stack,
            }),
        })
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Owning process
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Privilege level
    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    /// Guarded mutable state
    pub fn inner(&self) -> &Mutex<TaskInner> {
        &self.inner
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Set the human-readable identifier
    pub fn set_identifier(&self, name: &str) {
        self.inner.lock().identifier = Some(String::from(name));
    }

    /// The human-readable identifier, if one was set
    pub fn identifier(&self) -> Option<String> {
        self.inner.lock().identifier.clone()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("process", &self.process.id())
            .field("privilege", &self.privilege)
            .field("state", &self.state())
            .finish()
    }
}
