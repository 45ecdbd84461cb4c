//! Per-Core Scheduler
//!
//! One scheduler instance per core, created once at boot and never
//! replaced. There is no global scheduler lock: each core owns its
//! run-queue lock, and cross-core operations (auto-assignment, lookups,
//! counting) lock one core at a time, never two, so no lock-ordering
//! deadlock can form.
//!
//! # Scheduling Algorithm
//!
//! 1. Round-robin over the core's list, starting after the previous task
//! 2. Blocked tasks stay in the list and are re-polled on every pass
//! 3. Dead tasks are reaped at the start of the pass
//! 4. While the core's held-lock counter is nonzero, the previous task
//!    is resumed unchanged — a critical section is still open
//! 5. The idle task runs when nothing else is runnable

use crate::sys::process::{self, ProcessId};
use crate::sys::task::{Context, Task, TaskId, TaskState};
use crate::sys::wait::WaitCx;
use crate::sys::KernelEnv;
use crate::{KernelError, KernelResult};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once};

/// Scheduler state for one core
struct CoreScheduler {
    /// Core index, fixed at boot
    core: usize,
    /// Run queue; holds every task assigned to this core
    run: Mutex<RunQueue>,
    /// Open critical sections on this core
    locks_held: AtomicU32,
}

/// The lists behind one core's run-queue lock
struct RunQueue {
    /// Every task assigned to this core, in rotation order
    tasks: VecDeque<Arc<Task>>,
    /// The task whose context is live on the core
    current: Option<Arc<Task>>,
    /// Fallback when nothing is runnable
    idle: Arc<Task>,
}

/// Read-only per-task snapshot for the diagnostics surface
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Task id
    pub id: TaskId,
    /// Owning process id
    pub process: ProcessId,
    /// Human-readable identifier, if set
    pub identifier: Option<String>,
    /// Pages allocated in the owning process's user region
    pub memory_pages: usize,
}

/// Boot-time-initialized, core-indexed scheduler table.
///
/// Entries are never replaced after construction. The table also owns the
/// scheduler clock: the embedding timer interrupt calls
/// [`SchedulerTable::timer_tick`] once per millisecond.
pub struct SchedulerTable {
    env: KernelEnv,
    cores: Vec<CoreScheduler>,
    ticks: AtomicU64,
}

impl SchedulerTable {
    /// Build the table, one scheduler and one idle task per core.
    pub fn new(env: KernelEnv, idle: Vec<Arc<Task>>) -> KernelResult<Self> {
        if idle.len() != env.platform.core_count() {
            return Err(KernelError::InvalidArgument);
        }
        let cores = idle
            .into_iter()
            .enumerate()
            .map(|(core, idle)| {
                idle.inner().lock().core = Some(core);
                CoreScheduler {
                    core,
                    run: Mutex::new(RunQueue {
                        tasks: VecDeque::new(),
                        current: None,
                        idle,
                    }),
                    locks_held: AtomicU32::new(0),
                }
            })
            .collect();
        Ok(Self {
            env,
            cores,
            ticks: AtomicU64::new(0),
        })
    }

    /// Number of per-core schedulers
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Scheduler clock, in ticks (one tick per millisecond)
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Advance the scheduler clock; called from the timer interrupt.
    pub fn timer_tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Pick the next task for the calling core.
    pub fn schedule(&self) -> Arc<Task> {
        self.schedule_core(self.env.platform.core_id())
    }

    fn schedule_core(&self, core: usize) -> Arc<Task> {
        let cs = &self.cores[core];
        let mut reaped: Vec<Arc<Task>> = Vec::new();

        let next = {
            let mut run = cs.run.lock();

            // A kernel critical section is open on this core; switching
            // away now could deadlock it. Resume the previous task.
            if cs.locks_held.load(Ordering::Acquire) > 0 {
                return run.current.clone().unwrap_or_else(|| run.idle.clone());
            }

            // Re-evaluate every blocked task's wait condition. The
            // condition is taken out and polled with no task lock held, so
            // it may inspect other tasks freely.
            let cx = WaitCx { now: self.now() };
            for task in run.tasks.iter() {
                let cond = {
                    let mut inner = task.inner().lock();
                    if inner.state != TaskState::Blocked {
                        continue;
                    }
                    inner.wait.take()
                };
                let Some(mut cond) = cond else {
                    let mut inner = task.inner().lock();
                    if inner.state == TaskState::Blocked {
                        inner.state = TaskState::Runnable;
                    }
                    continue;
                };
                let ready = cond.poll(&cx);
                let mut inner = task.inner().lock();
                if inner.state == TaskState::Blocked {
                    if ready {
                        inner.state = TaskState::Runnable;
                    } else {
                        inner.wait = Some(cond);
                    }
                }
            }

            // Demote the previous task before reaping so a killed current
            // task leaves through the same path as everyone else.
            if let Some(current) = run.current.take() {
                let mut inner = current.inner().lock();
                if inner.state == TaskState::Running {
                    inner.state = TaskState::Runnable;
                }
            }

            run.tasks.retain(|task| {
                let dead = task.inner().lock().state == TaskState::Dead;
                if dead {
                    reaped.push(task.clone());
                }
                !dead
            });

            // Round-robin: rotate until a runnable task surfaces. The
            // previous task sits at the back, so the scan naturally starts
            // right after it.
            let mut picked = None;
            for _ in 0..run.tasks.len() {
                let Some(task) = run.tasks.pop_front() else {
                    break;
                };
                run.tasks.push_back(task.clone());
                if task.inner().lock().state == TaskState::Runnable {
                    picked = Some(task);
                    break;
                }
            }

            let next = match picked {
                Some(task) => task,
                None => {
                    log::trace!("core {}: nothing runnable, idling", cs.core);
                    run.idle.clone()
                }
            };
            next.inner().lock().state = TaskState::Running;
            run.current = Some(next.clone());
            next
        };

        for task in reaped {
            log::debug!("core {}: reaped task {:?}", core, task.id());
            process::task_removed(&self.env, &task);
        }
        next
    }

    /// Store the interrupted context into the current task and return the
    /// next task to resume — both halves of a context switch in one call
    /// from the interrupt path.
    pub fn save(&self, state: &Context) -> Arc<Task> {
        let core = self.env.platform.core_id();
        let current = self.cores[core].run.lock().current.clone();
        if let Some(current) = current {
            current.inner().lock().context = *state;
        }
        self.schedule_core(core)
    }

    /// Place a task on a core's list.
    ///
    /// With no pinned target, the core with the lowest instantaneous load
    /// wins — balancing happens at assignment time, not by migration.
    pub fn assign(&self, task: &Arc<Task>, target: Option<usize>) -> KernelResult<usize> {
        if task.inner().lock().core.is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let core = match target {
            Some(core) if core < self.cores.len() => core,
            Some(_) => return Err(KernelError::InvalidArgument),
            None => {
                let mut best = 0;
                let mut best_load = usize::MAX;
                for core in 0..self.cores.len() {
                    let load = self.load(core);
                    if load < best_load {
                        best_load = load;
                        best = core;
                    }
                }
                best
            }
        };
        {
            let mut run = self.cores[core].run.lock();
            run.tasks.push_back(task.clone());
            task.inner().lock().core = Some(core);
        }
        log::trace!("assigned task {:?} to core {}", task.id(), core);
        Ok(core)
    }

    /// Runnable-task count of one core, the load metric for auto
    /// assignment.
    fn load(&self, core: usize) -> usize {
        let run = self.cores[core].run.lock();
        run.tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.inner().lock().state,
                    TaskState::Runnable | TaskState::Running
                )
            })
            .count()
    }

    /// Force a task to `Dead`, safe to call from any core.
    ///
    /// A task not currently executing is removed (and its resources
    /// released) immediately; a running victim is only marked and its own
    /// core reaps it on the next pass, so resources are never released
    /// while the task might still be on a CPU.
    pub fn kill(&self, id: TaskId) -> KernelResult<()> {
        for cs in &self.cores {
            let mut removed = None;
            let mut found = false;
            {
                let mut run = cs.run.lock();
                if let Some(pos) = run.tasks.iter().position(|t| t.id() == id) {
                    found = true;
                    let task = run.tasks[pos].clone();
                    let is_current = run
                        .current
                        .as_ref()
                        .map_or(false, |c| Arc::ptr_eq(c, &task));
                    {
                        let mut inner = task.inner().lock();
                        inner.state = TaskState::Dead;
                        inner.wait = None;
                    }
                    if !is_current {
                        removed = run.tasks.remove(pos);
                    }
                }
            }
            if found {
                match removed {
                    Some(task) => {
                        process::task_removed(&self.env, &task);
                        log::debug!("killed task {:?}", id);
                    }
                    None => {
                        log::debug!("killed running task {:?}; owner core reaps it", id);
                    }
                }
                return Ok(());
            }
        }
        Err(KernelError::NotFound)
    }

    /// Find a task by id across all cores, one lock at a time.
    pub fn task_by_id(&self, id: TaskId) -> Option<Arc<Task>> {
        for cs in &self.cores {
            let run = cs.run.lock();
            if let Some(task) = run.tasks.iter().find(|t| t.id() == id) {
                return Some(task.clone());
            }
        }
        None
    }

    /// Tasks across all cores (diagnostics surface)
    pub fn task_count(&self) -> usize {
        self.cores.iter().map(|cs| cs.run.lock().tasks.len()).sum()
    }

    /// Per-task snapshot (diagnostics surface)
    pub fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        let task = self.task_by_id(id)?;
        Some(TaskInfo {
            id: task.id(),
            process: task.process().id(),
            identifier: task.identifier(),
            memory_pages: task.process().memory_pages(),
        })
    }

    /// Open a critical section: interrupts off, held-lock counter up.
    ///
    /// While any guard is live on a core, that core's scheduler resumes
    /// the previous task instead of switching.
    pub fn critical_section(&self) -> CriticalGuard<'_> {
        let was_enabled = self.env.platform.disable_interrupts();
        let core = self.env.platform.core_id();
        self.cores[core].locks_held.fetch_add(1, Ordering::AcqRel);
        CriticalGuard {
            table: self,
            core,
            was_enabled,
        }
    }

    /// Open critical sections on a core
    pub fn locks_held(&self, core: usize) -> u32 {
        self.cores[core].locks_held.load(Ordering::Acquire)
    }
}

/// RAII critical section; see [`SchedulerTable::critical_section`]
pub struct CriticalGuard<'a> {
    table: &'a SchedulerTable,
    core: usize,
    was_enabled: bool,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.table.cores[self.core]
            .locks_held
            .fetch_sub(1, Ordering::AcqRel);
        self.table.env.platform.restore_interrupts(self.was_enabled);
    }
}

/// Global scheduler table
static SCHEDULER: Once<SchedulerTable> = Once::new();

/// Install the boot-time scheduler table. Later calls are ignored.
pub fn init(table: SchedulerTable) {
    SCHEDULER.call_once(|| table);
}

/// The global scheduler table.
///
/// # Panics
/// Panics before [`init`]; that is a boot-ordering bug.
pub fn table() -> &'static SchedulerTable {
    SCHEDULER
        .get()
        .expect("scheduler::table called before init")
}

/// Pick the next task for the calling core
pub fn schedule() -> Arc<Task> {
    table().schedule()
}

/// Store the interrupted context and pick the next task
pub fn save(state: &Context) -> Arc<Task> {
    table().save(state)
}

/// Place a task on a core's list
pub fn assign(task: &Arc<Task>, target: Option<usize>) -> KernelResult<usize> {
    table().assign(task, target)
}

/// Force a task to `Dead`, from any core
pub fn kill(id: TaskId) -> KernelResult<()> {
    table().kill(id)
}

/// Advance the scheduler clock; called from the timer interrupt
pub fn timer_tick() -> u64 {
    table().timer_tick()
}
