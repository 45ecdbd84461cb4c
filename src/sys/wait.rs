//! Wait/Block Subsystem
//!
//! Generic blocking primitive: a task parks on a *wait condition* and the
//! scheduler re-polls every blocked task's condition on each pass,
//! promoting it back to runnable the first time the condition holds.
//! Unrelated kernel facilities (timers, IPC delivery, filesystem
//! completion) express "wake me when X" through a condition without the
//! scheduler knowing anything about X.
//!
//! Conditions are polled with no task lock held, so a condition may
//! inspect other tasks (see [`JoinCondition`]) without ordering hazards.

use crate::sys::scheduler::SchedulerTable;
use crate::sys::task::{Task, TaskId, TaskState};
use crate::{KernelError, KernelResult};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

/// Context handed to every condition poll.
///
/// `now` is the scheduler clock in ticks; one tick is one millisecond.
pub struct WaitCx {
    /// Current scheduler time, in ticks
    pub now: u64,
}

/// A reason a task is blocked.
///
/// `poll` returns `true` once the task may run again. Polling happens on
/// every scheduling pass of the core that owns the task, so conditions
/// must be cheap.
pub trait WaitCondition: Send {
    /// Re-evaluate the condition
    fn poll(&mut self, cx: &WaitCx) -> bool;
}

/// Wakes at an absolute tick deadline
pub struct SleepCondition {
    wake_at: u64,
}

impl SleepCondition {
    /// Wake once the scheduler clock reaches `wake_at`
    pub fn new(wake_at: u64) -> Self {
        Self { wake_at }
    }
}

impl WaitCondition for SleepCondition {
    fn poll(&mut self, cx: &WaitCx) -> bool {
        cx.now >= self.wake_at
    }
}

/// Wakes when the target task has died
pub struct JoinCondition {
    target: Arc<Task>,
}

impl JoinCondition {
    /// Wake once `target` is dead
    pub fn new(target: Arc<Task>) -> Self {
        Self { target }
    }
}

impl WaitCondition for JoinCondition {
    fn poll(&mut self, _cx: &WaitCx) -> bool {
        self.target.state() == TaskState::Dead
    }
}

/// Wakes when an externally owned flag is raised.
///
/// The registration point for external facilities: an IPC channel or a
/// filesystem transaction holds the flag and raises it on completion.
pub struct EventCondition {
    signal: Arc<AtomicBool>,
}

impl EventCondition {
    /// Wake once `signal` becomes true
    pub fn new(signal: Arc<AtomicBool>) -> Self {
        Self { signal }
    }
}

impl WaitCondition for EventCondition {
    fn poll(&mut self, _cx: &WaitCx) -> bool {
        self.signal.load(Ordering::Acquire)
    }
}

/// Block `task` until `condition` polls true.
///
/// The task stays in its core's list but leaves the runnable rotation.
pub fn wait_for(task: &Arc<Task>, condition: Box<dyn WaitCondition>) -> KernelResult<()> {
    let mut inner = task.inner().lock();
    if inner.state == TaskState::Dead {
        return Err(KernelError::NotFound);
    }
    inner.state = TaskState::Blocked;
    inner.wait = Some(condition);
    Ok(())
}

/// Block `task` for at least `milliseconds`.
pub fn wait_sleep(table: &SchedulerTable, task: &Arc<Task>, milliseconds: u64) -> KernelResult<()> {
    wait_for(
        task,
        Box::new(SleepCondition::new(table.now() + milliseconds)),
    )
}

/// Block `task` until the task with id `target` has died.
pub fn wait_join(table: &SchedulerTable, task: &Arc<Task>, target: TaskId) -> KernelResult<()> {
    if task.id() == target {
        return Err(KernelError::InvalidArgument);
    }
    let target = table.task_by_id(target).ok_or(KernelError::NotFound)?;
    wait_for(task, Box::new(JoinCondition::new(target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, spawn};

    #[test]
    fn sleep_condition_fires_at_deadline() {
        let mut cond = SleepCondition::new(10);
        assert!(!cond.poll(&WaitCx { now: 9 }));
        assert!(cond.poll(&WaitCx { now: 10 }));
        assert!(cond.poll(&WaitCx { now: 11 }));
    }

    #[test]
    fn event_condition_follows_the_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut cond = EventCondition::new(flag.clone());
        assert!(!cond.poll(&WaitCx { now: 0 }));
        flag.store(true, Ordering::Release);
        assert!(cond.poll(&WaitCx { now: 0 }));
    }

    #[test]
    fn sleeping_task_wakes_once_the_clock_reaches_its_deadline() {
        let f = fixture(1);
        let task = spawn(&f, 0x41_0000);
        f.table.assign(&task, Some(0)).unwrap();

        wait_sleep(&f.table, &task, 5).unwrap();
        for _ in 0..4 {
            f.table.timer_tick();
            f.table.schedule();
            assert_eq!(task.state(), TaskState::Blocked);
        }

        f.table.timer_tick();
        assert_eq!(f.table.schedule().id(), task.id());
    }

    #[test]
    fn joining_task_wakes_when_the_target_dies() {
        let f = fixture(1);
        let waiter = spawn(&f, 0x41_0000);
        let target = spawn(&f, 0x42_0000);
        f.table.assign(&waiter, Some(0)).unwrap();
        f.table.assign(&target, Some(0)).unwrap();

        wait_join(&f.table, &waiter, target.id()).unwrap();
        assert_eq!(f.table.schedule().id(), target.id());
        assert_eq!(waiter.state(), TaskState::Blocked);

        f.table.kill(target.id()).unwrap();
        assert_eq!(f.table.schedule().id(), waiter.id());
    }

    #[test]
    fn join_rejects_self_and_unknown_targets() {
        let f = fixture(1);
        let task = spawn(&f, 0x41_0000);
        f.table.assign(&task, Some(0)).unwrap();

        assert_eq!(
            wait_join(&f.table, &task, task.id()),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            wait_join(&f.table, &task, TaskId(0xDEAD)),
            Err(KernelError::NotFound)
        );
        assert_eq!(task.state(), TaskState::Runnable);
    }
}
