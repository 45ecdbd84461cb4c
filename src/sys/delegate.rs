//! Syscall Delegation Bridge
//!
//! Long-running system calls must not execute on the syscall entry path
//! with interrupts disabled. Instead the caller's task is parked and a
//! short-lived kernel task runs the handler: the embedding kernel points
//! the worker's entry at a trampoline that calls [`run`], which executes
//! the handler with the original arguments, records the result into the
//! caller's pending-call slot, and raises the completion flag — the
//! caller returns to runnable at the next scheduling pass, and the worker
//! dies.

use crate::mm::VirtAddr;
use crate::sys::process;
use crate::sys::scheduler::SchedulerTable;
use crate::sys::task::{Privilege, Task, TaskState};
use crate::sys::wait::{self, EventCondition};
use crate::sys::KernelEnv;
use crate::KernelResult;
use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A delegated system call handler
pub type SyscallHandler = fn(u64) -> u64;

/// One in-flight delegated call, shared by caller and worker
pub struct PendingSyscall {
    handler: SyscallHandler,
    data: u64,
    result: AtomicU64,
    done: Arc<AtomicBool>,
}

impl PendingSyscall {
    fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn result(&self) -> u64 {
        self.result.load(Ordering::Acquire)
    }
}

/// Park `caller` and spawn a kernel worker that will run `handler(data)`.
///
/// The worker is created in the caller's process, aimed at the embedder's
/// `trampoline` (which calls [`run`]), and auto-assigned to the least
/// loaded core.
pub fn begin(
    table: &SchedulerTable,
    env: &KernelEnv,
    caller: &Arc<Task>,
    handler: SyscallHandler,
    data: u64,
    trampoline: VirtAddr,
) -> KernelResult<Arc<Task>> {
    let done = Arc::new(AtomicBool::new(false));
    let pending = Arc::new(PendingSyscall {
        handler,
        data,
        result: AtomicU64::new(0),
        done: done.clone(),
    });

    caller.inner().lock().pending = Some(pending.clone());
    wait::wait_for(caller, Box::new(EventCondition::new(done)))?;

    let worker = match process::create_task(env, caller.process(), trampoline, Privilege::Kernel) {
        Ok(worker) => worker,
        Err(err) => {
            // Could not spawn the worker; hand the caller its CPU back.
            let mut inner = caller.inner().lock();
            inner.pending = None;
            inner.wait = None;
            inner.state = TaskState::Runnable;
            return Err(err);
        }
    };
    worker.set_identifier(&format!("syscall:{}", caller.id().value()));
    worker.inner().lock().pending = Some(pending);

    if let Err(err) = table.assign(&worker, None) {
        let mut inner = caller.inner().lock();
        inner.pending = None;
        inner.wait = None;
        inner.state = TaskState::Runnable;
        return Err(err);
    }

    log::trace!(
        "delegated syscall from {:?} to worker {:?}",
        caller.id(),
        worker.id()
    );
    Ok(worker)
}

/// Worker body, reached through the embedder's trampoline.
///
/// Executes the pending handler, publishes the result, and marks the
/// worker dead; its core reaps it on the next pass.
pub fn run(worker: &Arc<Task>) {
    let pending = worker.inner().lock().pending.clone();
    let Some(pending) = pending else {
        log::warn!("delegate worker {:?} has no pending call", worker.id());
        worker.inner().lock().state = TaskState::Dead;
        return;
    };

    let value = (pending.handler)(pending.data);
    pending.result.store(value, Ordering::Release);
    pending.done.store(true, Ordering::Release);

    let mut inner = worker.inner().lock();
    inner.pending = None;
    inner.state = TaskState::Dead;
    log::trace!("delegate worker {:?} finished", worker.id());
}

/// Fetch (and consume) the result of a completed delegated call.
///
/// `None` while the call is still in flight or when none was made.
pub fn result(task: &Arc<Task>) -> Option<u64> {
    let mut inner = task.inner().lock();
    let pending = inner.pending.clone()?;
    if !pending.done() {
        return None;
    }
    inner.pending = None;
    Some(pending.result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, spawn};

    fn double(x: u64) -> u64 {
        x * 2
    }

    #[test]
    fn delegation_parks_the_caller_and_returns_the_result() {
        let f = fixture(1);
        let caller = spawn(&f, 0x41_0000);
        f.table.assign(&caller, Some(0)).unwrap();

        let trampoline = VirtAddr::new(crate::KERNEL_VIRT_BASE);
        let worker = begin(&f.table, &f.env, &caller, double, 21, trampoline).unwrap();

        assert_eq!(caller.state(), TaskState::Blocked);
        assert!(f.table.task_by_id(worker.id()).is_some());
        assert_eq!(result(&caller), None);

        // The worker's core eventually runs the trampoline body.
        run(&worker);
        assert_eq!(worker.state(), TaskState::Dead);

        // Next pass: the caller's completion flag has been raised, the
        // worker is reaped.
        let pick = f.table.schedule();
        assert_eq!(pick.id(), caller.id());
        assert!(f.table.task_by_id(worker.id()).is_none());
        assert_eq!(result(&caller), Some(42));
        assert_eq!(result(&caller), None);
    }

    #[test]
    fn worker_runs_in_the_caller_process() {
        let f = fixture(1);
        let caller = spawn(&f, 0x41_0000);
        f.table.assign(&caller, Some(0)).unwrap();

        let worker = begin(
            &f.table,
            &f.env,
            &caller,
            double,
            1,
            VirtAddr::new(crate::KERNEL_VIRT_BASE),
        )
        .unwrap();
        assert_eq!(worker.process().id(), caller.process().id());
        assert_eq!(worker.privilege(), Privilege::Kernel);
        assert!(worker
            .identifier()
            .unwrap()
            .starts_with("syscall:"));
    }
}
