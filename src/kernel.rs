//! Top-level kernel instance: owns every control-block table and wires the
//! scheduler-point contract (spec.md §4.1) across them.
//!
//! Grounded in `original_source/XSMX/xsmx.c`'s `smx_Sched` entry point and
//! `xglob.c`'s global control-block arrays, collapsed the way the teacher's
//! own `r3_kernel::Kernel` collapses a port's object tables into one state
//! struct instead of a scatter of `static`s.

use crate::config::NUM_TASKS;
use crate::errmgr::{ErrorManager, ObjectTag};
use crate::handle_table::HandleTable;
use crate::heap::Heap;
use crate::lock::{lock_cpu, Arch, CpuLockGuard, CpuLockToken};
use crate::lsr::LsrQueue;
use crate::msg::exchange::ExchangeTable;
use crate::msg::mcb::MsgPool;
use crate::msg::pipe::PipeTable;
use crate::sync::event_group::EventGroupTable;
use crate::sync::event_queue::EventQueueTable;
use crate::sync::mutex::MutexArena;
use crate::sync::semaphore::SemTable;
use crate::task::{SchedSelector, TaskId, TaskTable};
use crate::timeout::TimeoutArray;
use crate::timer::TimerQueue;

/// Size of the default system heap (spec.md §4.10 calls out no fixed size;
/// this is simply a usable default for a microcontroller-class build).
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024;

/// Every control-block table and piece of ambient state a running kernel
/// needs, in one struct so there is exactly one of each per program — the
/// same "one kernel instance" assumption SPEC_FULL.md §A documents for
/// `config.rs`.
pub struct Kernel<A: Arch> {
    pub tasks: TaskTable,
    pub semaphores: SemTable,
    pub mutexes: MutexArena,
    pub event_groups: EventGroupTable,
    pub event_queues: EventQueueTable,
    pub exchanges: ExchangeTable,
    pub messages: MsgPool,
    pub pipes: PipeTable,
    pub timers: TimerQueue,
    pub timeouts: TimeoutArray,
    pub lsrs: LsrQueue,
    pub heap: Heap<DEFAULT_HEAP_SIZE>,
    pub errors: ErrorManager,
    pub handles: HandleTable,
    running: Option<TaskId>,
    /// `smx_lockctr`: >0 suppresses preemption at every scheduler-point
    /// (spec.md §4.1/§5) without blocking ready-queue maintenance.
    lock_count: u32,
    etime: u32,
    /// `smx_stime`: wall-clock time at boot, in ticks, for [`Self::sys_peek`]
    /// to report alongside the free-running `etime`. Set once via
    /// [`Self::set_start_time`]; board support code with access to a
    /// real-time clock calls it during startup.
    stime: u32,
    _arch: core::marker::PhantomData<A>,
}

impl<A: Arch> Kernel<A> {
    pub fn new(donor_size: u32) -> Self {
        Self {
            tasks: TaskTable::new(),
            semaphores: SemTable::new_empty(),
            mutexes: MutexArena::new(),
            event_groups: EventGroupTable::new_empty(),
            event_queues: EventQueueTable::new_empty(),
            exchanges: ExchangeTable::new_empty(),
            messages: MsgPool::new_empty(),
            pipes: PipeTable::new_empty(),
            timers: TimerQueue::new(),
            timeouts: TimeoutArray::new(),
            lsrs: LsrQueue::new(),
            heap: Heap::new(donor_size),
            errors: ErrorManager::new(),
            handles: HandleTable::new(),
            running: None,
            lock_count: 0,
            etime: 0,
            stime: 0,
            _arch: core::marker::PhantomData,
        }
    }

    pub fn running(&self) -> Option<TaskId> {
        self.running
    }

    pub fn etime(&self) -> u32 {
        self.etime
    }

    /// Record the wall-clock boot time reported by [`Self::sys_peek`].
    pub fn set_start_time(&mut self, stime: u32) {
        self.stime = stime;
    }

    /// `TaskLock`: raise the lock counter, deferring preemption at every
    /// scheduler-point until it drops back to zero.
    pub fn task_lock(&mut self) {
        self.lock_count += 1;
    }

    /// `TaskUnlock`: lower the lock counter. Dropping it to zero is itself a
    /// scheduler-point (spec.md §4.1: "transition of the lock counter from 1
    /// to 0").
    pub fn task_unlock(&mut self, token: &mut CpuLockToken) {
        if self.lock_count > 0 {
            self.lock_count -= 1;
        }
        if self.lock_count == 0 {
            self.schedule(token);
        }
    }

    /// `TaskLockClear`: unconditionally drop the lock counter to zero and
    /// run a scheduler-point.
    pub fn task_lock_clear(&mut self, token: &mut CpuLockToken) {
        self.lock_count = 0;
        self.schedule(token);
    }

    /// Acquire the CPU lock for the duration of a critical section.
    /// Board support code calls this around every service entry; tests use
    /// `unsafe { CpuLockToken::new_unchecked() }` directly instead.
    pub fn lock_cpu(&self) -> CpuLockGuard<A> {
        lock_cpu::<A>()
    }

    /// Run a scheduler-point: if no task lock is held, dispatch the
    /// highest-priority ready task (spec.md §4.1). A no-op while
    /// `lock_count > 0` — the ready queue has already been updated by
    /// whatever woke the task, only dispatch is deferred.
    pub fn schedule(&mut self, token: &mut CpuLockToken) {
        if self.lock_count > 0 {
            return;
        }
        self.running =
            self.tasks
                .choose_next_running_task(token, self.running, SchedSelector::Nop);
    }

    /// Keep-time LSR body (spec.md §4.3): advance `etime` by one tick, fire
    /// due timers, wake tasks whose timeout has expired, and fold the
    /// rollover bit if it becomes necessary. Does not itself run a
    /// scheduler-point — the caller (the LSR drain loop) does that once
    /// after every LSR in the pass has run, per spec.md §4.2.
    pub fn tick(&mut self, token: &mut CpuLockToken) {
        self.etime = self.etime.wrapping_add(1);
        self.timers.tick(token, self.etime);
        if self.timeouts.has_due(self.etime) {
            let due: arrayvec::ArrayVec<TaskId, NUM_TASKS> =
                self.timeouts.due_at(self.etime).collect();
            for task in due {
                self.timeouts.disarm(task);
                self.tasks.get(task).set_wait_result(token, crate::wait::WakeReason::TimedOut);
                self.tasks.wake(token, task);
            }
            // The cached minimum may have just fired (or been disarmed
            // above); rescan to find the new earliest, per spec.md §4.3.
            self.timeouts.rebuild_min();
        }
        self.etime = self.timeouts.maybe_fold_rollover(self.etime);
    }

    /// `smx_EM`: route a failed service's error through the error manager
    /// and return it unchanged, so call sites can write
    /// `self.fail(err, tag)` as their `Err(...)` arm.
    pub fn report(&mut self, err: crate::error::KernelError, object: ObjectTag) -> crate::error::KernelError {
        self.errors.report(self.etime, err, object);
        err
    }

    /// `SysPeek`: read-only snapshot of the scheduler's notion of time
    /// (spec.md §6 "System: Peek").
    pub fn sys_peek(&self) -> SystemInfo {
        SystemInfo {
            etime: self.etime,
            stime: self.stime,
            ticks_per_second: crate::config::TICKS_PER_SECOND,
        }
    }

    /// `PowerDown`: platform personality-shell concern (spec.md §1
    /// out-of-scope list) — present in the service-call surface, but this
    /// crate has no board-level sleep/wake path to drive.
    pub fn power_down(&mut self) -> crate::error::KResult<()> {
        Err(crate::error::KernelError::OperationNotAllowed)
    }

    /// `WhatIs`: look up an object's diagnostic name (same out-of-scope
    /// rationale as [`Self::power_down`] — a full implementation would need
    /// a handle-to-object-kind resolver this crate's fixed-capacity tables
    /// don't expose generically).
    pub fn what_is(&self, _name: &str) -> crate::error::KResult<ObjectTag> {
        Err(crate::error::KernelError::OperationNotAllowed)
    }

    /// `PseudoHandleCreate`: same out-of-scope rationale — the original's
    /// pseudo-handles stand in for caller-supplied memory this crate never
    /// takes raw pointers to.
    pub fn pseudo_handle_create(&mut self) -> crate::error::KResult<()> {
        Err(crate::error::KernelError::OperationNotAllowed)
    }
}

/// Read-only snapshot returned by [`Kernel::sys_peek`] (spec.md §6 "System:
/// Peek": etime, stime, ticks-per-second).
#[derive(Debug, Clone, Copy)]
pub struct SystemInfo {
    pub etime: u32,
    pub stime: u32,
    pub ticks_per_second: u32,
}
