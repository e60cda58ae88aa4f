//! Task control blocks and the scheduler (spec.md §3 "Task", §4.1
//! "Scheduler").

pub mod readyqueue;

use bitflags::bitflags;

use crate::config::{NUM_PRIORITIES, NUM_TASKS};
use crate::error::{KernelError, KResult};
use crate::lock::{CpuLockCell, CpuLockToken};
use crate::pool::Pool;
use crate::wait::WakeReason;

use readyqueue::{ReadyQueue, ScheduleDecision};

pub type TaskId = crate::pool::Id<Tcb>;
pub type TaskPool = Pool<Tcb, NUM_TASKS>;
/// A mutex handle, as seen by the task module (the mutex-owned list is a
/// chain of these). Defined as an alias here to avoid a dependency cycle:
/// `sync::mutex` already depends on `task` for `TaskId`.
pub type MutexId = crate::pool::Id<crate::sync::mutex::MutexCb>;

bitflags! {
    /// Per-task flags (spec.md §3: "a flags bitfield (in-priority-queue,
    /// mutex-waiting, in-event-queue, user-mode, preallocated-stack,
    /// stack-check-enabled, ...)").
    pub struct TaskFlags: u16 {
        const IN_READY_QUEUE      = 1 << 0;
        const MUTEX_WAITING       = 1 << 1;
        const IN_EVENT_QUEUE      = 1 << 2;
        const USER_MODE           = 1 << 3;
        const PREALLOCATED_STACK  = 1 << 4;
        const STACK_CHECK_ENABLED = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    Dormant,
    Ready,
    Running,
    Waiting,
}

/// What the scheduler should do with the previously-running task at a
/// scheduler point (the `sched` selector in spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedSelector {
    Test,
    Suspend,
    Stop,
    Delete,
    Nop,
}

/// Sentinel priority meaning "leave priority unchanged" (spec.md §4.1).
pub const NOCHG: usize = usize::MAX;

pub struct Tcb {
    pub entry: Option<fn(usize)>,
    pub entry_param: usize,
    base_priority: CpuLockCell<u8>,
    effective_priority: CpuLockCell<u8>,
    /// Per-task priority-on-timeout override (`pritmo`), applied when this
    /// task's wait times out (spec.md §4.3).
    pub priority_on_timeout: Option<u8>,
    state: CpuLockCell<TaskSt>,
    /// The single forward link used by whichever queue currently holds this
    /// task — the ready queue or a wait queue, never both (spec.md §3
    /// invariant: "A task is in exactly one queue").
    queue_link: CpuLockCell<Option<TaskId>>,
    /// Head of this task's mutex-owned list (MOL), spec.md §3/§4.5.
    pub mol_head: CpuLockCell<Option<MutexId>>,
    /// The mutex this task is currently blocked acquiring, if any. Used only
    /// to walk the "task -> blocking mutex -> owner -> ..." chain during
    /// priority-inheritance propagation (spec.md §9); every other wait
    /// reason leaves this `None`.
    blocked_on_mutex: CpuLockCell<Option<MutexId>>,
    wait_result: CpuLockCell<Option<WakeReason>>,
    /// Saved return-value slot (spec.md §3 "a saved return-value slot"):
    /// carries a satisfied wait's payload back to the caller alongside
    /// `wait_result` — the event-group match mask, the delivered message's
    /// `Id`, a pipe rendezvous byte count, and so on. Each blocking service
    /// documents what it stashes here.
    rv: CpuLockCell<u32>,
    pub parent: Option<TaskId>,
    pub flags: CpuLockCell<TaskFlags>,
    pub stack_base: usize,
    pub stack_size: usize,
    pub stack_high_water_mark: CpuLockCell<usize>,
}

impl Tcb {
    fn dormant(priority: u8) -> Self {
        Self {
            entry: None,
            entry_param: 0,
            base_priority: CpuLockCell::new(priority),
            effective_priority: CpuLockCell::new(priority),
            priority_on_timeout: None,
            state: CpuLockCell::new(TaskSt::Dormant),
            queue_link: CpuLockCell::new(None),
            mol_head: CpuLockCell::new(None),
            blocked_on_mutex: CpuLockCell::new(None),
            wait_result: CpuLockCell::new(None),
            rv: CpuLockCell::new(0),
            parent: None,
            flags: CpuLockCell::new(TaskFlags::empty()),
            stack_base: 0,
            stack_size: 0,
            stack_high_water_mark: CpuLockCell::new(0),
        }
    }

    pub fn priority(&self, token: &CpuLockToken) -> u8 {
        *self.effective_priority.get(token)
    }

    pub fn base_priority(&self, token: &CpuLockToken) -> u8 {
        *self.base_priority.get(token)
    }

    pub fn set_effective_priority(&self, token: &mut CpuLockToken, pri: u8) {
        *self.effective_priority.get_mut(token) = pri;
    }

    pub fn set_base_priority(&self, token: &mut CpuLockToken, pri: u8) {
        *self.base_priority.get_mut(token) = pri;
    }

    pub fn state(&self, token: &CpuLockToken) -> TaskSt {
        *self.state.get(token)
    }

    pub fn set_state(&self, token: &mut CpuLockToken, st: TaskSt) {
        *self.state.get_mut(token) = st;
    }

    pub fn queue_link(&self, token: &CpuLockToken) -> Option<TaskId> {
        *self.queue_link.get(token)
    }

    pub fn set_queue_link(&self, token: &mut CpuLockToken, v: Option<TaskId>) {
        *self.queue_link.get_mut(token) = v;
    }

    // `wait.rs`'s `WaitQueue` uses the same link field under the name
    // "wait link"; ready queue and wait queue never hold a task
    // simultaneously so sharing the storage is sound and mirrors spec.md's
    // single-forward-link invariant directly instead of merely implying it.
    pub fn wait_link(&self, token: &CpuLockToken) -> Option<TaskId> {
        self.queue_link(token)
    }
    pub fn set_wait_link(&self, token: &mut CpuLockToken, v: Option<TaskId>) {
        self.set_queue_link(token, v)
    }

    pub fn take_wait_result(&self, token: &mut CpuLockToken) -> Option<WakeReason> {
        self.wait_result.get_mut(token).take()
    }

    pub fn set_wait_result(&self, token: &mut CpuLockToken, r: WakeReason) {
        *self.wait_result.get_mut(token) = Some(r);
    }

    pub fn rv(&self, token: &CpuLockToken) -> u32 {
        *self.rv.get(token)
    }

    pub fn set_rv(&self, token: &mut CpuLockToken, v: u32) {
        *self.rv.get_mut(token) = v;
    }

    pub fn blocked_on_mutex(&self, token: &CpuLockToken) -> Option<MutexId> {
        *self.blocked_on_mutex.get(token)
    }

    pub fn set_blocked_on_mutex(&self, token: &mut CpuLockToken, v: Option<MutexId>) {
        *self.blocked_on_mutex.get_mut(token) = v;
    }

    #[cfg(test)]
    pub fn dormant_for_test(priority: u8) -> Self {
        Self::dormant(priority)
    }
}

/// The fixed-capacity task arena plus the ready queue over it. Bundled
/// together (rather than `Pool<Tcb, N>` standing alone) because almost every
/// ready-queue operation needs mutable access to a task's link field, and
/// splitting the borrow between two top-level kernel fields would make
/// every call site thread both through anyway.
pub struct TaskTable {
    pool: TaskPool,
    pub ready: ReadyQueue,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            pool: Pool::new_empty(),
            ready: ReadyQueue::new(),
        }
    }

    pub fn get(&self, id: TaskId) -> &Tcb {
        self.pool.get(id).expect("stale TaskId")
    }

    pub fn get_mut(&mut self, id: TaskId) -> &mut Tcb {
        self.pool.get_mut(id).expect("stale TaskId")
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.pool.contains(id)
    }

    /// Create a new, Dormant task (spec.md §6 "Task: Create").
    pub fn create(
        &mut self,
        entry: fn(usize),
        entry_param: usize,
        base_priority: u8,
        stack_base: usize,
        stack_size: usize,
    ) -> KResult<TaskId> {
        if base_priority as usize >= NUM_PRIORITIES {
            return Err(KernelError::InvalidPriority);
        }
        let mut tcb = Tcb::dormant(base_priority);
        tcb.entry = Some(entry);
        tcb.entry_param = entry_param;
        tcb.stack_base = stack_base;
        tcb.stack_size = stack_size;
        self.pool
            .insert(tcb)
            .ok_or(KernelError::OutOfControlBlocks)
    }

    pub fn delete(&mut self, id: TaskId) -> KResult<()> {
        if !self.pool.contains(id) {
            return Err(KernelError::InvalidObject);
        }
        self.pool.remove(id);
        Ok(())
    }

    /// Transition a Dormant task to Ready and enqueue it (spec.md §4.1
    /// "activate"/"start").
    pub fn activate(&mut self, token: &mut CpuLockToken, id: TaskId) -> KResult<()> {
        if !self.contains(id) {
            return Err(KernelError::InvalidObject);
        }
        if self.get(id).state(token) != TaskSt::Dormant {
            return Err(KernelError::OperationNotAllowed);
        }
        self.make_ready(token, id);
        Ok(())
    }

    fn make_ready(&mut self, token: &mut CpuLockToken, id: TaskId) {
        let pri = self.get(id).priority(token) as usize;
        self.get(id).set_state(token, TaskSt::Ready);
        let Self { pool, ready } = self;
        ready.push_back(pool, token, id, pri);
    }

    /// Move a Waiting task back to Ready and enqueue it (used by every
    /// synchronization primitive's wake-up path).
    pub fn wake(&mut self, token: &mut CpuLockToken, id: TaskId) {
        self.make_ready(token, id);
    }

    /// Reposition a Ready task from `old_priority` to `new_priority` (used
    /// by mutex priority-inheritance propagation, spec.md §4.5/§9).
    pub fn reposition_ready(
        &mut self,
        token: &mut CpuLockToken,
        id: TaskId,
        old_priority: usize,
        new_priority: usize,
    ) {
        let Self { pool, ready } = self;
        ready.remove(pool, token, id, old_priority);
        ready.push_back(pool, token, id, new_priority);
    }

    /// `TaskBump` (spec.md §6, SPEC_FULL.md §E): move a ready task to the
    /// tail of its own priority level, leaving priority unchanged. A no-op
    /// for a task that is not currently Ready.
    pub fn bump(&mut self, token: &mut CpuLockToken, id: TaskId) {
        if self.get(id).state(token) != TaskSt::Ready {
            return;
        }
        let pri = self.get(id).priority(token) as usize;
        let Self { pool, ready } = self;
        ready.bump(pool, token, id, pri);
    }

    /// True if some ready task could now preempt a task running at
    /// `running_priority` (or if nothing is running).
    pub fn has_preempting_task(&self, running_priority: Option<u8>) -> bool {
        match running_priority {
            Some(p) => self.ready.has_task_above(p as usize),
            None => !self.ready.is_empty(),
        }
    }

    /// Pick the next task to run, given the currently-running task's
    /// priority (`None` if nothing was running, e.g. at boot or from the
    /// idle loop). Transitions the outgoing Running task (if any, and if it
    /// is being switched away from) according to `sched`.
    pub fn choose_next_running_task(
        &mut self,
        token: &mut CpuLockToken,
        running: Option<TaskId>,
        sched: SchedSelector,
    ) -> Option<TaskId> {
        let running_priority = running.map(|id| self.get(id).priority(token));
        let decision = {
            let Self { pool, ready } = self;
            ready.pop_front_task(pool, token, running_priority.map(|p| p as usize))
        };
        match decision {
            ScheduleDecision::Keep => running,
            ScheduleDecision::SwitchTo(next) => {
                if let Some(r) = running {
                    self.apply_sched_selector(token, r, sched);
                }
                if let Some(n) = next {
                    self.get(n).set_state(token, TaskSt::Running);
                }
                next
            }
        }
    }

    fn apply_sched_selector(&mut self, token: &mut CpuLockToken, id: TaskId, sched: SchedSelector) {
        match sched {
            SchedSelector::Test => {
                // Still runnable: put it back at the tail of its level.
                self.make_ready(token, id);
            }
            SchedSelector::Suspend => {
                // Stack state preserved (spec.md §4.1): only the state
                // changes, no stack/link fields are touched.
                self.get(id).set_state(token, TaskSt::Waiting);
            }
            SchedSelector::Stop => {
                // Stack may be recycled by the caller; state becomes
                // Dormant so the next Start begins at `entry` again.
                self.get(id).set_state(token, TaskSt::Dormant);
            }
            SchedSelector::Delete => {
                let _ = self.delete(id);
            }
            SchedSelector::Nop => {}
        }
    }

    /// Change a task's base priority, repositioning it in whichever queue it
    /// currently occupies (spec.md §4.1's priority bands / `NOCHG`
    /// sentinel handling lives at the call site, which passes a resolved
    /// numeric priority here).
    pub fn set_base_priority(
        &mut self,
        token: &mut CpuLockToken,
        id: TaskId,
        new_priority: u8,
    ) -> KResult<()> {
        if new_priority as usize >= NUM_PRIORITIES {
            return Err(KernelError::InvalidPriority);
        }
        let old_priority = self.get(id).priority(token) as usize;
        self.get(id).set_base_priority(token, new_priority);
        // Mutex ceiling/inheritance may keep the effective priority above
        // the new base; `sync::mutex::evaluate_task_effective_priority`
        // recomputes the real effective value after MOL/ceiling accounting.
        // Here we only handle the no-mutex-held fast path of also updating
        // effective priority and requeueing if the task is presently Ready.
        if self.get(id).mol_head.get(token).is_none() {
            self.get(id).set_effective_priority(token, new_priority);
            if self.get(id).state(token) == TaskSt::Ready {
                let Self { pool, ready } = self;
                ready.remove(pool, token, id, old_priority);
                ready.push_back(pool, token, id, new_priority as usize);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn spawn_for_test(&mut self, priority: u8) -> TaskId {
        self.pool.insert(Tcb::dormant(priority)).unwrap()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: usize) {}

    #[test]
    fn activate_enqueues_and_top_priority_tracks_it() {
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let id = tasks.create(noop, 0, 3, 0, 0).unwrap();
            assert_eq!(tasks.get(id).state(&token), TaskSt::Dormant);
            tasks.activate(&mut token, id).unwrap();
            assert_eq!(tasks.get(id).state(&token), TaskSt::Ready);
            assert_eq!(tasks.ready.top_priority(), Some(3));
        }
    }

    #[test]
    fn choose_next_running_task_prefers_higher_priority() {
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let low = tasks.create(noop, 0, 10, 0, 0).unwrap();
            let high = tasks.create(noop, 0, 1, 0, 0).unwrap();
            tasks.activate(&mut token, low).unwrap();
            tasks.activate(&mut token, high).unwrap();
            let next =
                tasks.choose_next_running_task(&mut token, None, SchedSelector::Nop);
            assert_eq!(next, Some(high));
        }
    }

    #[test]
    fn create_fails_with_invalid_priority() {
        let mut tasks = TaskTable::new();
        assert_eq!(
            tasks.create(noop, 0, NUM_PRIORITIES as u8, 0, 0),
            Err(KernelError::InvalidPriority)
        );
    }

    #[test]
    fn bump_moves_a_ready_task_behind_its_equal_priority_peer() {
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let a = tasks.create(noop, 0, 5, 0, 0).unwrap();
            let b = tasks.create(noop, 0, 5, 0, 0).unwrap();
            tasks.activate(&mut token, a).unwrap();
            tasks.activate(&mut token, b).unwrap();
            tasks.bump(&mut token, a);
            let first = tasks.choose_next_running_task(&mut token, None, SchedSelector::Nop);
            assert_eq!(first, Some(b));
        }
    }
}
