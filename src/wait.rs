//! A wait queue shared by every blocking primitive (mutex, semaphore, event
//! group, event queue, message exchange, pipe).
//!
//! Grounded in the teacher's `wait.rs`, simplified the same way the rest of
//! this crate simplifies the teacher's pointer/port-trait machinery: no
//! `Pin`, no raw pointers, no generic `Traits` parameter. A waiter is just a
//! [`TaskId`] threaded through an intrusive singly-linked list stored in the
//! task control block itself (`Tcb::wait_link`), exactly the way the ready
//! queue threads tasks through `Tcb::rq_link`. Ordering is either FIFO or
//! priority order (spec.md §3/§5: "priority queues on mutexes/exchanges/
//! semaphores are stable... equal-priority waiters preserve enqueue order").

use crate::lock::CpuLockToken;
use crate::task::{self, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    Fifo,
    Priority,
}

/// Why a task's wait ended. Blocking entry points translate this into the
/// specific `KernelError`/payload their own signature promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The condition the task was waiting for was satisfied.
    Satisfied,
    /// The per-task timeout array fired (spec.md §4.3).
    TimedOut,
    /// `Clear`/`Delete`/forced release drained the queue.
    Interrupted,
}

/// A priority- or FIFO-ordered queue of blocked tasks, implemented as an
/// intrusive singly-linked list threaded through each task's own wait link.
pub struct WaitQueue {
    head: Option<TaskId>,
    order: QueueOrder,
}

impl WaitQueue {
    pub const fn new(order: QueueOrder) -> Self {
        Self { head: None, order }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn first(&self) -> Option<TaskId> {
        self.head
    }

    /// Insert `task` in its queue position (priority-ordered queues insert
    /// just after the last waiter of equal-or-higher priority, which is what
    /// keeps equal-priority waiters FIFO-stable).
    pub fn insert(&mut self, tasks: &mut task::TaskTable, token: &mut CpuLockToken, id: TaskId) {
        match self.order {
            QueueOrder::Fifo => self.push_back(tasks, token, id),
            QueueOrder::Priority => {
                let pri = tasks.get(id).priority(token);
                let mut prev: Option<TaskId> = None;
                let mut cur = self.head;
                while let Some(c) = cur {
                    if tasks.get(c).priority(token) > pri {
                        break;
                    }
                    prev = Some(c);
                    cur = tasks.get(c).wait_link(token);
                }
                tasks.get_mut(id).set_wait_link(token, cur);
                match prev {
                    Some(p) => tasks.get_mut(p).set_wait_link(token, Some(id)),
                    None => self.head = Some(id),
                }
            }
        }
    }

    fn push_back(&mut self, tasks: &mut task::TaskTable, token: &mut CpuLockToken, id: TaskId) {
        tasks.get_mut(id).set_wait_link(token, None);
        match self.last(tasks, token) {
            Some(tail) => tasks.get_mut(tail).set_wait_link(token, Some(id)),
            None => self.head = Some(id),
        }
    }

    fn last(&self, tasks: &task::TaskTable, token: &CpuLockToken) -> Option<TaskId> {
        let mut cur = self.head?;
        while let Some(next) = tasks.get(cur).wait_link(token) {
            cur = next;
        }
        Some(cur)
    }

    /// Remove and return the first waiter, if any.
    pub fn pop_first(
        &mut self,
        tasks: &mut task::TaskTable,
        token: &mut CpuLockToken,
    ) -> Option<TaskId> {
        let id = self.head?;
        self.head = tasks.get(id).wait_link(token);
        tasks.get_mut(id).set_wait_link(token, None);
        Some(id)
    }

    /// Remove an arbitrary member (used by timeout firing and forced
    /// release, which must remove a task from the middle of the queue).
    pub fn remove(&mut self, tasks: &mut task::TaskTable, token: &mut CpuLockToken, id: TaskId) {
        if self.head == Some(id) {
            self.head = tasks.get(id).wait_link(token);
            tasks.get_mut(id).set_wait_link(token, None);
            return;
        }
        let mut cur = self.head;
        while let Some(c) = cur {
            let next = tasks.get(c).wait_link(token);
            if next == Some(id) {
                let after = tasks.get(id).wait_link(token);
                tasks.get_mut(c).set_wait_link(token, after);
                tasks.get_mut(id).set_wait_link(token, None);
                return;
            }
            cur = next;
        }
    }

    /// Drain every waiter, invoking `f` with each (used by `Clear`/`Delete`,
    /// which wake every waiter with a failure return per spec.md §4.4/§4.5).
    pub fn drain(
        &mut self,
        tasks: &mut task::TaskTable,
        token: &mut CpuLockToken,
        mut f: impl FnMut(&mut task::TaskTable, &mut CpuLockToken, TaskId),
    ) {
        while let Some(id) = self.pop_first(tasks, token) {
            f(tasks, token, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskTable;

    #[test]
    fn priority_order_keeps_fifo_within_level() {
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let a = tasks.spawn_for_test(5);
            let b = tasks.spawn_for_test(5);
            let c = tasks.spawn_for_test(1);
            let mut q = WaitQueue::new(QueueOrder::Priority);
            q.insert(&mut tasks, &mut token, a);
            q.insert(&mut tasks, &mut token, b);
            q.insert(&mut tasks, &mut token, c);
            // c has numerically lower priority value = higher priority, so
            // it must come first; a and b are equal-priority and must stay
            // enqueue-ordered.
            assert_eq!(q.pop_first(&mut tasks, &mut token), Some(c));
            assert_eq!(q.pop_first(&mut tasks, &mut token), Some(a));
            assert_eq!(q.pop_first(&mut tasks, &mut token), Some(b));
        }
    }
}
