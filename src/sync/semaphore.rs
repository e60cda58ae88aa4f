//! Semaphores with four modes: RESOURCE, EVENT, THRESHOLD, GATE (spec.md §3
//! "Semaphore", §4.4).

use crate::error::{KResult, KernelError, SignalSemaphoreError, WaitSemaphoreError};
use crate::lock::CpuLockToken;
use crate::task::TaskTable;
use crate::wait::{QueueOrder, WaitQueue, WakeReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemMode {
    Resource,
    Event,
    Threshold,
    Gate,
}

pub struct SemCb {
    pub mode: SemMode,
    count: u16,
    limit: u16,
    wait_queue: WaitQueue,
    pub on_signal: Option<fn(u16)>,
}

impl SemCb {
    pub fn new(mode: SemMode, initial_count: u16, limit: u16) -> Self {
        let order = if mode == SemMode::Gate {
            QueueOrder::Fifo
        } else {
            QueueOrder::Priority
        };
        Self {
            mode,
            count: initial_count,
            limit,
            wait_queue: WaitQueue::new(order),
            on_signal: None,
        }
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    /// `Signal` (spec.md §4.4). For GATE, releases every waiter at once;
    /// otherwise releases at most one.
    pub fn signal(
        &mut self,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
    ) -> Result<(), SignalSemaphoreError> {
        match self.mode {
            SemMode::Resource => {
                if self.count >= self.limit {
                    return Err(SignalSemaphoreError::SemaphoreCounterOverflow);
                }
                self.count += 1;
                self.release_one(tasks, token);
            }
            SemMode::Event => {
                if self.count >= 255 {
                    return Err(SignalSemaphoreError::SemaphoreCounterOverflow);
                }
                self.count += 1;
                self.release_one(tasks, token);
            }
            SemMode::Threshold => {
                self.count += 1;
                if self.count >= self.limit {
                    self.release_one(tasks, token);
                }
            }
            SemMode::Gate => {
                self.count = 1;
                while let Some(id) = self.wait_queue.pop_first(tasks, token) {
                    tasks.get(id).set_wait_result(token, WakeReason::Satisfied);
                }
            }
        }
        if let Some(cb) = self.on_signal {
            cb(self.count);
        }
        Ok(())
    }

    fn release_one(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken) {
        if self.wait_queue.is_empty() {
            return;
        }
        let satisfied = match self.mode {
            SemMode::Resource | SemMode::Event => self.count > 0,
            SemMode::Threshold => self.count >= self.limit,
            SemMode::Gate => true,
        };
        if !satisfied {
            return;
        }
        if let Some(id) = self.wait_queue.pop_first(tasks, token) {
            match self.mode {
                SemMode::Threshold => self.count -= self.limit,
                _ => self.count -= 1,
            }
            tasks.get(id).set_wait_result(token, WakeReason::Satisfied);
        }
    }

    /// Non-blocking `Test`/`Peek`-style check: true and decrements if the
    /// semaphore is currently satisfiable without waiting.
    pub fn try_take(&mut self) -> bool {
        match self.mode {
            SemMode::Resource | SemMode::Event => {
                if self.count > 0 {
                    self.count -= 1;
                    true
                } else {
                    false
                }
            }
            SemMode::Threshold => {
                if self.count >= self.limit {
                    self.count -= self.limit;
                    true
                } else {
                    false
                }
            }
            SemMode::Gate => {
                if self.count > 0 {
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Enqueue the calling task to wait (blocking path is driven by the
    /// caller, which already validated `timeout` and is not itself an LSR,
    /// per spec.md §5 "WAIT_NOT_ALLOWED").
    pub fn enqueue_waiter(
        &mut self,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        task: crate::task::TaskId,
    ) -> Result<(), WaitSemaphoreError> {
        self.wait_queue.insert(tasks, token, task);
        Ok(())
    }

    /// `Clear` (spec.md §4.4): drain the wait queue with failure returns and
    /// reset the count (RESOURCE goes back to `limit`, others to 0).
    pub fn clear(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken) {
        self.wait_queue.drain(tasks, token, |tasks, token, id| {
            tasks.get(id).set_wait_result(token, WakeReason::Interrupted);
        });
        self.count = match self.mode {
            SemMode::Resource => self.limit,
            _ => 0,
        };
    }
}

pub type SemId = crate::pool::Id<SemCb>;
pub type SemTable = crate::pool::Pool<SemCb, { crate::config::NUM_SEMAPHORES }>;

pub fn create(table: &mut SemTable, mode: SemMode, initial_count: u16, limit: u16) -> KResult<SemId> {
    table
        .insert(SemCb::new(mode, initial_count, limit))
        .ok_or(KernelError::OutOfControlBlocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskTable;

    #[test]
    fn resource_semaphore_blocks_at_zero_and_releases_on_signal() {
        let mut sem = SemCb::new(SemMode::Resource, 0, 1);
        assert!(!sem.try_take());
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let waiter = tasks.spawn_for_test(5);
            sem.enqueue_waiter(&mut tasks, &mut token, waiter).unwrap();
            sem.signal(&mut tasks, &mut token).unwrap();
            assert_eq!(
                tasks.get(waiter).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
            assert_eq!(sem.count(), 0); // consumed by the released waiter
        }
    }

    #[test]
    fn gate_releases_all_waiters_at_once() {
        let mut sem = SemCb::new(SemMode::Gate, 0, 1);
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let a = tasks.spawn_for_test(5);
            let b = tasks.spawn_for_test(5);
            sem.enqueue_waiter(&mut tasks, &mut token, a).unwrap();
            sem.enqueue_waiter(&mut tasks, &mut token, b).unwrap();
            sem.signal(&mut tasks, &mut token).unwrap();
            assert_eq!(
                tasks.get(a).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
            assert_eq!(
                tasks.get(b).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
        }
    }

    #[test]
    fn threshold_only_releases_once_count_reaches_limit() {
        let mut sem = SemCb::new(SemMode::Threshold, 0, 3);
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let waiter = tasks.spawn_for_test(5);
            sem.enqueue_waiter(&mut tasks, &mut token, waiter).unwrap();
            sem.signal(&mut tasks, &mut token).unwrap();
            sem.signal(&mut tasks, &mut token).unwrap();
            assert_eq!(tasks.get(waiter).take_wait_result(&mut token), None);
            sem.signal(&mut tasks, &mut token).unwrap();
            assert_eq!(
                tasks.get(waiter).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
            assert_eq!(sem.count(), 0);
        }
    }
}
