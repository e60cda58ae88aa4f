//! Pipes: fixed-width cell buffers with cyclic `rp`/`wp` and rendezvous
//! hand-off between a waiting putter and getter (spec.md §3 "Pipe", §4.7).
//!
//! Grounded in `original_source/XSMX/xpipe.c`'s `smx_PipePutPktWait_F`/
//! `smx_PipeGetPktWait_F`. Unlike the original (which tracks a per-task
//! `pipe_front`/`pipe_put` flag so its single task queue can mix get- and
//! put-waiters), spec.md §4.7 simplifies this to one invariant: "All
//! waiters in a pipe queue are of one kind"; [`PipeCb`] enforces that by
//! keeping a single `wait_kind` for the whole queue rather than per-task
//! flags.
//!
//! Simplification: the original hands a rendezvousing packet across by
//! reading straight out of the blocked task's suspended stack frame
//! (`wtask->sv`, a saved pointer). This crate's control blocks never hold
//! raw pointers, so a pending packet's *bytes* are copied into a per-task
//! slot on the pipe itself ([`PipeCb::pending`]) at wait time, and the
//! woken task's caller retrieves them with [`PipeCb::take_delivered`].

use crate::config::{NUM_PIPES, NUM_TASKS, PIPE_MAX_LENGTH, PIPE_MAX_WIDTH};
use crate::error::{KResult, KernelError};
use crate::lock::CpuLockToken;
use crate::pool::{Id, Pool};
use crate::task::{TaskId, TaskTable};
use crate::wait::{QueueOrder, WaitQueue, WakeReason};

pub type PipeId = Id<PipeCb>;
pub type PipeTable = Pool<PipeCb, NUM_PIPES>;

pub type Packet = [u8; PIPE_MAX_WIDTH];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Get,
    Put,
}

pub struct PipeCb {
    cells: [u8; PIPE_MAX_WIDTH * PIPE_MAX_LENGTH],
    width: usize,
    length: usize,
    rp: usize,
    wp: usize,
    full: bool,
    wait_queue: WaitQueue,
    wait_kind: Option<WaitKind>,
    /// Packet payload attached to a blocked task: a put-waiter's own
    /// packet (until a getter consumes it), or a packet handed to a
    /// get-waiter by a later put (until that getter's caller retrieves it).
    pending: [Packet; NUM_TASKS],
}

impl PipeCb {
    pub fn new(width: usize, length: usize) -> KResult<Self> {
        if width == 0 || length == 0 || width > PIPE_MAX_WIDTH || length > PIPE_MAX_LENGTH {
            return Err(KernelError::InvalidParam);
        }
        Ok(Self {
            cells: [0; PIPE_MAX_WIDTH * PIPE_MAX_LENGTH],
            width,
            length,
            rp: 0,
            wp: 0,
            full: false,
            wait_queue: WaitQueue::new(QueueOrder::Fifo),
            wait_kind: None,
            pending: [[0; PIPE_MAX_WIDTH]; NUM_TASKS],
        })
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.rp == self.wp
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    fn cell(&self, idx: usize) -> &[u8] {
        &self.cells[idx * self.width..idx * self.width + self.width]
    }

    fn cell_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.cells[idx * self.width..idx * self.width + self.width]
    }

    fn advance(idx: usize, length: usize) -> usize {
        if idx + 1 >= length {
            0
        } else {
            idx + 1
        }
    }

    fn get_pkt(&mut self) -> Packet {
        let mut out = [0u8; PIPE_MAX_WIDTH];
        out[..self.width].copy_from_slice(self.cell(self.rp));
        self.rp = Self::advance(self.rp, self.length);
        self.full = false;
        out
    }

    fn put_pkt(&mut self, pkt: &[u8], mode: PutMode) {
        match mode {
            PutMode::Back => {
                let wp = self.wp;
                self.cell_mut(wp)[..self.width].copy_from_slice(&pkt[..self.width]);
                self.wp = Self::advance(wp, self.length);
            }
            PutMode::Front => {
                self.rp = if self.rp == 0 { self.length - 1 } else { self.rp - 1 };
                let rp = self.rp;
                self.cell_mut(rp)[..self.width].copy_from_slice(&pkt[..self.width]);
            }
        }
        if self.wp == self.rp {
            self.full = true;
        }
    }

    /// `PipePutPktWait`: deliver `pkt` immediately (by rendezvous or into
    /// the buffer) or block `task` until there is room.
    pub fn put_wait(
        &mut self,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        task: TaskId,
        pkt: &[u8],
        mode: PutMode,
    ) -> KResult<bool> {
        if pkt.len() < self.width {
            return Err(KernelError::InvalidParam);
        }
        if self.wait_kind == Some(WaitKind::Get) {
            let getter = self.wait_queue.pop_first(tasks, token).expect("wait_kind implies a waiter");
            self.pending[getter.index()][..self.width].copy_from_slice(&pkt[..self.width]);
            if self.wait_queue.is_empty() {
                self.wait_kind = None;
            }
            tasks.get(getter).set_wait_result(token, WakeReason::Satisfied);
            return Ok(true);
        }
        if !self.full {
            self.put_pkt(pkt, mode);
            return Ok(true);
        }
        self.pending[task.index()][..self.width].copy_from_slice(&pkt[..self.width]);
        self.wait_kind = Some(WaitKind::Put);
        self.wait_queue.insert(tasks, token, task);
        Ok(false)
    }

    /// `PipeGetPktWait`: receive a packet immediately (by rendezvous or
    /// from the buffer) or block `task` until one arrives.
    pub fn get_wait(
        &mut self,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        task: TaskId,
    ) -> Option<Packet> {
        if self.wait_kind == Some(WaitKind::Put) {
            let putter = self.wait_queue.pop_first(tasks, token).expect("wait_kind implies a waiter");
            let putter_pkt = self.pending[putter.index()];
            let out = if self.is_empty() {
                // Empty buffer: rendezvous directly, skip the cells.
                putter_pkt
            } else {
                let front = self.get_pkt();
                self.put_pkt(&putter_pkt, PutMode::Back);
                front
            };
            if self.wait_queue.is_empty() {
                self.wait_kind = None;
            }
            tasks.get(putter).set_wait_result(token, WakeReason::Satisfied);
            return Some(out);
        }
        if !self.is_empty() {
            return Some(self.get_pkt());
        }
        self.wait_kind = Some(WaitKind::Get);
        self.wait_queue.insert(tasks, token, task);
        None
    }

    /// Retrieve a packet handed to `task` by a rendezvousing put while it
    /// was asleep (spec.md §4.7; see module docs for why this is a
    /// separate step instead of a silent write-back into a caller pointer).
    pub fn take_delivered(&mut self, task: TaskId) -> Packet {
        core::mem::replace(&mut self.pending[task.index()], [0; PIPE_MAX_WIDTH])
    }

    pub fn cancel_wait(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken, task: TaskId) {
        self.wait_queue.remove(tasks, token, task);
        if self.wait_queue.is_empty() {
            self.wait_kind = None;
        }
    }

    /// `PipeClear`: resume every waiter with failure and reset pointers.
    pub fn clear(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken) {
        self.wait_queue.drain(tasks, token, |tasks, token, waiter| {
            tasks.get(waiter).set_wait_result(token, WakeReason::Interrupted);
        });
        self.wait_kind = None;
        self.rp = 0;
        self.wp = 0;
        self.full = false;
    }
}

pub fn create(table: &mut PipeTable, width: usize, length: usize) -> KResult<PipeId> {
    table
        .insert(PipeCb::new(width, length)?)
        .ok_or(KernelError::OutOfControlBlocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::CpuLockToken;
    use crate::task::TaskTable;

    #[test]
    fn put_then_get_round_trips_through_the_buffer() {
        let mut pipe = PipeCb::new(2, 4).unwrap();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let t = tasks.spawn_for_test(5);
            assert_eq!(pipe.put_wait(&mut tasks, &mut token, t, &[1, 2], PutMode::Back).unwrap(), true);
            let got = pipe.get_wait(&mut tasks, &mut token, t).unwrap();
            assert_eq!(&got[..2], &[1, 2]);
        }
    }

    #[test]
    fn getter_waiting_is_served_directly_by_a_later_put() {
        let mut pipe = PipeCb::new(2, 4).unwrap();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let getter = tasks.spawn_for_test(5);
            assert_eq!(pipe.get_wait(&mut tasks, &mut token, getter), None);

            let putter = tasks.spawn_for_test(5);
            assert_eq!(
                pipe.put_wait(&mut tasks, &mut token, putter, &[9, 9], PutMode::Back).unwrap(),
                true
            );
            assert_eq!(
                tasks.get(getter).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
            assert_eq!(&pipe.take_delivered(getter)[..2], &[9, 9]);
        }
    }

    #[test]
    fn full_pipe_blocks_the_putter_until_space_frees_up() {
        let mut pipe = PipeCb::new(1, 2).unwrap();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let t = tasks.spawn_for_test(5);
            assert!(pipe.put_wait(&mut tasks, &mut token, t, &[1], PutMode::Back).unwrap());
            assert!(pipe.put_wait(&mut tasks, &mut token, t, &[2], PutMode::Back).unwrap());
            assert!(pipe.is_full());

            let putter = tasks.spawn_for_test(5);
            assert_eq!(
                pipe.put_wait(&mut tasks, &mut token, putter, &[3], PutMode::Back).unwrap(),
                false
            );

            pipe.get_wait(&mut tasks, &mut token, t);
            assert_eq!(
                tasks.get(putter).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
        }
    }
}
