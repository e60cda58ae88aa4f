//! Message exchanges: NORMAL/PASS/BROADCAST rendezvous points for messages
//! (spec.md §3 "Message exchange", §4.6).
//!
//! Grounded in `original_source/XSMX/xmsg.c`'s `smx_MsgSend`/
//! `smx_MsgReceive`: a priority-ordered task queue (empty exchange) or a
//! priority-ordered message queue (empty waiters) depending on which side
//! arrived first, exactly mirroring the direct-handoff-or-enqueue shape
//! [`crate::sync::mutex`] and [`crate::sync::semaphore`] already use for
//! their own wait queues.

use crate::config::NUM_EXCHANGES;
use crate::error::{KResult, KernelError};
use crate::lock::CpuLockToken;
use crate::msg::mcb::{MsgId, MsgOwner, MsgPool};
use crate::pool::{Id, Pool};
use crate::task::{TaskId, TaskSt, TaskTable};
use crate::wait::{QueueOrder, WaitQueue, WakeReason};

pub type ExchangeId = Id<ExchangeCb>;
pub type ExchangeTable = Pool<ExchangeCb, NUM_EXCHANGES>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    Normal,
    /// On receive, promote the receiver toward the message's priority; if
    /// `owner_promotion` is also set, incoming high-priority messages
    /// promote the exchange's last receiver the same way mutex inheritance
    /// promotes a lock holder (spec.md §4.6).
    Pass { owner_promotion: bool },
    /// A send delivers the message to every current waiter and also
    /// leaves it enqueued for the next receiver; a later send releases the
    /// previous broadcast message first (spec.md §4.6).
    Broadcast,
}

pub struct ExchangeCb {
    mode: ExchangeMode,
    msg_head: Option<MsgId>,
    wait_queue: WaitQueue,
    /// PASS mode: the task that most recently received from this exchange,
    /// kept as the promotion target for subsequent high-priority sends.
    owner: Option<TaskId>,
    broadcast_msg: Option<MsgId>,
}

impl ExchangeCb {
    pub fn new(mode: ExchangeMode) -> Self {
        Self {
            mode,
            msg_head: None,
            wait_queue: WaitQueue::new(QueueOrder::Priority),
            owner: None,
            broadcast_msg: None,
        }
    }

    pub fn mode(&self) -> ExchangeMode {
        self.mode
    }

    pub fn has_messages(&self) -> bool {
        self.msg_head.is_some()
    }

    fn enqueue_msg(&mut self, msgs: &mut MsgPool, id: MsgId) {
        let pri = msgs.get(id).expect("live message").priority();
        let mut prev: Option<MsgId> = None;
        let mut cur = self.msg_head;
        while let Some(c) = cur {
            if msgs.get(c).expect("live message").priority() > pri {
                break;
            }
            prev = Some(c);
            cur = msgs.get(c).expect("live message").link;
        }
        msgs.get_mut(id).expect("live message").link = cur;
        match prev {
            Some(p) => msgs.get_mut(p).expect("live message").link = Some(id),
            None => self.msg_head = Some(id),
        }
    }

    fn pop_msg(&mut self, msgs: &mut MsgPool) -> Option<MsgId> {
        let id = self.msg_head?;
        self.msg_head = msgs.get(id).expect("live message").link;
        msgs.get_mut(id).expect("live message").link = None;
        Some(id)
    }

    /// Raise `task`'s priority to `new_pri` unconditionally, or lower it to
    /// `new_pri` only when `owns_mutex` is false (spec.md §4.6 "down only if
    /// the receiver owns no mutex"), repositioning it in the ready queue if
    /// it is currently runnable.
    fn adjust_priority(
        &self,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        task: TaskId,
        new_pri: u8,
        owns_mutex: bool,
    ) {
        let cur = tasks.get(task).priority(token);
        let should_apply = new_pri < cur || (new_pri > cur && !owns_mutex);
        if !should_apply {
            return;
        }
        tasks.get(task).set_effective_priority(token, new_pri);
        if tasks.get(task).state(token) == TaskSt::Ready {
            tasks.reposition_ready(token, task, cur as usize, new_pri as usize);
        }
    }

    fn deliver(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken, task: TaskId, msg: MsgId) {
        tasks.get(task).set_rv(token, msg.index() as u32 + 1);
        tasks.get(task).set_wait_result(token, WakeReason::Satisfied);
    }

    /// `MsgSend`: deliver `msg` through this exchange. `self_id` is this
    /// control block's own handle, needed only so a broadcast message can
    /// record the exchange as its interim owner. `receiver_owns_mutex`
    /// lets the caller answer "does this task currently hold a mutex?"
    /// without this module depending on [`crate::sync::mutex`] directly.
    pub fn send(
        &mut self,
        self_id: ExchangeId,
        msgs: &mut MsgPool,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        msg: MsgId,
        receiver_owns_mutex: impl Fn(TaskId) -> bool,
    ) -> KResult<()> {
        let msg_pri = msgs.get(msg).ok_or(KernelError::InvalidObject)?.priority();

        if self.mode == ExchangeMode::Broadcast {
            self.wait_queue.drain(tasks, token, |tasks, token, waiter| {
                tasks.get(waiter).set_rv(token, msg.index() as u32 + 1);
                tasks.get(waiter).set_wait_result(token, WakeReason::Satisfied);
            });
            if let Some(prev) = self.broadcast_msg.take() {
                // Nobody else can own a released broadcast message; drop it
                // directly rather than going through the owner-checked
                // `unmake` path.
                if msgs.contains(prev) {
                    msgs.remove(prev);
                }
            }
            msgs.get_mut(msg).expect("live message").set_owner(MsgOwner::Exchange(self_id));
            self.broadcast_msg = Some(msg);
            self.enqueue_msg(msgs, msg);
            return Ok(());
        }

        if let Some(waiter) = self.wait_queue.pop_first(tasks, token) {
            msgs.get_mut(msg).expect("live message").set_owner(MsgOwner::Task(waiter));
            if let ExchangeMode::Pass { owner_promotion } = self.mode {
                self.adjust_priority(tasks, token, waiter, msg_pri, receiver_owns_mutex(waiter));
                if owner_promotion {
                    self.owner = Some(waiter);
                }
            }
            self.deliver(tasks, token, waiter, msg);
            return Ok(());
        }

        if let ExchangeMode::Pass { owner_promotion: true } = self.mode {
            if let Some(owner) = self.owner {
                self.adjust_priority(tasks, token, owner, msg_pri, receiver_owns_mutex(owner));
            }
        }
        self.enqueue_msg(msgs, msg);
        Ok(())
    }

    /// `MsgReceive`: take the next message, or block `task` if none is
    /// queued. Returns the message immediately available, if any.
    pub fn receive(
        &mut self,
        msgs: &mut MsgPool,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
        task: TaskId,
    ) -> Option<MsgId> {
        if let Some(msg) = self.pop_msg(msgs) {
            msgs.get_mut(msg).expect("live message").set_owner(MsgOwner::Task(task));
            return Some(msg);
        }
        self.wait_queue.insert(tasks, token, task);
        None
    }

    /// Remove `task` from the wait queue before it is satisfied (timeout).
    pub fn cancel_wait(&mut self, tasks: &mut TaskTable, token: &mut CpuLockToken, task: TaskId) {
        self.wait_queue.remove(tasks, token, task);
    }

    /// `MsgBump` (spec.md §6, SPEC_FULL.md §E): move a still-queued message
    /// to the tail of its own priority run without changing its priority.
    /// A no-op if `msg` is not currently queued on this exchange (e.g. it
    /// was already delivered).
    pub fn bump_msg(&mut self, msgs: &mut MsgPool, msg: MsgId) {
        if !self.unlink_msg(msgs, msg) {
            return;
        }
        self.enqueue_msg(msgs, msg);
    }

    /// Remove `msg` from the message queue if present, returning whether it
    /// was found. Used by [`Self::bump_msg`]; a general-purpose removal
    /// primitive rather than only a head-pop like [`Self::pop_msg`].
    fn unlink_msg(&mut self, msgs: &mut MsgPool, msg: MsgId) -> bool {
        if self.msg_head == Some(msg) {
            self.msg_head = msgs.get(msg).expect("live message").link;
            msgs.get_mut(msg).expect("live message").link = None;
            return true;
        }
        let mut cur = self.msg_head;
        while let Some(c) = cur {
            let next = msgs.get(c).expect("live message").link;
            if next == Some(msg) {
                let after = msgs.get(msg).expect("live message").link;
                msgs.get_mut(c).expect("live message").link = after;
                msgs.get_mut(msg).expect("live message").link = None;
                return true;
            }
            cur = next;
        }
        false
    }

    /// `MsgXchgClear`: resume every waiting task with a failure return and
    /// discard any still-queued messages' ownership back to the exchange
    /// (the caller is expected to free them via [`crate::msg::mcb::unmake`]
    /// afterward, since this module cannot reach the underlying heap/pool).
    pub fn clear(
        &mut self,
        msgs: &mut MsgPool,
        tasks: &mut TaskTable,
        token: &mut CpuLockToken,
    ) -> arrayvec::ArrayVec<MsgId, { crate::config::NUM_MESSAGES }> {
        self.wait_queue.drain(tasks, token, |tasks, token, waiter| {
            tasks.get(waiter).set_wait_result(token, WakeReason::Interrupted);
        });
        let mut drained = arrayvec::ArrayVec::new();
        while let Some(m) = self.pop_msg(msgs) {
            let _ = drained.try_push(m);
        }
        self.broadcast_msg = None;
        drained
    }
}

pub fn create(table: &mut ExchangeTable, mode: ExchangeMode) -> KResult<ExchangeId> {
    table.insert(ExchangeCb::new(mode)).ok_or(KernelError::OutOfControlBlocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::CpuLockToken;
    use crate::msg::mcb::{self, BlockSource};
    use crate::task::TaskTable;

    fn no_mutex(_: TaskId) -> bool {
        false
    }

    #[test]
    fn normal_send_before_any_receiver_queues_the_message() {
        let mut table = ExchangeTable::new_empty();
        let mut msgs = MsgPool::new_empty();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let sender = tasks.spawn_for_test(10);
            let xchg_id = create(&mut table, ExchangeMode::Normal).unwrap();
            let xchg = table.get_mut(xchg_id).unwrap();
            let msg = mcb::make(&mut msgs, 0x10, BlockSource::Standalone, sender, 5, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, msg, no_mutex).unwrap();
            assert!(xchg.has_messages());

            let receiver = tasks.spawn_for_test(10);
            let got = xchg.receive(&mut msgs, &mut tasks, &mut token, receiver);
            assert_eq!(got, Some(msg));
        }
    }

    #[test]
    fn receiver_waiting_first_gets_message_directly() {
        let mut table = ExchangeTable::new_empty();
        let mut msgs = MsgPool::new_empty();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let xchg_id = create(&mut table, ExchangeMode::Normal).unwrap();
            let xchg = table.get_mut(xchg_id).unwrap();
            let receiver = tasks.spawn_for_test(10);
            assert_eq!(xchg.receive(&mut msgs, &mut tasks, &mut token, receiver), None);

            let sender = tasks.spawn_for_test(10);
            let msg = mcb::make(&mut msgs, 0x20, BlockSource::Standalone, sender, 5, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, msg, no_mutex).unwrap();
            assert_eq!(
                tasks.get(receiver).take_wait_result(&mut token),
                Some(WakeReason::Satisfied)
            );
            assert_eq!(tasks.get(receiver).rv(&token), msg.index() as u32 + 1);
        }
    }

    #[test]
    fn pass_mode_promotes_receiver_priority_upward() {
        let mut table = ExchangeTable::new_empty();
        let mut msgs = MsgPool::new_empty();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let xchg_id = create(
                &mut table,
                ExchangeMode::Pass { owner_promotion: false },
            )
            .unwrap();
            let xchg = table.get_mut(xchg_id).unwrap();
            let receiver = tasks.spawn_for_test(20);
            xchg.receive(&mut msgs, &mut tasks, &mut token, receiver);

            let sender = tasks.spawn_for_test(1);
            let msg = mcb::make(&mut msgs, 0x30, BlockSource::Standalone, sender, 1, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, msg, no_mutex).unwrap();
            assert_eq!(tasks.get(receiver).priority(&token), 1);
        }
    }

    #[test]
    fn bump_msg_moves_a_queued_message_behind_its_equal_priority_peer() {
        let mut table = ExchangeTable::new_empty();
        let mut msgs = MsgPool::new_empty();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let xchg_id = create(&mut table, ExchangeMode::Normal).unwrap();
            let xchg = table.get_mut(xchg_id).unwrap();
            let sender = tasks.spawn_for_test(10);
            let m1 = mcb::make(&mut msgs, 0x10, BlockSource::Standalone, sender, 5, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, m1, no_mutex).unwrap();
            let m2 = mcb::make(&mut msgs, 0x20, BlockSource::Standalone, sender, 5, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, m2, no_mutex).unwrap();

            xchg.bump_msg(&mut msgs, m1);

            let receiver = tasks.spawn_for_test(10);
            assert_eq!(xchg.receive(&mut msgs, &mut tasks, &mut token, receiver), Some(m2));
        }
    }

    #[test]
    fn bump_msg_on_an_already_delivered_message_is_a_no_op() {
        let mut table = ExchangeTable::new_empty();
        let mut msgs = MsgPool::new_empty();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let xchg_id = create(&mut table, ExchangeMode::Normal).unwrap();
            let xchg = table.get_mut(xchg_id).unwrap();
            let sender = tasks.spawn_for_test(10);
            let msg = mcb::make(&mut msgs, 0x10, BlockSource::Standalone, sender, 5, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, msg, no_mutex).unwrap();
            let receiver = tasks.spawn_for_test(10);
            assert_eq!(xchg.receive(&mut msgs, &mut tasks, &mut token, receiver), Some(msg));

            xchg.bump_msg(&mut msgs, msg);
            assert!(!xchg.has_messages());
        }
    }

    #[test]
    fn broadcast_releases_previous_message_on_next_send() {
        let mut table = ExchangeTable::new_empty();
        let mut msgs = MsgPool::new_empty();
        let mut tasks = TaskTable::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let xchg_id = create(&mut table, ExchangeMode::Broadcast).unwrap();
            let xchg = table.get_mut(xchg_id).unwrap();
            let sender = tasks.spawn_for_test(10);
            let m1 = mcb::make(&mut msgs, 0x40, BlockSource::Standalone, sender, 5, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, m1, no_mutex).unwrap();
            assert!(msgs.contains(m1));

            let m2 = mcb::make(&mut msgs, 0x50, BlockSource::Standalone, sender, 5, None, false).unwrap();
            xchg.send(xchg_id, &mut msgs, &mut tasks, &mut token, m2, no_mutex).unwrap();
            assert!(!msgs.contains(m1));
            assert!(msgs.contains(m2));
        }
    }
}
