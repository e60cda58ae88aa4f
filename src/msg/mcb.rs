//! Message control blocks (spec.md §3 "Message (MCB)", §4.6).
//!
//! Grounded in `original_source/XSMX/xmsg.c`'s `MCB` and the helpers that
//! create/destroy one (`smx_MsgMake`/`smx_MsgUnmake` family); the reply
//! index and owner fields mirror the same struct's `rxi`/`fl`/`pri` usage
//! seen throughout `smx_MsgSend`/`smx_MsgReceive`.

use crate::config::NUM_MESSAGES;
use crate::error::{KResult, KernelError};
use crate::msg::exchange::ExchangeId;
use crate::pool::{Id, Pool};
use crate::task::TaskId;

pub type MsgId = Id<Mcb>;
pub type MsgPool = Pool<Mcb, NUM_MESSAGES>;

/// Where the block referenced by a message's `block` pointer came from, so
/// `MsgRel`/delete know how to give it back (spec.md §3: "either a heap
/// number or a pool handle or −1 for standalone").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Heap(u8),
    Pool(u8),
    /// Caller-managed memory the kernel never frees.
    Standalone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOwner {
    Task(TaskId),
    Exchange(ExchangeId),
    None,
}

/// A message control block. `block` is an opaque handle to the payload (an
/// offset into whichever heap or pool `source` names) — this module never
/// interprets it, only tracks who may send/release it.
pub struct Mcb {
    block: u32,
    source: BlockSource,
    owner: MsgOwner,
    priority: u8,
    /// Reply exchange index; `None` encodes the original's 0xFF "no reply".
    reply_exchange: Option<ExchangeId>,
    /// Sender keeps ownership and binds client/server identity on the
    /// exchange for the receive side's MPU hand-off (spec.md §4.6, §4.11).
    bound: bool,
    /// Next message in an exchange's priority-ordered queue.
    pub(crate) link: Option<MsgId>,
}

impl Mcb {
    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn source(&self) -> BlockSource {
        self.source
    }

    pub fn owner(&self) -> MsgOwner {
        self.owner
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub fn reply_exchange(&self) -> Option<ExchangeId> {
        self.reply_exchange
    }

    pub fn bound(&self) -> bool {
        self.bound
    }

    /// `MsgRel`/`MsgReceive`: only the current owner may act on a message.
    pub fn owned_by_task(&self, task: TaskId) -> bool {
        self.owner == MsgOwner::Task(task)
    }

    pub(crate) fn set_owner(&mut self, owner: MsgOwner) {
        self.owner = owner;
    }
}

/// `MsgMake`: build an MCB around a caller-supplied block.
#[allow(clippy::too_many_arguments)]
pub fn make(
    pool: &mut MsgPool,
    block: u32,
    source: BlockSource,
    owner: TaskId,
    priority: u8,
    reply_exchange: Option<ExchangeId>,
    bound: bool,
) -> KResult<MsgId> {
    pool.insert(Mcb {
        block,
        source,
        owner: MsgOwner::Task(owner),
        priority,
        reply_exchange,
        bound,
        link: None,
    })
    .ok_or(KernelError::OutOfControlBlocks)
}

/// `MsgUnmake`: tear down an MCB, returning its block handle and source so
/// the caller (or the owning exchange/heap) can release the underlying
/// memory. Fails if `task` does not currently own the message.
pub fn unmake(pool: &mut MsgPool, id: MsgId, task: TaskId) -> KResult<(u32, BlockSource)> {
    let mcb = pool.get(id).ok_or(KernelError::InvalidObject)?;
    if !mcb.owned_by_task(task) {
        return Err(KernelError::NotMessageOwner);
    }
    let (block, source) = (mcb.block, mcb.source);
    pool.remove(id);
    Ok((block, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskTable;

    #[test]
    fn unmake_by_non_owner_is_rejected() {
        let mut pool = MsgPool::new_empty();
        let mut tasks = TaskTable::new();
        let owner = tasks.spawn_for_test(10);
        let other = tasks.spawn_for_test(10);
        let id = make(&mut pool, 0x100, BlockSource::Standalone, owner, 10, None, false).unwrap();
        assert_eq!(unmake(&mut pool, id, other), Err(KernelError::NotMessageOwner));
    }
}
