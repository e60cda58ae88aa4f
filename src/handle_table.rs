//! Diagnostic handle table (spec.md §6, SPEC_FULL.md §E).
//!
//! Grounded in `original_source/XSMX/xht.c`'s `smx_HTAdd`/`smx_HTDelete`:
//! a fixed-capacity array mapping a live handle to a name string, rejecting
//! duplicate names (`SMXE_HT_DUP`) and reporting when full
//! (`SMXE_HT_FULL`). Never consulted by scheduling or synchronization
//! logic — purely a debugger/monitor aid, matched by its gate here: no
//! other module in this crate calls into it.

use crate::config::HANDLE_TABLE_LEN;
use crate::errmgr::ObjectTag;
use crate::error::{KResult, KernelError};

struct Entry {
    tag: ObjectTag,
    name: &'static str,
}

pub struct HandleTable {
    entries: [Option<Entry>; HANDLE_TABLE_LEN],
}

impl HandleTable {
    pub const fn new() -> Self {
        const NONE: Option<Entry> = None;
        Self {
            entries: [NONE; HANDLE_TABLE_LEN],
        }
    }

    /// `smx_HTAdd`.
    pub fn add(&mut self, tag: ObjectTag, name: &'static str) -> KResult<()> {
        if self.entries.iter().flatten().any(|e| e.name == name) {
            return Err(KernelError::HandleTableDuplicate);
        }
        for slot in self.entries.iter_mut() {
            if slot.is_none() {
                *slot = Some(Entry { tag, name });
                return Ok(());
            }
        }
        Err(KernelError::HandleTableFull)
    }

    /// `smx_HTDelete`.
    pub fn remove(&mut self, tag: ObjectTag) -> bool {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(e) if e.tag == tag) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// `smx_HTGetHandle`, direction reversed (name lookup isn't needed by
    /// anything in this crate; tag lookup backs diagnostics instead).
    pub fn name_of(&self, tag: ObjectTag) -> Option<&'static str> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.tag == tag)
            .map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_name_is_rejected() {
        let mut ht = HandleTable::new();
        ht.add(ObjectTag::Task(1), "idle").unwrap();
        assert_eq!(
            ht.add(ObjectTag::Task(2), "idle"),
            Err(KernelError::HandleTableDuplicate)
        );
    }

    #[test]
    fn full_table_is_reported() {
        let mut ht = HandleTable::new();
        for i in 0..HANDLE_TABLE_LEN {
            ht.add(ObjectTag::Task(i as u16), Box::leak(format!("t{i}").into_boxed_str()))
                .unwrap();
        }
        assert_eq!(
            ht.add(ObjectTag::Task(9999), "overflow"),
            Err(KernelError::HandleTableFull)
        );
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let mut ht = HandleTable::new();
        ht.add(ObjectTag::Mutex(1), "m").unwrap();
        assert!(ht.remove(ObjectTag::Mutex(1)));
        assert!(!ht.remove(ObjectTag::Mutex(1)));
        ht.add(ObjectTag::Mutex(2), "m").unwrap();
    }
}
