//! Error manager and diagnostic event buffer (spec.md §6–7, SPEC_FULL.md §B).
//!
//! Grounded in `original_source/XSMX/xem.c`'s `smx_EM`/`smx_EMClear` (the
//! last-error slot, per-code and total counters, and the error ring) and
//! `xevb.c`'s event buffer. The original's `sb_MsgOut` console line becomes
//! a `log::warn!` call (SPEC_FULL.md §C) and `smx_EMHook` becomes the
//! `Option<fn(...)>` user hook.

use crate::config::{ERROR_BUF_LEN, EVENT_BUF_LEN};
use crate::error::KernelError;

/// Tags a live handle for diagnostics without borrowing its control block
/// (spec.md §6 handle table; `original_source/XSMX/xht.c`'s `HTREC` pairs a
/// raw `void*` with a name — here the tag names the *kind* of object so the
/// error/event buffers stay meaningful without a typed `Id<T>` per variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectTag {
    Task(u16),
    Semaphore(u16),
    Mutex(u16),
    EventGroup(u16),
    EventQueue(u16),
    Exchange(u16),
    Message(u16),
    Pipe(u16),
    Timer(u16),
    Heap,
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorRecord {
    pub etime: u32,
    pub err: KernelError,
    pub object: ObjectTag,
}

/// One record of the diagnostic event buffer (spec.md §6): "a
/// word-prefixed record carrying record-type, length, wall time, and
/// payload words". Payload is capped at 4 words; longer records (none are
/// currently emitted) would need a variable-length ring, out of scope.
#[derive(Debug, Clone, Copy)]
pub struct EventRecord {
    pub etime: u32,
    pub kind: EventKind,
    pub payload: [u32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SsrEnter,
    SsrExit,
    IsrEnter,
    IsrExit,
    LsrEnter,
    LsrExit,
    TaskStart,
    TaskResume,
    TaskAutoStop,
    Error,
    User,
}

struct Ring<T: Copy, const N: usize> {
    buf: [Option<T>; N],
    next: usize,
}

impl<T: Copy, const N: usize> Ring<T, N> {
    const fn new() -> Self {
        Self {
            buf: [None; N],
            next: 0,
        }
    }

    fn push(&mut self, item: T) {
        self.buf[self.next] = Some(item);
        self.next = (self.next + 1) % N;
    }

    fn clear(&mut self) {
        self.buf = [None; N];
        self.next = 0;
    }

    fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.buf.iter().filter_map(|e| *e)
    }
}

pub type ErrorHook = fn(KernelError, ObjectTag);

/// `smx_EM`/`smx_errctr`/`smx_errctrs`/error buffer/event buffer, rolled
/// into one owned struct (the original keeps each as a separate global).
pub struct ErrorManager {
    last_error: Option<KernelError>,
    total: u32,
    per_code: [u32; KernelError::COUNT],
    errors: Ring<ErrorRecord, ERROR_BUF_LEN>,
    events: Ring<EventRecord, EVENT_BUF_LEN>,
    hook: Option<ErrorHook>,
}

impl ErrorManager {
    pub const fn new() -> Self {
        Self {
            last_error: None,
            total: 0,
            per_code: [0; KernelError::COUNT],
            errors: Ring::new(),
            events: Ring::new(),
            hook: None,
        }
    }

    pub fn set_hook(&mut self, hook: Option<ErrorHook>) {
        self.hook = hook;
    }

    /// `smx_EM`: record `err` against `object` at `etime`, then invoke the
    /// user hook. Called at every public entry point's failure return.
    pub fn report(&mut self, etime: u32, err: KernelError, object: ObjectTag) {
        self.last_error = Some(err);
        self.total += 1;
        self.per_code[err as usize] += 1;
        self.errors.push(ErrorRecord { etime, err, object });
        self.events.push(EventRecord {
            etime,
            kind: EventKind::Error,
            payload: [err as u32, 0, 0, 0],
        });
        log::warn!("{:?} on {:?}", err, object);
        if let Some(hook) = self.hook {
            hook(err, object);
        }
    }

    pub fn log_event(&mut self, etime: u32, kind: EventKind, payload: [u32; 4]) {
        self.events.push(EventRecord { etime, kind, payload });
    }

    pub fn last_error(&self) -> Option<KernelError> {
        self.last_error
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count_of(&self, err: KernelError) -> u32 {
        self.per_code[err as usize]
    }

    pub fn errors(&self) -> impl Iterator<Item = ErrorRecord> + '_ {
        self.errors.iter()
    }

    pub fn events(&self) -> impl Iterator<Item = EventRecord> + '_ {
        self.events.iter()
    }

    /// `smx_EMClear`.
    pub fn clear(&mut self) {
        self.last_error = None;
        self.total = 0;
        self.per_code = [0; KernelError::COUNT];
        self.errors.clear();
        self.events.clear();
    }
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_updates_last_error_and_counters() {
        let mut em = ErrorManager::new();
        em.report(10, KernelError::InvalidParam, ObjectTag::None);
        em.report(11, KernelError::InvalidParam, ObjectTag::Task(1));
        assert_eq!(em.last_error(), Some(KernelError::InvalidParam));
        assert_eq!(em.total(), 2);
        assert_eq!(em.count_of(KernelError::InvalidParam), 2);
        assert_eq!(em.count_of(KernelError::OutOfControlBlocks), 0);
    }

    #[test]
    fn error_ring_wraps_without_growing() {
        let mut em = ErrorManager::new();
        for i in 0..(ERROR_BUF_LEN as u32 + 3) {
            em.report(i, KernelError::Timeout, ObjectTag::None);
        }
        assert_eq!(em.errors().count(), ERROR_BUF_LEN);
    }

    #[test]
    fn hook_is_invoked_on_report() {
        static HIT: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
        fn hook(_err: KernelError, _obj: ObjectTag) {
            HIT.store(true, core::sync::atomic::Ordering::SeqCst);
        }
        let mut em = ErrorManager::new();
        em.set_hook(Some(hook));
        em.report(0, KernelError::InvalidObject, ObjectTag::None);
        assert!(HIT.load(core::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn clear_resets_everything() {
        let mut em = ErrorManager::new();
        em.report(0, KernelError::InvalidObject, ObjectTag::None);
        em.clear();
        assert_eq!(em.last_error(), None);
        assert_eq!(em.total(), 0);
        assert_eq!(em.errors().count(), 0);
    }
}
