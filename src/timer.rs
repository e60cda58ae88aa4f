//! The differential-count timer queue (spec.md §3 "Timer", §4.3 "Timer
//! queue").
//!
//! `tq` is a singly-linked list of timers ordered by delta-count, with the
//! invariant that the sum of deltas from the head through any timer `t`
//! equals the number of ticks from now until `t` fires. This is the
//! differential design the original source uses (`XSMX/xtmr.c`), kept as-is
//! per spec.md (the teacher's own timer subsystem, `r3_kernel::timeout`,
//! uses an unrelated binary-heap design that this crate deliberately does
//! not copy — see `DESIGN.md`).

use crate::config::NUM_TIMERS;
use crate::error::{KernelError, KResult};
use crate::lock::CpuLockToken;
use crate::lsr::LsrFn;
use crate::pool::{Id, Pool};
use crate::task::TaskId;

pub type TimerId = Id<Timer>;

bitflags::bitflags! {
    pub struct TimerFlags: u8 {
        /// Current pulse phase: set = HI, clear = LO (spec.md §4.3 "Pulse
        /// mode").
        const PULSE_HI = 1 << 0;
        /// The LSR callback parameter is the current pulse phase rather
        /// than the configured literal parameter.
        const PARAM_IS_PHASE = 1 << 1;
        /// The LSR callback parameter is the current `etime`.
        const PARAM_IS_ETIME = 1 << 2;
        /// The LSR callback parameter is the current fire count.
        const PARAM_IS_FIRE_COUNT = 1 << 3;
    }
}

pub struct Timer {
    /// Ticks remaining after the previous timer in `tq` fires (0 if this is
    /// the head).
    delta: u32,
    next: Option<TimerId>,
    /// Reload period; 0 means one-shot (spec.md §3).
    pub period: u32,
    pub pulse_width: u32,
    pub flags: TimerFlags,
    pub lsr: LsrFn,
    pub callback_param: u32,
    pub fire_count: u32,
    pub owner: Option<TaskId>,
}

impl Timer {
    fn new(delta: u32, period: u32, pulse_width: u32, lsr: LsrFn, callback_param: u32) -> Self {
        Self {
            delta,
            next: None,
            period,
            pulse_width,
            flags: TimerFlags::empty(),
            lsr,
            callback_param,
            fire_count: 0,
            owner: None,
        }
    }

    fn effective_next_delay(&self) -> u32 {
        if self.pulse_width > 0 && self.period > 0 {
            if self.flags.contains(TimerFlags::PULSE_HI) {
                self.period - self.pulse_width
            } else {
                self.pulse_width
            }
        } else {
            self.period
        }
    }

    fn callback_arg(&self, etime: u32) -> u32 {
        if self.flags.contains(TimerFlags::PARAM_IS_PHASE) {
            self.flags.contains(TimerFlags::PULSE_HI) as u32
        } else if self.flags.contains(TimerFlags::PARAM_IS_ETIME) {
            etime
        } else if self.flags.contains(TimerFlags::PARAM_IS_FIRE_COUNT) {
            self.fire_count
        } else {
            self.callback_param
        }
    }
}

pub struct TimerQueue {
    pool: Pool<Timer, NUM_TIMERS>,
    head: Option<TimerId>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            pool: Pool::new_empty(),
            head: None,
        }
    }

    /// Insert a timer to fire `delay_ticks` from now (`TimerStart`, spec.md
    /// §6). Walks the list subtracting `delay_ticks` against each node's
    /// delta until the remaining amount is less than the next node's delta,
    /// splicing in there and reducing the following node's delta by the
    /// inserted node's delta so the sum-of-deltas invariant holds.
    pub fn start(
        &mut self,
        _token: &mut CpuLockToken,
        delay_ticks: u32,
        period: u32,
        pulse_width: u32,
        lsr: LsrFn,
        callback_param: u32,
    ) -> KResult<TimerId> {
        if delay_ticks == 0 {
            return Err(KernelError::InvalidTime);
        }
        let timer = Timer::new(delay_ticks, period, pulse_width, lsr, callback_param);
        let id = self
            .pool
            .insert(timer)
            .ok_or(KernelError::OutOfControlBlocks)?;
        self.splice_in(id, delay_ticks);
        Ok(id)
    }

    fn splice_in(&mut self, id: TimerId, mut remaining: u32) {
        let mut prev: Option<TimerId> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            let c_delta = self.pool.get(c).unwrap().delta;
            if remaining < c_delta {
                break;
            }
            remaining -= c_delta;
            prev = Some(c);
            cur = self.pool.get(c).unwrap().next;
        }
        if let Some(c) = cur {
            self.pool.get_mut(c).unwrap().delta -= remaining;
        }
        {
            let t = self.pool.get_mut(id).unwrap();
            t.delta = remaining;
            t.next = cur;
        }
        match prev {
            Some(p) => self.pool.get_mut(p).unwrap().next = Some(id),
            None => self.head = Some(id),
        }
    }

    fn unlink(&mut self, id: TimerId) {
        let next = self.pool.get(id).unwrap().next;
        let delta = self.pool.get(id).unwrap().delta;
        if self.head == Some(id) {
            self.head = next;
            if let Some(n) = next {
                self.pool.get_mut(n).unwrap().delta += delta;
            }
            return;
        }
        let mut cur = self.head;
        while let Some(c) = cur {
            let c_next = self.pool.get(c).unwrap().next;
            if c_next == Some(id) {
                self.pool.get_mut(c).unwrap().next = next;
                if let Some(n) = next {
                    self.pool.get_mut(n).unwrap().delta += delta;
                }
                return;
            }
            cur = c_next;
        }
    }

    /// Stop and free a timer (`TimerStop`).
    pub fn stop(&mut self, _token: &mut CpuLockToken, id: TimerId) -> KResult<()> {
        if !self.pool.contains(id) {
            return Err(KernelError::InvalidObject);
        }
        self.unlink(id);
        self.pool.remove(id);
        Ok(())
    }

    /// Advance one tick. Pops and fires every timer whose delta has reached
    /// zero, repeating while the new head's delta is also zero, per spec.md
    /// §4.3: "Repeats while `tq.head.delta == 0`." Cyclic/pulse timers are
    /// re-enqueued with their next delay; one-shots are released. This is
    /// the keep-time LSR's core step.
    pub fn tick(&mut self, token: &mut CpuLockToken, etime: u32) {
        let Some(head) = self.head else { return };
        self.pool.get_mut(head).unwrap().delta -= 1;
        while self.pool.get(self.head.unwrap()).unwrap().delta == 0 {
            let id = self.head.unwrap();
            self.head = self.pool.get(id).unwrap().next;

            let (lsr, fire_count, callback_param, period, flags) = {
                let t = self.pool.get_mut(id).unwrap();
                t.fire_count += 1;
                t.flags.toggle(TimerFlags::PULSE_HI);
                (t.lsr, t.fire_count, t.callback_param, t.period, t.flags)
            };
            let _ = callback_param;
            let _ = flags;
            let arg = self.pool.get(id).unwrap().callback_arg(etime);
            let _ = fire_count;

            if period == 0 {
                self.pool.remove(id);
            } else {
                let next_delay = self.pool.get(id).unwrap().effective_next_delay();
                self.splice_in(id, next_delay.max(1));
            }
            (lsr)(arg);

            if self.head.is_none() {
                break;
            }
            // LSRs invoked above may themselves start/stop timers, which is
            // permitted per spec.md §5 (LSRs "may call most services"); re-
            // read `token` implicitly through `self` on the next iteration.
            let _ = &token;
        }
    }

    /// Ticks remaining until the earliest timer fires, or `None` if the
    /// queue is empty.
    pub fn ticks_to_next(&self) -> Option<u32> {
        self.head.map(|h| self.pool.get(h).unwrap().delta)
    }

    /// Sum of deltas from the head through `id` — exposed for the invariant
    /// check in spec.md §8 ("Timer differentials") and reused by
    /// [`Self::peek`].
    pub fn absolute_delay_of(&self, id: TimerId) -> Option<u32> {
        let mut sum = 0u32;
        let mut cur = self.head;
        while let Some(c) = cur {
            sum += self.pool.get(c).unwrap().delta;
            if c == id {
                return Some(sum);
            }
            cur = self.pool.get(c).unwrap().next;
        }
        None
    }

    /// `TimerStartAbs`: start a timer to fire at absolute time `at`, given
    /// the current time `now`. Matches `TimerStart`'s wraparound-tolerant
    /// arithmetic (spec.md §3 "etime wraps"): if `at` has already passed,
    /// the wrapping subtraction yields a huge delay rather than a negative
    /// one, so callers that want "fire immediately" semantics for a past
    /// deadline should call `start` with a delay of `1` instead.
    pub fn start_abs(
        &mut self,
        token: &mut CpuLockToken,
        now: u32,
        at: u32,
        period: u32,
        pulse_width: u32,
        lsr: LsrFn,
        callback_param: u32,
    ) -> KResult<TimerId> {
        let delay = at.wrapping_sub(now);
        self.start(token, delay.max(1), period, pulse_width, lsr, callback_param)
    }

    /// `TimerReset`: re-splice an existing, still-live timer to fire
    /// `delay_ticks` from now, restarting its fire count and pulse phase
    /// without disturbing its callback/period/pulse-width configuration.
    pub fn reset(
        &mut self,
        _token: &mut CpuLockToken,
        id: TimerId,
        delay_ticks: u32,
    ) -> KResult<()> {
        if delay_ticks == 0 {
            return Err(KernelError::InvalidTime);
        }
        if !self.pool.contains(id) {
            return Err(KernelError::InvalidObject);
        }
        self.unlink(id);
        {
            let t = self.pool.get_mut(id).unwrap();
            t.fire_count = 0;
            t.flags.remove(TimerFlags::PULSE_HI);
        }
        self.splice_in(id, delay_ticks);
        Ok(())
    }

    /// `TimerSetLSR`: change the LSR a timer invokes on its next firing.
    pub fn set_lsr(&mut self, id: TimerId, lsr: LsrFn) -> KResult<()> {
        self.pool.get_mut(id).ok_or(KernelError::InvalidObject)?.lsr = lsr;
        Ok(())
    }

    /// `TimerSetPulse`: change a cyclic timer's pulse width (0 disables
    /// pulse mode, reverting to an even `period`-spaced firing).
    pub fn set_pulse(&mut self, id: TimerId, pulse_width: u32) -> KResult<()> {
        self.pool.get_mut(id).ok_or(KernelError::InvalidObject)?.pulse_width = pulse_width;
        Ok(())
    }

    /// `TimerPeek`: read a timer's current state without disturbing it.
    pub fn peek(&self, id: TimerId) -> Option<TimerPeek> {
        let t = self.pool.get(id)?;
        Some(TimerPeek {
            ticks_remaining: self.absolute_delay_of(id).unwrap_or(0),
            period: t.period,
            pulse_width: t.pulse_width,
            flags: t.flags,
            fire_count: t.fire_count,
            owner: t.owner,
        })
    }

    /// `TimerDup`: create a new, unstarted timer carrying the same
    /// period/pulse-width/LSR/callback-parameter/flag configuration as
    /// `id`. Needs no new data-model concept beyond the pool itself — the
    /// duplicate is simply never spliced into `tq` until the caller starts
    /// it, exactly like a timer that was stopped and not yet restarted.
    pub fn dup(&mut self, id: TimerId) -> KResult<TimerId> {
        let src = self.pool.get(id).ok_or(KernelError::InvalidObject)?;
        let mut copy = Timer::new(0, src.period, src.pulse_width, src.lsr, src.callback_param);
        copy.flags = src.flags & !TimerFlags::PULSE_HI;
        copy.owner = src.owner;
        self.pool.insert(copy).ok_or(KernelError::OutOfControlBlocks)
    }
}

/// Snapshot returned by [`TimerQueue::peek`] (`TimerPeek`, spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct TimerPeek {
    pub ticks_remaining: u32,
    pub period: u32,
    pub pulse_width: u32,
    pub flags: TimerFlags,
    pub fire_count: u32,
    pub owner: Option<TaskId>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn noop(_: u32) {}

    /// Bounded to `NUM_TIMERS` so every insertion in a generated sequence
    /// actually lands in the fixed-capacity pool.
    #[derive(Clone, Debug)]
    struct Delays(Vec<u32>);

    impl quickcheck::Arbitrary for Delays {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let mut v: Vec<u32> = Vec::arbitrary(g);
            v.truncate(NUM_TIMERS);
            v.iter_mut().for_each(|d| *d = *d % 10_000 + 1);
            Delays(v)
        }
    }

    /// Checks the core differential-list invariant (spec.md §8 "Timer
    /// differentials": sum of deltas from the head equals absolute delay)
    /// against a plain sorted-`Vec` reference model, for one-shot timers
    /// inserted in random order.
    #[quickcheck]
    fn differential_list_matches_sorted_reference(delays: Delays) -> bool {
        let mut tq = TimerQueue::new();
        let mut model: Vec<(TimerId, u32)> = Vec::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            for delay in delays.0 {
                let Ok(id) = tq.start(&mut token, delay, 0, 0, noop, 0) else {
                    return true; // pool exhausted; not what this test probes
                };
                model.push((id, delay));
            }
        }
        if model.is_empty() {
            return tq.ticks_to_next().is_none();
        }
        for &(id, delay) in &model {
            if tq.absolute_delay_of(id) != Some(delay) {
                return false;
            }
        }
        let min_delay = model.iter().map(|&(_, d)| d).min().unwrap();
        tq.ticks_to_next() == Some(min_delay)
    }

    #[test]
    fn differential_insertion_matches_spec_scenario() {
        // tq = [10, 5, 20] (absolute 10, 15, 35); insert at absolute 22.
        // Expected result: [10, 5, 7, 13] (absolute 10, 15, 22, 35).
        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let a = tq.start(&mut token, 10, 0, 0, noop, 0).unwrap();
            let b = tq.start(&mut token, 15, 0, 0, noop, 0).unwrap();
            let c = tq.start(&mut token, 35, 0, 0, noop, 0).unwrap();
            let d = tq.start(&mut token, 22, 0, 0, noop, 0).unwrap();

            assert_eq!(tq.absolute_delay_of(a), Some(10));
            assert_eq!(tq.absolute_delay_of(b), Some(15));
            assert_eq!(tq.absolute_delay_of(d), Some(22));
            assert_eq!(tq.absolute_delay_of(c), Some(35));
        }
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static COUNT: AtomicU32 = AtomicU32::new(0);
        fn bump(_: u32) {
            COUNT.fetch_add(1, Ordering::SeqCst);
        }
        COUNT.store(0, Ordering::SeqCst);

        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            tq.start(&mut token, 3, 0, 0, bump, 0).unwrap();
            for etime in 1..=5u32 {
                tq.tick(&mut token, etime);
            }
        }
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_timer_fires_every_period() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static COUNT: AtomicU32 = AtomicU32::new(0);
        fn bump(_: u32) {
            COUNT.fetch_add(1, Ordering::SeqCst);
        }
        COUNT.store(0, Ordering::SeqCst);

        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            tq.start(&mut token, 2, 2, 0, bump, 0).unwrap();
            for etime in 1..=10u32 {
                tq.tick(&mut token, etime);
            }
        }
        assert_eq!(COUNT.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn start_abs_computes_delay_from_now() {
        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let id = tq.start_abs(&mut token, 100, 107, 0, 0, noop, 0).unwrap();
            assert_eq!(tq.absolute_delay_of(id), Some(7));
        }
    }

    #[test]
    fn reset_restarts_fire_count_and_delay() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static COUNT: AtomicU32 = AtomicU32::new(0);
        fn bump(_: u32) {
            COUNT.fetch_add(1, Ordering::SeqCst);
        }
        COUNT.store(0, Ordering::SeqCst);

        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let id = tq.start(&mut token, 3, 0, 0, bump, 0).unwrap();
            tq.tick(&mut token, 1);
            tq.reset(&mut token, id, 5).unwrap();
            assert_eq!(tq.absolute_delay_of(id), Some(5));
            assert_eq!(tq.peek(id).unwrap().fire_count, 0);
        }
    }

    #[test]
    fn set_lsr_changes_the_callback_invoked_on_next_fire() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static FIRST: AtomicU32 = AtomicU32::new(0);
        static SECOND: AtomicU32 = AtomicU32::new(0);
        fn first(_: u32) {
            FIRST.fetch_add(1, Ordering::SeqCst);
        }
        fn second(_: u32) {
            SECOND.fetch_add(1, Ordering::SeqCst);
        }
        FIRST.store(0, Ordering::SeqCst);
        SECOND.store(0, Ordering::SeqCst);

        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let id = tq.start(&mut token, 2, 0, 0, first, 0).unwrap();
            tq.set_lsr(id, second).unwrap();
            tq.tick(&mut token, 1);
            tq.tick(&mut token, 2);
        }
        assert_eq!(FIRST.load(Ordering::SeqCst), 0);
        assert_eq!(SECOND.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_pulse_changes_pulse_width() {
        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let id = tq.start(&mut token, 10, 5, 0, noop, 0).unwrap();
            tq.set_pulse(id, 3).unwrap();
            assert_eq!(tq.peek(id).unwrap().pulse_width, 3);
        }
    }

    #[test]
    fn peek_reports_configuration_without_disturbing_the_timer() {
        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let id = tq.start(&mut token, 10, 5, 2, noop, 0).unwrap();
            let snap = tq.peek(id).unwrap();
            assert_eq!(snap.ticks_remaining, 10);
            assert_eq!(snap.period, 5);
            assert_eq!(snap.pulse_width, 2);
            assert_eq!(snap.fire_count, 0);
            assert_eq!(tq.absolute_delay_of(id), Some(10));
        }
    }

    #[test]
    fn dup_copies_configuration_into_an_unstarted_timer() {
        let mut tq = TimerQueue::new();
        unsafe {
            let mut token = CpuLockToken::new_unchecked();
            let id = tq.start(&mut token, 10, 5, 0, noop, 42).unwrap();
            let copy = tq.dup(id).unwrap();
            assert_ne!(id, copy);
            assert_eq!(tq.absolute_delay_of(copy), None);
            let snap = tq.peek(copy).unwrap();
            assert_eq!(snap.period, 5);
            assert_eq!(snap.ticks_remaining, 0);

            tq.start(&mut token, 3, 0, 0, noop, 0).unwrap();
            assert_eq!(tq.absolute_delay_of(id), Some(10));
        }
    }
}
