//! Per-task timeout array with a cached running minimum (spec.md §3
//! "Timeout array", §4.3 "Timeout array").
//!
//! `timeout[task_index]` holds the absolute `etime` at which that task's
//! current wait expires, or [`INFINITE`]. `(tmo_min, tmo_indx)` caches the
//! earliest pending timeout so the keep-time LSR doesn't have to scan every
//! slot on every tick — only when the cached minimum itself fires does a
//! full rescan happen, which is also the only time the cache can go stale.

use crate::config::NUM_TASKS;
use crate::task::TaskId;
use crate::time::INFINITE;

pub struct TimeoutArray {
    timeout: [u32; NUM_TASKS],
    tmo_min: u32,
    tmo_indx: usize,
}

impl TimeoutArray {
    pub fn new() -> Self {
        Self {
            timeout: [INFINITE; NUM_TASKS],
            tmo_min: INFINITE,
            tmo_indx: 0,
        }
    }

    /// Arm `task`'s timeout for absolute tick `fire_at`. Updates the cached
    /// minimum in O(1) if this is now the earliest.
    pub fn arm(&mut self, task: TaskId, fire_at: u32) {
        let i = task.index();
        self.timeout[i] = fire_at;
        if fire_at < self.tmo_min {
            self.tmo_min = fire_at;
            self.tmo_indx = i;
        }
    }

    /// Disarm `task`'s timeout (the wait was satisfied, cancelled, or
    /// already fired). If this was the cached minimum, the cache is left
    /// stale and must be rebuilt by [`rebuild_min`](Self::rebuild_min) —
    /// exactly the rescan spec.md §4.3 describes happening whenever the
    /// minimum itself fires.
    pub fn disarm(&mut self, task: TaskId) {
        self.timeout[task.index()] = INFINITE;
    }

    pub fn at(&self, task: TaskId) -> u32 {
        self.timeout[task.index()]
    }

    pub fn min(&self) -> u32 {
        self.tmo_min
    }

    /// Whether any timeout could be due at `etime` — an O(1) check against
    /// the cached minimum, letting the keep-time LSR skip `due_at`'s full
    /// scan entirely on the common tick where nothing has expired.
    pub fn has_due(&self, etime: u32) -> bool {
        self.tmo_min <= etime
    }

    /// Rebuild `(tmo_min, tmo_indx)` by a full scan. Called after the
    /// currently-cached-minimum task's timeout fires (spec.md §4.3: "it
    /// resumes the timed-out task... then scans all slots to rebuild
    /// `(tmo_min, tmo_indx)`").
    pub fn rebuild_min(&mut self) {
        let mut min = INFINITE;
        let mut indx = 0;
        for (i, &t) in self.timeout.iter().enumerate() {
            if t < min {
                min = t;
                indx = i;
            }
        }
        self.tmo_min = min;
        self.tmo_indx = indx;
    }

    /// Every task index whose timeout is `<= etime` (there may be more than
    /// one at the same `etime`): the timeout LSR resumes all of them and
    /// keeps re-invoking itself "while another task has also expired"
    /// (spec.md §4.3).
    pub fn due_at(&self, etime: u32) -> impl Iterator<Item = TaskId> + '_ {
        self.timeout
            .iter()
            .enumerate()
            .filter(move |&(_, &t)| t != INFINITE && t <= etime)
            .map(|(i, _)| TaskId_from_index(i))
    }

    /// Apply the §4.3 rollover rule: if `etime >= 2^31` and every non-
    /// infinite timeout is also `>= 2^31`, clear that bit everywhere at
    /// once. Returns the folded `etime` the caller (the keep-time LSR)
    /// should now use, unchanged if folding did not apply.
    pub fn maybe_fold_rollover(&mut self, etime: u32) -> u32 {
        use crate::time::ROLLOVER_BIT;
        if etime & ROLLOVER_BIT == 0 {
            return etime;
        }
        let all_high_or_infinite = self
            .timeout
            .iter()
            .all(|&t| t == INFINITE || t & ROLLOVER_BIT != 0);
        if !all_high_or_infinite {
            return etime;
        }
        for t in self.timeout.iter_mut() {
            if *t != INFINITE {
                *t &= !ROLLOVER_BIT;
            }
        }
        if self.tmo_min != INFINITE {
            self.tmo_min &= !ROLLOVER_BIT;
        }
        etime & !ROLLOVER_BIT
    }
}

impl Default for TimeoutArray {
    fn default() -> Self {
        Self::new()
    }
}

// `TaskId` has no public from-index constructor (by design — it is only
// ever minted by `pool::Pool::insert`), but the timeout array is indexed
// directly by task pool index (spec.md §3: "a parallel array indexed by TCB
// index"), so it needs one solely for iterating `due_at`'s results back into
// the task table. This free function exists only to keep that one unsafe-
// adjacent cast (zero-based index -> handle) in a single, clearly-labeled
// spot rather than exposing it generally on `Id<T>`.
#[allow(non_snake_case)]
fn TaskId_from_index(i: usize) -> TaskId {
    crate::pool::id_from_zero_based_index(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_tracks_the_earliest_armed_timeout() {
        let mut ta = TimeoutArray::new();
        let a = crate::pool::id_from_zero_based_index(0);
        let b = crate::pool::id_from_zero_based_index(1);
        ta.arm(a, 100);
        assert_eq!(ta.min(), 100);
        ta.arm(b, 50);
        assert_eq!(ta.min(), 50);
        ta.disarm(b);
        // cache is stale until rebuilt, matching spec.md's "rescans on
        // firing" contract rather than eager incremental maintenance
        ta.rebuild_min();
        assert_eq!(ta.min(), 100);
    }

    #[test]
    fn has_due_skips_the_scan_until_the_cached_minimum_arrives() {
        let mut ta = TimeoutArray::new();
        assert!(!ta.has_due(0));
        let a = crate::pool::id_from_zero_based_index(0);
        ta.arm(a, 100);
        assert!(!ta.has_due(99));
        assert!(ta.has_due(100));
        assert!(ta.has_due(150));
    }

    #[test]
    fn rollover_folds_only_when_every_timeout_is_also_high() {
        use crate::time::ROLLOVER_BIT;
        let mut ta = TimeoutArray::new();
        let a = crate::pool::id_from_zero_based_index(0);
        ta.arm(a, ROLLOVER_BIT + 5);
        // one slot still low (INFINITE counts as not blocking the fold)
        let folded = ta.maybe_fold_rollover(ROLLOVER_BIT + 1);
        assert_eq!(folded, 1);
        assert_eq!(ta.at(a), 5);
    }
}
