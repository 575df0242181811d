//! Lock reservation cancellation
//!
//! A reserved word is changed by its owner without CAS discipline against
//! other threads, so another thread may only rewrite it while the owner is
//! known to be outside any fast path. Exclusive access gives exactly that:
//! the owner has released its token (or is in native code) and cannot be
//! touching the word.

use super::{LockWord, ObjectMonitor};
use crate::thread::VmThread;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

impl ObjectMonitor {
    /// Strip the reservation from `word` so `thread` can contend normally.
    ///
    /// An unheld reservation becomes unlocked. A held one becomes a plain
    /// thin lock of the same owner with the same entry count.
    pub(crate) fn cancel_reservation(&self, thread: &Arc<VmThread>, word: &AtomicUsize) {
        self.coordinator.acquire_exclusive(thread);

        let cur = LockWord::from_raw(word.load(Ordering::Acquire));
        // Another canceller may have won while we waited for exclusivity.
        if cur.is_reserved() && cur.owner() != 0 && cur.owner() != thread.lock_token() {
            let new = match cur.recursion_count() {
                0 => LockWord::UNLOCKED,
                rc => LockWord::thin(cur.owner(), rc - 1, false),
            };
            word.store(new.raw(), Ordering::Release);
            self.stats.record_reservation_cancelled();
            log::trace!(
                "thread {} cancelled reservation {:?} -> {:?}",
                thread.id(),
                cur,
                new
            );
        }

        self.coordinator.release_exclusive(thread);
    }
}
