//! Heavyweight monitor records
//!
//! A [`MonitorRecord`] exists for every object that has ever been contended
//! (or waited on, or lacks an inline lock word). It pairs an [`OsMonitor`]
//! (a reentrant mutex with a wait set) with the bookkeeping the inflation
//! protocol needs.
//!
//! Besides ownership handoff, the OS monitor's state mutex serializes two
//! things on the flat path:
//!
//! - a blocked enterer setting FLC on the lock word and starting to wait;
//! - a thin owner that saw FLC on exit and wakes the entry waiters.
//!
//! Because both happen under the same mutex, an exit can never slip between
//! the FLC CAS and the wait.

use super::LockWord;
use crate::object::ObjectId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct MonitorState {
    /// Lock token of the owner, 0 when free
    owner: usize,
    /// Entry count of the owner
    count: usize,
    /// Threads in `wait`
    waiters: usize,
    /// Outstanding notifications not yet consumed by a waiter
    notify_tickets: usize,
}

/// Outcome of [`OsMonitor::wait_for_flat_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatWait {
    /// The lock word changed before FLC could be set
    Changed,
    /// Waited (until notified or the timeout elapsed)
    Waited,
}

/// Reentrant OS-level monitor.
pub struct OsMonitor {
    state: Mutex<MonitorState>,
    /// Signalled when ownership becomes free
    released: Condvar,
    /// Signalled when a thin owner with FLC exits
    entry: Condvar,
    /// Language-level wait set
    wait_set: Condvar,
}

impl OsMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            released: Condvar::new(),
            entry: Condvar::new(),
            wait_set: Condvar::new(),
        }
    }

    fn take_ownership(&self, state: &mut MutexGuard<'_, MonitorState>, token: usize, count: usize) {
        while state.owner != 0 {
            self.released.wait(state);
        }
        state.owner = token;
        state.count = count;
    }

    fn give_up_ownership(&self, state: &mut MonitorState) -> usize {
        let count = state.count;
        state.owner = 0;
        state.count = 0;
        self.released.notify_one();
        count
    }

    pub fn enter(&self, token: usize) {
        let mut state = self.state.lock();
        if state.owner == token {
            state.count += 1;
            return;
        }
        self.take_ownership(&mut state, token, 1);
    }

    pub fn try_enter(&self, token: usize) -> bool {
        let mut state = self.state.lock();
        if state.owner == token {
            state.count += 1;
            true
        } else if state.owner == 0 {
            state.owner = token;
            state.count = 1;
            true
        } else {
            false
        }
    }

    /// Returns `false` if `token` does not own the monitor.
    pub fn exit(&self, token: usize) -> bool {
        let mut state = self.state.lock();
        if state.owner != token {
            return false;
        }
        state.count -= 1;
        if state.count == 0 {
            self.give_up_ownership(&mut state);
        }
        true
    }

    pub fn owner(&self) -> usize {
        self.state.lock().owner
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Set the entry count of the current owner (after inflating a
    /// recursively held thin lock).
    pub(crate) fn set_count(&self, token: usize, count: usize) -> bool {
        let mut state = self.state.lock();
        if state.owner != token {
            return false;
        }
        state.count = count;
        true
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Release full ownership, sleep until notified or timed out, then take
    /// ownership back with the saved entry count.
    ///
    /// Returns `None` if `token` is not the owner, else whether the wait
    /// ended by notification.
    pub fn wait(&self, token: usize, timeout: Option<Duration>) -> Option<bool> {
        let mut state = self.state.lock();
        if state.owner != token {
            return None;
        }
        let saved = self.give_up_ownership(&mut state);
        state.waiters += 1;

        let deadline = timeout.map(|t| Instant::now() + t);
        let notified = loop {
            if state.notify_tickets > 0 {
                state.notify_tickets -= 1;
                break true;
            }
            match deadline {
                Some(deadline) => {
                    if self.wait_set.wait_until(&mut state, deadline).timed_out() {
                        // A ticket may have landed together with the timeout.
                        if state.notify_tickets > 0 {
                            state.notify_tickets -= 1;
                            break true;
                        }
                        break false;
                    }
                }
                None => self.wait_set.wait(&mut state),
            }
        };
        state.waiters -= 1;
        state.notify_tickets = state.notify_tickets.min(state.waiters);

        self.take_ownership(&mut state, token, saved);
        Some(notified)
    }

    /// Returns `false` if `token` does not own the monitor.
    pub fn notify(&self, token: usize) -> bool {
        let mut state = self.state.lock();
        if state.owner != token {
            return false;
        }
        if state.notify_tickets < state.waiters {
            state.notify_tickets += 1;
            self.wait_set.notify_one();
        }
        true
    }

    /// Returns `false` if `token` does not own the monitor.
    pub fn notify_all(&self, token: usize) -> bool {
        let mut state = self.state.lock();
        if state.owner != token {
            return false;
        }
        state.notify_tickets = state.waiters;
        self.wait_set.notify_all();
        true
    }

    /// Wake threads blocked on a flat lock. Takes no ownership.
    pub fn notify_entry_waiters(&self) {
        let _state = self.state.lock();
        self.entry.notify_all();
    }

    /// Set FLC on the observed thin word and sleep until the thin owner
    /// exits or `timeout` elapses. Caller owns this monitor; ownership is
    /// given up during the sleep and restored afterwards.
    pub fn wait_for_flat_release(
        &self,
        token: usize,
        lockword: &AtomicUsize,
        observed: LockWord,
        timeout: Duration,
    ) -> FlatWait {
        let mut state = self.state.lock();
        if !observed.has_flc()
            && lockword
                .compare_exchange(
                    observed.raw(),
                    observed.with_flc().raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return FlatWait::Changed;
        }
        if observed.has_flc() && lockword.load(Ordering::Acquire) != observed.raw() {
            return FlatWait::Changed;
        }

        let saved = self.give_up_ownership(&mut state);
        self.entry.wait_for(&mut state, timeout);
        self.take_ownership(&mut state, token, saved);
        FlatWait::Waited
    }
}

impl Default for OsMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Heavyweight monitor of one object.
pub struct MonitorRecord {
    object: AtomicUsize,
    /// Lock word for objects that have none inline
    alternate_lockword: AtomicUsize,
    /// Threads currently relying on this record staying attached
    pin_count: AtomicUsize,
    spin_successes: AtomicU64,
    spin_failures: AtomicU64,
    pub monitor: OsMonitor,
}

impl MonitorRecord {
    pub fn new(object: ObjectId) -> Self {
        Self {
            object: AtomicUsize::new(object.raw()),
            alternate_lockword: AtomicUsize::new(LockWord::UNLOCKED.raw()),
            pin_count: AtomicUsize::new(0),
            spin_successes: AtomicU64::new(0),
            spin_failures: AtomicU64::new(0),
            monitor: OsMonitor::new(),
        }
    }

    pub fn object(&self) -> ObjectId {
        ObjectId::from_raw(self.object.load(Ordering::Acquire))
    }

    pub(crate) fn set_object(&self, object: ObjectId) {
        self.object.store(object.raw(), Ordering::Release);
    }

    /// Value stored in an inflated lock word.
    pub fn address(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    pub fn alternate_lockword(&self) -> &AtomicUsize {
        &self.alternate_lockword
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn record_spin(&self, success: bool) {
        let counter = if success {
            &self.spin_successes
        } else {
            &self.spin_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// (successes, failures) of spin attempts on this object.
    pub fn spin_stats(&self) -> (u64, u64) {
        (
            self.spin_successes.load(Ordering::Relaxed),
            self.spin_failures.load(Ordering::Relaxed),
        )
    }

    /// Unowned, unpinned and without waiters.
    pub fn is_idle(&self) -> bool {
        let state = self.monitor.state.lock();
        state.owner == 0 && state.waiters == 0 && self.pin_count() == 0
    }
}

impl fmt::Debug for MonitorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorRecord")
            .field("object", &self.object())
            .field("owner", &self.monitor.owner())
            .field("pins", &self.pin_count())
            .finish()
    }
}

/// Keeps a record from being deflated while a thread blocks on it.
pub struct PinnedRecord {
    record: Arc<MonitorRecord>,
}

impl PinnedRecord {
    pub fn new(record: Arc<MonitorRecord>) -> Self {
        record.pin_count.fetch_add(1, Ordering::AcqRel);
        Self { record }
    }

    pub fn record(&self) -> &Arc<MonitorRecord> {
        &self.record
    }
}

impl Deref for PinnedRecord {
    type Target = MonitorRecord;

    fn deref(&self) -> &MonitorRecord {
        &self.record
    }
}

impl Drop for PinnedRecord {
    fn drop(&mut self) {
        self.record.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}
