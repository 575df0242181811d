//! Object monitors
//!
//! Per-object locks built on the lock word (see [`LockWord`]) with a
//! heavyweight fallback in the [`MonitorTable`].
//!
//! ## Lock States
//!
//! ```text
//!                 CAS                        contention / wait / saturation
//!   UNLOCKED ───────────> THIN(owner, rc) ─────────────────────────────────> INFLATED(record)
//!      ^                      │   ^                                              │
//!      └──────── exit ────────┘   │ cancel (exclusive access)                    │ deflate
//!                                 │                                              │ (GC, exclusive)
//!   RESERVABLE ──CAS──> RESERVED(owner, rc) ─────────────────────────────────────┘
//! ```
//!
//! ## Enter Escalation
//!
//! 1. **Fast**: one CAS from the free word, or an in-place recursion bump by
//!    the owner.
//! 2. **Spin**: the configured ladder (or the object's override) retrying the
//!    CAS; for an inflated word, the OS monitor's try-enter.
//! 3. **Block**: make sure a record exists, give up the execution token,
//!    take the record's OS monitor, and wait for the thin owner to leave
//!    (setting FLC so it knows to signal). The waiter installs the inflated
//!    word itself once the object is free.
//!
//! A blocked thread holds its record pinned so deflation cannot pull the
//! record out from under it while it has no token.

pub mod lockword;
pub mod record;
pub mod reservation;
pub mod spin;
pub mod table;

pub use lockword::LockWord;
pub use record::{FlatWait, MonitorRecord, OsMonitor, PinnedRecord};
pub use spin::{spin_acquire, TimeoutLadder};
pub use table::MonitorTable;

use crate::access::VmAccessCoordinator;
use crate::config::{SpinCounts, SyncConfig};
use crate::error::{Result, SyncError};
use crate::object::{ObjectHeader, ObjectId};
use crate::stats::{EnterPath, SyncStats};
use crate::thread::{ThreadStatus, VmThread};
use crate::{vm_assert, vm_fatal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where the lock word of an object lives.
enum LockSlot<'a> {
    Inline(&'a AtomicUsize),
    Alternate(Arc<MonitorRecord>),
}

impl LockSlot<'_> {
    fn word(&self) -> &AtomicUsize {
        match self {
            LockSlot::Inline(word) => word,
            LockSlot::Alternate(record) => record.alternate_lockword(),
        }
    }
}

/// One step of a thin-lock attempt.
#[derive(Debug, Clone, Copy)]
enum Attempt {
    Acquired(EnterPath),
    /// Thin lock held by another thread
    Contended,
    Inflated(LockWord),
    /// Reserved for another thread; needs cancellation first
    ReservedByOther,
    /// Owner re-entry would overflow the recursion field
    Saturated,
}

/// Progress of a monitor enter.
enum EnterState {
    Spinning,
    Blocked(PinnedRecord),
    Acquired(EnterPath),
    Failed(SyncError),
}

/// Result of a non-blocking enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryEnter {
    Acquired,
    /// Contended after the spin ladder. A record now exists, so a following
    /// blocking enter cannot fail for lack of memory.
    WouldBlock,
}

pub struct ObjectMonitor {
    coordinator: Arc<VmAccessCoordinator>,
    table: Arc<MonitorTable>,
    stats: Arc<SyncStats>,
    spin: SpinCounts,
    try_enter_spin: SpinCounts,
    reservation: bool,
}

impl ObjectMonitor {
    pub fn new(
        config: &SyncConfig,
        coordinator: Arc<VmAccessCoordinator>,
        table: Arc<MonitorTable>,
        stats: Arc<SyncStats>,
    ) -> Self {
        Self {
            coordinator,
            table,
            stats,
            spin: config.spin,
            try_enter_spin: config.try_enter_spin,
            reservation: config.lock_reservation,
        }
    }

    pub fn table(&self) -> &Arc<MonitorTable> {
        &self.table
    }

    fn illegal(thread: &VmThread, object: &dyn ObjectHeader) -> SyncError {
        SyncError::IllegalMonitorState {
            object: object.object_id(),
            thread: thread.id(),
        }
    }

    /// Lock word of `object`. Objects without an inline word get their
    /// record created on first use when `create` is set.
    fn slot<'a>(&self, object: &'a dyn ObjectHeader, create: bool) -> Result<Option<LockSlot<'a>>> {
        if let Some(word) = object.lockword() {
            return Ok(Some(LockSlot::Inline(word)));
        }
        let id = object.object_id();
        let record = if create {
            Some(self.table.get_or_create(id)?)
        } else {
            self.table.get(id)
        };
        Ok(record.map(LockSlot::Alternate))
    }

    /// Record an inflated word points at.
    ///
    /// Records are looked up by identity rather than through the word's
    /// address; the address only has to agree.
    fn inflated_record(&self, object: ObjectId, word: LockWord) -> Arc<MonitorRecord> {
        match self.table.get(object) {
            Some(record) => {
                debug_assert_eq!(word.record_address(), Some(record.address()));
                record
            }
            None => vm_fatal!("object {} is inflated but has no monitor record", object),
        }
    }

    // ------------------------------------------------------------------
    // Enter
    // ------------------------------------------------------------------

    /// Acquire the monitor of `object`, blocking if needed.
    ///
    /// The caller must hold its execution token. Fails only with
    /// [`SyncError::AllocationFailure`].
    pub fn enter(&self, thread: &Arc<VmThread>, object: &dyn ObjectHeader) -> Result<()> {
        vm_assert!(
            thread.flags().running_managed_code(),
            "thread {} entering a monitor without its token",
            thread.id()
        );
        let slot = match self.slot(object, true)? {
            Some(slot) => slot,
            None => vm_fatal!("no lock word for object {}", object.object_id()),
        };
        let word = slot.word();

        let mut state = EnterState::Spinning;
        loop {
            state = match state {
                EnterState::Spinning => self.spin_enter(thread, object, word),
                EnterState::Blocked(pinned) => self.block_enter(thread, word, pinned),
                EnterState::Acquired(path) => {
                    self.acquired(thread, path);
                    return Ok(());
                }
                EnterState::Failed(err) => return Err(err),
            };
        }
    }

    /// Acquire without blocking: fast path plus the spin ladder.
    pub fn try_enter(&self, thread: &Arc<VmThread>, object: &dyn ObjectHeader) -> Result<TryEnter> {
        vm_assert!(
            thread.flags().running_managed_code(),
            "thread {} entering a monitor without its token",
            thread.id()
        );
        let slot = match self.slot(object, true)? {
            Some(slot) => slot,
            None => vm_fatal!("no lock word for object {}", object.object_id()),
        };
        loop {
            match self.spin_enter(thread, object, slot.word()) {
                EnterState::Spinning => continue,
                EnterState::Acquired(path) => {
                    self.acquired(thread, path);
                    return Ok(TryEnter::Acquired);
                }
                EnterState::Blocked(_) => return Ok(TryEnter::WouldBlock),
                EnterState::Failed(err) => return Err(err),
            }
        }
    }

    fn acquired(&self, thread: &VmThread, path: EnterPath) {
        if path != EnterPath::Recursive {
            thread.monitor_acquired();
        }
        self.stats.record_enter(path);
    }

    /// One attempt at the thin lock.
    fn try_thin(&self, word: &AtomicUsize, me: usize) -> Attempt {
        let cur = LockWord::from_raw(word.load(Ordering::Relaxed));
        if cur.is_inflated() {
            return Attempt::Inflated(cur);
        }

        if cur.is_free() {
            let new = match (cur == LockWord::RESERVABLE, self.reservation) {
                (true, true) => LockWord::thin(me, 1, true),
                (true, false) => LockWord::thin(me, 0, false).with_baseline(),
                (false, _) => LockWord::thin(me, 0, false),
            };
            return match word.compare_exchange(
                cur.raw(),
                new.raw(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => Attempt::Acquired(EnterPath::Fast),
                Err(_) => Attempt::Contended,
            };
        }

        if cur.owner() == me {
            if cur.recursion_count() == LockWord::MAX_RECURSION {
                return Attempt::Saturated;
            }
            // Only the owner changes the count; other threads can at most
            // add FLC, which the add preserves.
            word.fetch_add(LockWord::RC_ONE, Ordering::Relaxed);
            return if cur.entry_count() == 0 {
                Attempt::Acquired(EnterPath::Fast)
            } else {
                Attempt::Acquired(EnterPath::Recursive)
            };
        }

        if cur.is_reserved() {
            Attempt::ReservedByOther
        } else {
            Attempt::Contended
        }
    }

    /// Fast path and spin ladder. Ends in `Acquired`, `Failed`, or
    /// `Blocked` with the record pinned.
    fn spin_enter(
        &self,
        thread: &Arc<VmThread>,
        object: &dyn ObjectHeader,
        word: &AtomicUsize,
    ) -> EnterState {
        let me = thread.lock_token();
        let mut attempt = self.try_thin(word, me);

        if let Attempt::Contended = attempt {
            let counts = object.spin_override().unwrap_or(self.spin);
            let acquired = spin_acquire(counts, || {
                attempt = self.try_thin(word, me);
                !matches!(attempt, Attempt::Contended)
            });
            if acquired {
                if let Attempt::Acquired(_) = attempt {
                    attempt = Attempt::Acquired(EnterPath::Spin);
                }
            }
        }

        match attempt {
            Attempt::Acquired(path) => EnterState::Acquired(path),
            Attempt::ReservedByOther => {
                self.cancel_reservation(thread, word);
                EnterState::Spinning
            }
            Attempt::Saturated => match self.inflate_owned(thread, object.object_id(), word) {
                Ok(record) => {
                    // Still holding; add this entry on the heavy side.
                    record.monitor.enter(me);
                    EnterState::Acquired(EnterPath::Recursive)
                }
                Err(err) => EnterState::Failed(err),
            },
            Attempt::Inflated(cur) => {
                let record = self.inflated_record(object.object_id(), cur);
                if record.monitor.owner() == me {
                    record.monitor.enter(me);
                    return EnterState::Acquired(EnterPath::Recursive);
                }
                let acquired = spin_acquire(self.try_enter_spin, || record.monitor.try_enter(me));
                record.record_spin(acquired);
                if acquired {
                    EnterState::Acquired(EnterPath::Spin)
                } else {
                    EnterState::Blocked(PinnedRecord::new(record))
                }
            }
            Attempt::Contended => {
                let record = match self.table.get_or_create(object.object_id()) {
                    Ok(record) => record,
                    Err(err) => return EnterState::Failed(err),
                };
                record.record_spin(false);
                EnterState::Blocked(PinnedRecord::new(record))
            }
        }
    }

    /// Blocking phase. Runs without the execution token.
    fn block_enter(&self, thread: &Arc<VmThread>, word: &AtomicUsize, pinned: PinnedRecord) -> EnterState {
        let me = thread.lock_token();
        let start = Instant::now();
        thread.set_status(ThreadStatus::Blocked);
        self.coordinator.release_access(thread);

        pinned.monitor.enter(me);
        let mut ladder = TimeoutLadder::new();
        let acquired = loop {
            let cur = LockWord::from_raw(word.load(Ordering::Acquire));
            if cur.is_inflated() {
                // Owning the OS monitor of an inflated object is owning the lock.
                break true;
            }
            if cur.is_free() {
                let inflated = LockWord::inflated(pinned.record().address());
                if word
                    .compare_exchange(cur.raw(), inflated.raw(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.stats.record_inflation();
                    log::trace!("thread {} inflated object {}", thread.id(), pinned.object());
                    break true;
                }
                continue;
            }
            if cur.is_reserved() && cur.owner() != me {
                // Cancellation needs the token; go back and do it there.
                pinned.monitor.exit(me);
                break false;
            }
            pinned
                .monitor
                .wait_for_flat_release(me, word, cur, ladder.next_timeout());
        };

        self.coordinator.acquire_access(thread);
        thread.set_status(ThreadStatus::Running);
        self.stats.record_blocked(start.elapsed());
        drop(pinned);

        if acquired {
            EnterState::Acquired(EnterPath::Blocking)
        } else {
            EnterState::Spinning
        }
    }

    /// Move a thin lock held by `thread` to its record, carrying the entry
    /// count over. Returns the record, owned by `thread`.
    fn inflate_owned(
        &self,
        thread: &Arc<VmThread>,
        object: ObjectId,
        word: &AtomicUsize,
    ) -> Result<Arc<MonitorRecord>> {
        let me = thread.lock_token();
        let record = self.table.get_or_create(object)?;

        if !record.monitor.try_enter(me) {
            // A blocked contender holds it for a moment between flat waits.
            let pinned = PinnedRecord::new(record.clone());
            thread.set_status(ThreadStatus::Blocked);
            self.coordinator.release_access(thread);
            pinned.monitor.enter(me);
            self.coordinator.acquire_access(thread);
            thread.set_status(ThreadStatus::Running);
        }

        let inflated = LockWord::inflated(record.address());
        loop {
            let cur = LockWord::from_raw(word.load(Ordering::Acquire));
            vm_assert!(
                cur.owner() == me,
                "thread {} inflating object {} it does not own ({:?})",
                thread.id(),
                object,
                cur
            );
            record.monitor.set_count(me, cur.entry_count());
            if word
                .compare_exchange(cur.raw(), inflated.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        self.stats.record_inflation();
        record.monitor.notify_entry_waiters();
        log::trace!("thread {} inflated its own lock on object {}", thread.id(), object);
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Exit
    // ------------------------------------------------------------------

    pub fn exit(&self, thread: &VmThread, object: &dyn ObjectHeader) -> Result<()> {
        let slot = self
            .slot(object, false)?
            .ok_or_else(|| Self::illegal(thread, object))?;
        let word = slot.word();
        let me = thread.lock_token();

        loop {
            let cur = LockWord::from_raw(word.load(Ordering::Acquire));
            if cur.is_inflated() {
                let record = self.inflated_record(object.object_id(), cur);
                if !record.monitor.exit(me) {
                    return Err(Self::illegal(thread, object));
                }
                // Only this thread can make itself the owner again.
                if record.monitor.owner() != me {
                    thread.monitor_released();
                }
                return Ok(());
            }
            if cur.owner() != me || cur.entry_count() == 0 {
                return Err(Self::illegal(thread, object));
            }
            if cur.is_reserved() || cur.recursion_count() > 0 {
                word.fetch_sub(LockWord::RC_ONE, Ordering::Release);
                if cur.entry_count() == 1 {
                    thread.monitor_released();
                }
                return Ok(());
            }
            if !cur.has_flc() {
                if word
                    .compare_exchange(
                        cur.raw(),
                        cur.released().raw(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    thread.monitor_released();
                    return Ok(());
                }
                // FLC just appeared; take the signalling path.
                continue;
            }

            word.swap(cur.released().raw(), Ordering::AcqRel);
            thread.monitor_released();
            match self.table.get(object.object_id()) {
                Some(record) => record.monitor.notify_entry_waiters(),
                None => vm_fatal!("FLC set on object {} without a record", object.object_id()),
            }
            return Ok(());
        }
    }

    // ------------------------------------------------------------------
    // wait / notify
    // ------------------------------------------------------------------

    /// Wait on `object`'s monitor, which the caller must hold.
    ///
    /// A thin lock is inflated first. Returns whether the wait ended by
    /// notification (`false` on timeout).
    pub fn wait(
        &self,
        thread: &Arc<VmThread>,
        object: &dyn ObjectHeader,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let slot = self
            .slot(object, false)?
            .ok_or_else(|| Self::illegal(thread, object))?;
        let word = slot.word();
        let me = thread.lock_token();

        let cur = LockWord::from_raw(word.load(Ordering::Acquire));
        let record = if cur.is_inflated() {
            self.inflated_record(object.object_id(), cur)
        } else {
            if cur.owner() != me || cur.entry_count() == 0 {
                return Err(Self::illegal(thread, object));
            }
            self.inflate_owned(thread, object.object_id(), word)?
        };
        if record.monitor.owner() != me {
            return Err(Self::illegal(thread, object));
        }

        let pinned = PinnedRecord::new(record);
        thread.set_status(ThreadStatus::Waiting);
        self.coordinator.release_access(thread);
        let notified = pinned.monitor.wait(me, timeout);
        self.coordinator.acquire_access(thread);
        thread.set_status(ThreadStatus::Running);

        notified.ok_or_else(|| Self::illegal(thread, object))
    }

    pub fn notify(&self, thread: &VmThread, object: &dyn ObjectHeader) -> Result<()> {
        self.notify_impl(thread, object, false)
    }

    pub fn notify_all(&self, thread: &VmThread, object: &dyn ObjectHeader) -> Result<()> {
        self.notify_impl(thread, object, true)
    }

    fn notify_impl(&self, thread: &VmThread, object: &dyn ObjectHeader, all: bool) -> Result<()> {
        let slot = self
            .slot(object, false)?
            .ok_or_else(|| Self::illegal(thread, object))?;
        let me = thread.lock_token();
        let cur = LockWord::from_raw(slot.word().load(Ordering::Acquire));

        let owned = if cur.is_inflated() {
            let record = self.inflated_record(object.object_id(), cur);
            if all {
                record.monitor.notify_all(me)
            } else {
                record.monitor.notify(me)
            }
        } else {
            // Nobody can be waiting on a thin lock.
            cur.owner() == me && cur.entry_count() > 0
        };
        if owned {
            Ok(())
        } else {
            Err(Self::illegal(thread, object))
        }
    }

    // ------------------------------------------------------------------
    // Introspection and GC maintenance
    // ------------------------------------------------------------------

    /// Current lock word of `object`, `None` for an object without an inline
    /// word and no record yet.
    pub fn lockword(&self, object: &dyn ObjectHeader) -> Option<LockWord> {
        match object.lockword() {
            Some(word) => Some(LockWord::from_raw(word.load(Ordering::Acquire))),
            None => self
                .table
                .get(object.object_id())
                .map(|r| LockWord::from_raw(r.alternate_lockword().load(Ordering::Acquire))),
        }
    }

    /// Times `thread` currently holds `object`'s monitor.
    pub fn entry_count(&self, thread: &VmThread, object: &dyn ObjectHeader) -> usize {
        let Some(cur) = self.lockword(object) else {
            return 0;
        };
        if cur.is_inflated() {
            let record = self.inflated_record(object.object_id(), cur);
            if record.monitor.owner() == thread.lock_token() {
                record.monitor.count()
            } else {
                0
            }
        } else if cur.owner() == thread.lock_token() {
            cur.entry_count()
        } else {
            0
        }
    }

    pub fn holds_lock(&self, thread: &VmThread, object: &dyn ObjectHeader) -> bool {
        self.entry_count(thread, object) > 0
    }

    /// Detach an idle record from `object` and restore the thin form.
    ///
    /// Requires exclusive access. Returns `false` if the record is owned,
    /// pinned, has waiters, or the object is thin-locked.
    pub fn deflate(&self, object: &dyn ObjectHeader) -> bool {
        vm_assert!(
            self.coordinator.is_exclusive(),
            "deflating object {} outside exclusive access",
            object.object_id()
        );
        let id = object.object_id();
        let Some(record) = self.table.get(id) else {
            return false;
        };
        if !record.is_idle() {
            return false;
        }

        let word = object.lockword().unwrap_or(record.alternate_lockword());
        let cur = LockWord::from_raw(word.load(Ordering::Acquire));
        if cur.is_inflated() {
            word.store(LockWord::UNLOCKED.raw(), Ordering::Release);
        } else if !cur.is_free() && object.lockword().is_none() {
            // The record carries the thin lock itself.
            return false;
        }

        self.table.retire(id);
        log::trace!("deflated monitor of object {}", id);
        true
    }
}
