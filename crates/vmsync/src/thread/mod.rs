//! Thread handles and per-thread access state
//!
//! Every thread that touches managed objects owns a [`VmThread`]. The handle
//! carries the thread's [`ThreadAccessState`] (the flags word the access
//! protocol runs on), its introspection status and its stack of
//! monitor-enter records.
//!
//! ## Flags Word Ownership
//!
//! ```text
//!  owner thread                      requester / inspector
//!  ────────────                      ─────────────────────
//!  CAS 0 -> HAS_ACCESS (fast)        lock(flags mutex)
//!  CAS HAS_ACCESS -> 0 (fast)          fetch_or(HALT_*)
//!  CAS +/- IN_NATIVE  (fast)           classify by previous bits
//!                                    unlock
//!  any other transition: under the thread's own flags mutex
//! ```
//!
//! A fast-path CAS only succeeds when the word holds exactly the expected
//! value. Once a requester has posted a halt bit, every owner transition
//! falls through to the mutex-protected slow path, which is what makes the
//! requester's classification atomic with respect to the owner.

pub mod enter_record;
pub mod flags;
pub mod registry;

pub use enter_record::{EnterRecordStack, FrameId, MonitorEnterRecord};
pub use flags::AccessFlags;
pub use registry::{ThreadList, ThreadRegistry};

use crate::monitor::LockWord;
use crate::sync::{AtomicBool, AtomicU8, AtomicUsize, Condvar, Mutex, MutexGuard};
use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::Ordering;

/// Identifier of an attached thread. Never reused within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Owner value stored in thin lock words. Zero is reserved for
    /// "unowned", so ids are shifted by one.
    pub const fn lock_token(self) -> usize {
        (self.0 as usize + 1) << LockWord::OWNER_SHIFT
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a thread is doing, for debuggers and deadlock reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    Running = 0,
    /// Blocked entering an object monitor
    Blocked = 1,
    /// In `wait` on an object monitor
    Waiting = 2,
    /// Running native code
    Native = 3,
}

impl ThreadStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ThreadStatus::Blocked,
            2 => ThreadStatus::Waiting,
            3 => ThreadStatus::Native,
            _ => ThreadStatus::Running,
        }
    }
}

/// Flags word plus the mutex/condvar pair that guards its slow paths.
pub struct ThreadAccessState {
    flags: CachePadded<AtomicUsize>,
    mutex: Mutex<()>,
    cond: Condvar,
    /// Reentrant exclusive-access depth. Owner only.
    exclusive_count: AtomicUsize,
    /// Reentrant safepoint depth. Owner only.
    safepoint_count: AtomicUsize,
    /// Critical region nesting. Owner only.
    critical_depth: AtomicUsize,
    /// Outstanding inspection halts. Guarded by the flags mutex.
    inspection_count: AtomicUsize,
    /// An exclusive requester expects this thread to leave its critical
    /// region. Guarded by the flags mutex.
    critical_counted: AtomicBool,
}

impl ThreadAccessState {
    fn new() -> Self {
        Self {
            flags: CachePadded::new(AtomicUsize::new(0)),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
            exclusive_count: AtomicUsize::new(0),
            safepoint_count: AtomicUsize::new(0),
            critical_depth: AtomicUsize::new(0),
            inspection_count: AtomicUsize::new(0),
            critical_counted: AtomicBool::new(false),
        }
    }

    /// Acquire-ordered snapshot of the flags.
    pub fn flags(&self) -> AccessFlags {
        AccessFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    /// Unsynchronized snapshot for the owner's fast-path decisions. May be
    /// stale against a concurrent requester; the CAS that follows decides.
    pub(crate) fn flags_relaxed(&self) -> AccessFlags {
        AccessFlags::from_bits(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, bits: AccessFlags) -> AccessFlags {
        AccessFlags::from_bits(self.flags.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    pub(crate) fn clear(&self, bits: AccessFlags) -> AccessFlags {
        AccessFlags::from_bits(self.flags.fetch_and(!bits.bits(), Ordering::AcqRel))
    }

    /// Single CAS used by the owner's fast paths.
    pub(crate) fn transition(&self, from: AccessFlags, to: AccessFlags) -> bool {
        self.flags
            .compare_exchange(from.bits(), to.bits(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }

    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, ()>) {
        self.cond.wait(guard);
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub fn exclusive_count(&self) -> usize {
        self.exclusive_count.load(Ordering::Relaxed)
    }

    pub fn safepoint_count(&self) -> usize {
        self.safepoint_count.load(Ordering::Relaxed)
    }

    pub fn critical_depth(&self) -> usize {
        self.critical_depth.load(Ordering::Relaxed)
    }

    pub fn inspection_count(&self) -> usize {
        self.inspection_count.load(Ordering::Relaxed)
    }

    pub(crate) fn exclusive_counter(&self) -> &AtomicUsize {
        &self.exclusive_count
    }

    pub(crate) fn safepoint_counter(&self) -> &AtomicUsize {
        &self.safepoint_count
    }

    pub(crate) fn critical_counter(&self) -> &AtomicUsize {
        &self.critical_depth
    }

    pub(crate) fn inspection_counter(&self) -> &AtomicUsize {
        &self.inspection_count
    }

    pub(crate) fn critical_counted(&self) -> &AtomicBool {
        &self.critical_counted
    }
}

/// Handle of a thread attached to a runtime.
///
/// Created by [`SyncRuntime::attach_thread`](crate::SyncRuntime::attach_thread)
/// and shared as `Arc<VmThread>`. At detach the thread must hold no
/// exclusive access and own no monitor.
pub struct VmThread {
    id: ThreadId,
    name: String,
    access: ThreadAccessState,
    status: AtomicU8,
    /// Monitors this thread holds at least once. Owner only.
    owned_monitors: AtomicUsize,
    enter_records: Mutex<EnterRecordStack>,
}

impl VmThread {
    pub(crate) fn new(id: ThreadId, name: impl Into<String>, max_enter_records: usize) -> Self {
        Self {
            id,
            name: name.into(),
            access: ThreadAccessState::new(),
            status: AtomicU8::new(ThreadStatus::Running as u8),
            owned_monitors: AtomicUsize::new(0),
            enter_records: Mutex::new(EnterRecordStack::new(max_enter_records)),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_token(&self) -> usize {
        self.id.lock_token()
    }

    pub fn access(&self) -> &ThreadAccessState {
        &self.access
    }

    pub fn flags(&self) -> AccessFlags {
        self.access.flags()
    }

    pub fn has_access(&self) -> bool {
        self.access.flags().has_access()
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    /// Number of distinct monitors currently held.
    pub fn owned_monitor_count(&self) -> usize {
        self.owned_monitors.load(Ordering::Relaxed)
    }

    pub(crate) fn monitor_acquired(&self) {
        self.owned_monitors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn monitor_released(&self) {
        let prev = self.owned_monitors.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "thread {} released more monitors than it owned", self.id);
    }

    pub(crate) fn enter_records(&self) -> MutexGuard<'_, EnterRecordStack> {
        self.enter_records.lock()
    }

    /// Number of monitor-enter records currently held.
    pub fn enter_record_count(&self) -> usize {
        self.enter_records.lock().len()
    }
}

impl fmt::Debug for VmThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags())
            .field("status", &self.status())
            .field("owned_monitors", &self.owned_monitor_count())
            .finish()
    }
}
