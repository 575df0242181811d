//! VM access coordination
//!
//! Every attached thread must hold its execution token ("VM access") to run
//! managed code or touch the heap. A requester brings all other threads to a
//! halt by posting halt bits into their flags words and waiting until each
//! token holder has reported in through [`VmAccessCoordinator::release_access`].
//!
//! Two rendezvous strengths share that machinery (see [`Rendezvous`]):
//! exclusive access, where every other thread gives up its token, and
//! safepoints, where threads only have to reach a consistent point.
//!
//! ## Exclusive Access States
//!
//! ```text
//!            request (first)                 all responses in
//!   NONE ───────────────────────> PENDING ─────────────────────> EXCLUSIVE
//!    ^                               ^                               │
//!    │ release, queue empty          │ successor collects the        │
//!    │                               │ releaser's one response       │
//!    │                               │                               │
//!    │                           HANDING_OFF <───────────────────────┤ release, queue
//!    │                    HANDING_OFF_FROM_EXTERNAL                  │ non-empty
//!    └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A requester that finds the state anything but NONE joins the FIFO queue
//! and halts itself. Release with a non-empty queue hands EXCLUSIVE straight
//! to the queue head; the state never passes through NONE while a successor
//! is waiting.
//!
//! ## Lock Order
//!
//! thread list → per-thread flags mutex → global exclusive-access mutex.
//! The global mutex is only held briefly and never across a wait on
//! anything but its own condition variable.
//!
//! ## Intentional Race
//!
//! Owner fast paths read and CAS the flags word without any lock. This is the
//! one deliberate data race in the protocol: a fast-path CAS succeeds only on
//! an exact expected value, so once a requester has set any halt bit the
//! owner is forced onto the mutex-protected slow path.

pub mod inspection;
pub mod native;
pub mod safepoint;
pub mod stats;

pub use stats::ExclusiveAccessStats;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::stats::SyncStats;
use crate::thread::{AccessFlags, ThreadId, ThreadList, ThreadRegistry, VmThread};
use crate::{vm_assert, vm_fatal};
use crate::sync::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// State of one rendezvous kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveState {
    None,
    Pending,
    Exclusive,
    HandingOff,
    HandingOffFromExternal,
}

/// Strength of a rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendezvous {
    /// Every other thread releases its token.
    Exclusive,
    /// Every other thread reaches a consistent point.
    SafePoint,
}

/// Responses a requester must collect after posting halts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HaltTally {
    pub token_holders: isize,
    pub critical: isize,
}

/// An external exclusive request whose halts are posted but whose responses
/// have not been collected yet.
#[derive(Debug)]
#[must_use = "an external request holds the rendezvous until awaited"]
pub struct ExternalRequest {
    tally: HaltTally,
}

impl ExternalRequest {
    /// Token holders that still have to release.
    pub fn expected_responses(&self) -> usize {
        self.tally.token_holders.max(0) as usize
    }

    /// Threads that still have to leave a critical region.
    pub fn expected_critical(&self) -> usize {
        self.tally.critical.max(0) as usize
    }
}

/// Maintenance run just before the final release of exclusive access.
pub type ReleaseHook = Box<dyn Fn() + Send + Sync>;

/// State protected by the global exclusive-access mutex.
pub(crate) struct GlobalState {
    exclusive: ExclusiveState,
    safepoint: ExclusiveState,
    queue: VecDeque<Arc<VmThread>>,
    /// Signed: responders may report before the requester adds its
    /// expectation, and the hand-off pre-bias starts critical at -1.
    exclusive_responses: isize,
    critical_responses: isize,
    safepoint_responses: isize,
    stats: ExclusiveAccessStats,
}

impl GlobalState {
    fn new() -> Self {
        Self {
            exclusive: ExclusiveState::None,
            safepoint: ExclusiveState::None,
            queue: VecDeque::new(),
            exclusive_responses: 0,
            critical_responses: 0,
            safepoint_responses: 0,
            stats: ExclusiveAccessStats::default(),
        }
    }

    fn state(&self, kind: Rendezvous) -> ExclusiveState {
        match kind {
            Rendezvous::Exclusive => self.exclusive,
            Rendezvous::SafePoint => self.safepoint,
        }
    }

    fn set_state(&mut self, kind: Rendezvous, state: ExclusiveState) {
        match kind {
            Rendezvous::Exclusive => self.exclusive = state,
            Rendezvous::SafePoint => self.safepoint = state,
        }
    }

    fn responses(&mut self, kind: Rendezvous) -> &mut isize {
        match kind {
            Rendezvous::Exclusive => &mut self.exclusive_responses,
            Rendezvous::SafePoint => &mut self.safepoint_responses,
        }
    }
}

/// Coordinator of execution tokens, exclusive access and safepoints.
///
/// One instance per runtime, shared by reference. There is no process-wide
/// instance.
pub struct VmAccessCoordinator {
    threads: ThreadRegistry,
    global: Mutex<GlobalState>,
    global_cond: Condvar,
    release_hooks: Mutex<Vec<ReleaseHook>>,
    two_pass: bool,
    slow_tolerance: Duration,
    stats: Arc<SyncStats>,
}

impl VmAccessCoordinator {
    pub fn new(config: &SyncConfig, stats: Arc<SyncStats>) -> Self {
        Self {
            threads: ThreadRegistry::new(),
            global: Mutex::new(GlobalState::new()),
            global_cond: Condvar::new(),
            release_hooks: Mutex::new(Vec::new()),
            two_pass: config.two_pass_exclusive,
            slow_tolerance: config.exclusive_slow_tolerance(),
            stats,
        }
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    /// Register a new thread. It starts without its token; a thread born
    /// during an exclusive or safepoint window starts halted.
    pub fn attach(&self, name: impl Into<String>, max_enter_records: usize) -> Arc<VmThread> {
        let mut list = self.threads.lock();
        let thread = Arc::new(VmThread::new(self.threads.next_id(), name, max_enter_records));
        {
            let global = self.global.lock();
            if global.exclusive != ExclusiveState::None {
                thread.access().set(AccessFlags::HALT_EXCLUSIVE);
            }
            if global.safepoint != ExclusiveState::None {
                thread
                    .access()
                    .set(AccessFlags::HALTED_AT_SAFE_POINT | AccessFlags::NOT_COUNTED_BY_SAFE_POINT);
            }
        }
        list.push(thread.clone());
        log::trace!("attached thread {} ({})", thread.id(), thread.name());
        thread
    }

    /// Unregister a thread that holds neither its token nor exclusive access.
    pub fn detach(&self, thread: &VmThread) -> Result<()> {
        let access = thread.access();
        vm_assert!(
            access.exclusive_count() == 0 && access.safepoint_count() == 0,
            "thread {} detaching while holding exclusive access",
            thread.id()
        );
        vm_assert!(
            !access.flags().has_access(),
            "thread {} detaching while holding its token",
            thread.id()
        );
        vm_assert!(
            thread.owned_monitor_count() == 0,
            "thread {} detaching while it owns {} monitors",
            thread.id(),
            thread.owned_monitor_count()
        );

        let mut list = self.threads.lock();
        let pos = list
            .iter()
            .position(|t| std::ptr::eq(Arc::as_ptr(t), thread))
            .ok_or(SyncError::NotAttached(thread.id()))?;
        list.remove(pos);
        log::trace!("detached thread {}", thread.id());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution token
    // ------------------------------------------------------------------

    /// Single CAS from no flags to `HAS_ACCESS`. Never blocks.
    pub fn try_acquire_access(&self, thread: &VmThread) -> bool {
        let access = thread.access();
        access.flags_relaxed() == AccessFlags::EMPTY
            && access.transition(AccessFlags::EMPTY, AccessFlags::HAS_ACCESS)
    }

    /// Acquire the token, waiting while any halt bit is set.
    pub fn acquire_access(&self, thread: &VmThread) {
        if !self.try_acquire_access(thread) {
            let mut guard = thread.access().lock();
            self.acquire_access_locked(thread, &mut guard, AccessFlags::HALT_ANY);
        }
    }

    /// Acquire the token ignoring halt bits outside `halt_mask`.
    pub(crate) fn acquire_access_with_mask(&self, thread: &VmThread, halt_mask: AccessFlags) {
        let mut guard = thread.access().lock();
        self.acquire_access_locked(thread, &mut guard, halt_mask);
    }

    /// Slow path of token acquisition. Caller holds `thread`'s flags mutex.
    pub(crate) fn acquire_access_locked(
        &self,
        thread: &VmThread,
        guard: &mut MutexGuard<'_, ()>,
        halt_mask: AccessFlags,
    ) {
        let access = thread.access();
        let flags = access.flags();
        vm_assert!(
            !flags.has_access(),
            "thread {} acquiring a token it already holds",
            thread.id()
        );

        // Blocking inside a critical region counts as leaving it for the
        // current exclusive requester; the region is re-entered once the
        // token is back.
        let reacquire_critical = flags.contains(AccessFlags::IN_CRITICAL);
        if reacquire_critical {
            access.clear(AccessFlags::IN_CRITICAL);
            self.leave_counted_critical(thread);
        }

        if access.flags().intersects(halt_mask) {
            log::trace!("thread {} halted: {:?}", thread.id(), access.flags());
        }
        while access.flags().intersects(halt_mask) {
            access.wait(guard);
        }

        let mut bits = AccessFlags::HAS_ACCESS;
        if reacquire_critical {
            bits = bits | AccessFlags::IN_CRITICAL;
        }
        access.set(bits);
    }

    /// Give up the token, reporting to any pending requester.
    pub fn release_access(&self, thread: &VmThread) {
        let access = thread.access();
        let fast = access.flags_relaxed() == AccessFlags::HAS_ACCESS
            && access.transition(AccessFlags::HAS_ACCESS, AccessFlags::EMPTY);
        if !fast {
            let _guard = access.lock();
            vm_assert!(
                !access.flags().in_native(),
                "thread {} releasing its token from native code",
                thread.id()
            );
            self.release_access_locked(thread);
        }
    }

    /// Slow path of token release. Caller holds `thread`'s flags mutex.
    pub(crate) fn release_access_locked(&self, thread: &VmThread) {
        let access = thread.access();
        let prev = access.clear(AccessFlags::HAS_ACCESS);
        vm_assert!(
            prev.has_access(),
            "thread {} releasing a token it does not hold",
            thread.id()
        );
        if prev.intersects(AccessFlags::RESPONSE_MASK) {
            let mut global = self.global.lock();
            self.respond_locked(thread, &mut global);
        }
        // Inspectors wait on this condvar for the token to go.
        access.notify_all();
    }

    /// Report a released token to whichever requesters expect it.
    fn respond_locked(&self, thread: &VmThread, global: &mut GlobalState) {
        let access = thread.access();
        let flags = access.flags();

        if flags & (AccessFlags::HALT_EXCLUSIVE | AccessFlags::NOT_COUNTED_BY_EXCLUSIVE)
            == AccessFlags::HALT_EXCLUSIVE
        {
            let elapsed = global.stats.respond(thread.id());
            global.exclusive_responses -= 1;
            if global.exclusive_responses == 0 {
                self.check_slow_response(elapsed, "token holders");
                self.global_cond.notify_all();
            }
        }

        if flags.contains(AccessFlags::REQUEST_SAFE_POINT)
            && !flags.contains(AccessFlags::NOT_AT_SAFE_POINT)
        {
            access.clear(AccessFlags::REQUEST_SAFE_POINT);
            access.set(AccessFlags::HALTED_AT_SAFE_POINT);
            if !flags.contains(AccessFlags::NOT_COUNTED_BY_SAFE_POINT) {
                global.safepoint_responses -= 1;
                if global.safepoint_responses == 0 {
                    self.global_cond.notify_all();
                }
            }
        }
    }

    /// Report leaving a critical region, if a requester is counting on it.
    /// Caller holds `thread`'s flags mutex.
    pub(crate) fn leave_counted_critical(&self, thread: &VmThread) {
        if thread.access().critical_counted().swap(false, Ordering::AcqRel) {
            let mut global = self.global.lock();
            self.respond_critical(thread, &mut global);
        }
    }

    fn respond_critical(&self, thread: &VmThread, global: &mut GlobalState) {
        let elapsed = global.stats.respond(thread.id());
        global.critical_responses -= 1;
        if global.critical_responses == 0 {
            self.check_slow_response(elapsed, "critical regions");
            self.global_cond.notify_all();
        }
    }

    fn check_slow_response(&self, elapsed: Duration, reason: &str) {
        if elapsed > self.slow_tolerance {
            log::warn!(
                "slow exclusive access: {} took {:?} to respond (tolerance {:?})",
                reason,
                elapsed,
                self.slow_tolerance
            );
            self.stats.record_slow_exclusive();
        }
    }

    pub(crate) fn global(&self) -> MutexGuard<'_, GlobalState> {
        self.global.lock()
    }

    // ------------------------------------------------------------------
    // Shared rendezvous core
    // ------------------------------------------------------------------

    /// Post exclusive halts to every thread except `requester`.
    ///
    /// Caller holds the thread-list lock. With two passes every thread is
    /// first marked halted-but-not-counted; the second pass decides who
    /// actually owes a response.
    fn post_exclusive_halts(&self, list: &ThreadList, requester: Option<&VmThread>) -> HaltTally {
        let others = || {
            list.iter()
                .filter(move |t| requester.map_or(true, |r| !std::ptr::eq(Arc::as_ptr(t), r)))
        };

        if self.two_pass {
            for thread in others() {
                let _guard = thread.access().lock();
                thread
                    .access()
                    .set(AccessFlags::HALT_EXCLUSIVE | AccessFlags::NOT_COUNTED_BY_EXCLUSIVE);
            }
        }

        let mut tally = HaltTally::default();
        for thread in others() {
            let access = thread.access();
            let _guard = access.lock();
            if !self.two_pass {
                access.set(AccessFlags::HALT_EXCLUSIVE);
            }
            let flags = access.flags();
            if flags.contains(AccessFlags::IN_CRITICAL) {
                access.critical_counted().store(true, Ordering::Release);
                tally.critical += 1;
            }
            if flags.in_native() {
                access.set(AccessFlags::NOT_COUNTED_BY_EXCLUSIVE);
            } else if flags.has_access() {
                if self.two_pass {
                    access.clear(AccessFlags::NOT_COUNTED_BY_EXCLUSIVE);
                }
                tally.token_holders += 1;
            }
        }

        log::trace!(
            "exclusive halts posted: {} token holders, {} in critical regions",
            tally.token_holders,
            tally.critical
        );
        tally
    }

    /// Add the expected responses and wait until every one has arrived.
    fn await_responses(
        &self,
        global: &mut MutexGuard<'_, GlobalState>,
        kind: Rendezvous,
        tally: HaltTally,
    ) {
        *global.responses(kind) += tally.token_holders;
        if *global.responses(kind) < 0 {
            vm_fatal!(
                "{:?} response count underflow: {}",
                kind,
                *global.responses(kind)
            );
        }
        while *global.responses(kind) != 0 {
            self.global_cond.wait(global);
        }

        if kind == Rendezvous::Exclusive {
            global.critical_responses += tally.critical;
            if global.critical_responses < 0 {
                vm_fatal!(
                    "critical-region response count underflow: {}",
                    global.critical_responses
                );
            }
            while global.critical_responses != 0 {
                self.global_cond.wait(global);
            }
        }
    }

    /// Clear `bits` on every thread but `except`, then wake them.
    ///
    /// Caller holds the thread-list lock and not the global mutex.
    fn wake_halted(&self, list: &ThreadList, except: Option<&VmThread>, bits: AccessFlags) {
        for thread in list.iter() {
            if except.is_some_and(|e| std::ptr::eq(Arc::as_ptr(thread), e)) {
                continue;
            }
            let access = thread.access();
            let _guard = access.lock();
            access.clear(bits);
            access.notify_all();
        }
    }

    // ------------------------------------------------------------------
    // Exclusive access
    // ------------------------------------------------------------------

    /// Stop every other thread. Reentrant.
    ///
    /// The caller must hold its token and not be in native code. Returns once
    /// no other thread is running managed code.
    pub fn acquire_exclusive(&self, thread: &Arc<VmThread>) {
        let access = thread.access();
        vm_assert!(
            access.flags().running_managed_code(),
            "thread {} requesting exclusive access without its token",
            thread.id()
        );

        if access.exclusive_counter().fetch_add(1, Ordering::Relaxed) > 0 {
            return;
        }

        let mut flags_guard = access.lock();
        access.set(AccessFlags::NOT_AT_SAFE_POINT);
        let mut global = self.global.lock();

        if global.exclusive != ExclusiveState::None {
            self.wait_in_queue(thread, &mut flags_guard, global);
            drop(flags_guard);

            let mut global = self.global.lock();
            let tally = match global.exclusive {
                // The releaser kept its token and halted itself: it owes one
                // token response and one critical response (pre-biased).
                ExclusiveState::HandingOff => HaltTally {
                    token_holders: 1,
                    critical: 1,
                },
                ExclusiveState::HandingOffFromExternal => HaltTally::default(),
                other => vm_fatal!(
                    "thread {} woken from the exclusive queue in state {:?}",
                    thread.id(),
                    other
                ),
            };
            global.exclusive = ExclusiveState::Pending;
            global.stats.begin(Some(thread.id()));
            self.await_responses(&mut global, Rendezvous::Exclusive, tally);
            self.grant_exclusive(&mut global);
            return;
        }

        global.exclusive = ExclusiveState::Pending;
        global.exclusive_responses = 0;
        global.critical_responses = 0;
        global.stats.begin(Some(thread.id()));
        drop(global);
        drop(flags_guard);

        let tally = {
            let list = self.threads.lock();
            self.post_exclusive_halts(&list, Some(thread))
        };

        let mut global = self.global.lock();
        self.await_responses(&mut global, Rendezvous::Exclusive, tally);
        self.grant_exclusive(&mut global);
    }

    /// Join the FIFO and sleep until the head of the queue is handed
    /// exclusive access. Caller holds its own flags mutex and the global
    /// lock, which must not be dropped between the state check and the push.
    fn wait_in_queue(
        &self,
        thread: &Arc<VmThread>,
        flags_guard: &mut MutexGuard<'_, ()>,
        mut global: MutexGuard<'_, GlobalState>,
    ) {
        let access = thread.access();
        global.queue.push_back(thread.clone());
        access.set(AccessFlags::QUEUED_FOR_EXCLUSIVE);
        log::trace!(
            "thread {} queued for exclusive access (position {})",
            thread.id(),
            global.queue.len()
        );

        // Release our own token without retaking the flags mutex.
        let prev = access.clear(AccessFlags::HAS_ACCESS);
        if prev.intersects(AccessFlags::RESPONSE_MASK) {
            self.respond_locked(thread, &mut global);
        }
        access.notify_all();

        let mut reacquire_critical = false;
        if !access.flags().contains(AccessFlags::HALT_EXCLUSIVE) {
            if access.flags().contains(AccessFlags::IN_CRITICAL) {
                reacquire_critical = true;
                access.clear(AccessFlags::IN_CRITICAL);
            }
            access.set(AccessFlags::HALT_EXCLUSIVE);
        }
        drop(global);

        self.acquire_access_locked(thread, flags_guard, AccessFlags::HALT_EXCLUSIVE);
        access.clear(AccessFlags::QUEUED_FOR_EXCLUSIVE);
        if reacquire_critical {
            access.set(AccessFlags::IN_CRITICAL);
        }
    }

    fn grant_exclusive(&self, global: &mut GlobalState) {
        global.exclusive = ExclusiveState::Exclusive;
        let latency = global.stats.finish();
        self.stats.record_exclusive_granted(latency);
        log::debug!(
            "exclusive access granted to {:?} after {:?} ({} responders)",
            global.stats.requester,
            latency,
            global.stats.halted_threads
        );
    }

    /// Drop one level of exclusive access; at zero hand off to the queue head
    /// or resume every halted thread.
    pub fn release_exclusive(&self, thread: &Arc<VmThread>) {
        let access = thread.access();
        vm_assert!(
            access.flags().has_access(),
            "thread {} releasing exclusive access without its token",
            thread.id()
        );
        let depth = access.exclusive_count();
        vm_assert!(
            depth > 0,
            "thread {} releasing exclusive access it does not hold",
            thread.id()
        );
        if depth > 1 {
            access.exclusive_counter().fetch_sub(1, Ordering::Relaxed);
            return;
        }
        {
            let global = self.global.lock();
            vm_assert!(
                global.exclusive == ExclusiveState::Exclusive,
                "exclusive release by thread {} in state {:?}",
                thread.id(),
                global.exclusive
            );
        }

        self.run_release_hooks();
        access.exclusive_counter().store(0, Ordering::Relaxed);

        let list = self.threads.lock();
        let flags_guard = access.lock();
        access.clear(AccessFlags::NOT_AT_SAFE_POINT);
        let mut global = self.global.lock();

        if let Some(next) = global.queue.pop_front() {
            global.exclusive = ExclusiveState::HandingOff;
            // Keep running with our token; the successor waits for us to
            // report in on our next release.
            access.set(AccessFlags::HALT_EXCLUSIVE);
            vm_assert!(
                !access.flags().contains(AccessFlags::NOT_COUNTED_BY_EXCLUSIVE),
                "hand-off releaser {} is marked not counted",
                thread.id()
            );
            vm_assert!(
                global.exclusive_responses == 0,
                "hand-off with {} outstanding responses",
                global.exclusive_responses
            );
            // The successor always expects one critical response from us.
            // Pre-bias it away unless we really are inside a region.
            global.critical_responses = if access.flags().contains(AccessFlags::IN_CRITICAL) {
                access.critical_counted().store(true, Ordering::Release);
                0
            } else {
                -1
            };
            drop(flags_guard);
            self.hand_off(next, global, list);
        } else {
            global.exclusive = ExclusiveState::None;
            global.stats.clear_requester();
            self.global_cond.notify_all();
            drop(global);
            drop(flags_guard);
            self.wake_halted(
                &list,
                Some(thread),
                AccessFlags::HALT_EXCLUSIVE | AccessFlags::NOT_COUNTED_BY_EXCLUSIVE,
            );
            log::debug!("exclusive access released by thread {}", thread.id());
        }
    }

    fn hand_off(
        &self,
        next: Arc<VmThread>,
        global: MutexGuard<'_, GlobalState>,
        list: MutexGuard<'_, ThreadList>,
    ) {
        next.access()
            .clear(AccessFlags::HALT_EXCLUSIVE | AccessFlags::NOT_COUNTED_BY_EXCLUSIVE);
        log::trace!("exclusive access handed off to thread {}", next.id());
        drop(global);

        let _guard = next.access().lock();
        next.access().notify_all();
        self.stats.record_handoff();
        drop(list);
    }

    /// Exclusive access for a caller with no thread handle (a service
    /// thread outside the managed world).
    ///
    /// With `block == false` returns [`SyncError::WouldBlock`] instead of
    /// waiting for a current holder to finish.
    pub fn acquire_exclusive_from_external(&self, block: bool) -> Result<()> {
        let request = self.request_exclusive_from_external(block)?;
        self.await_exclusive_from_external(request);
        Ok(())
    }

    /// First half of an external acquire: claim the rendezvous and post
    /// halts, without waiting for anyone to respond.
    ///
    /// The state stays PENDING until the request is passed to
    /// [`await_exclusive_from_external`](Self::await_exclusive_from_external),
    /// so an incremental collector can do other work while mutators drain.
    pub fn request_exclusive_from_external(&self, block: bool) -> Result<ExternalRequest> {
        {
            let mut global = self.global.lock();
            while global.exclusive != ExclusiveState::None {
                if !block {
                    return Err(SyncError::WouldBlock);
                }
                self.global_cond.wait(&mut global);
            }
            global.exclusive = ExclusiveState::Pending;
            global.exclusive_responses = 0;
            global.critical_responses = 0;
            global.stats.begin(None);
        }

        let tally = {
            let list = self.threads.lock();
            self.post_exclusive_halts(&list, None)
        };
        Ok(ExternalRequest { tally })
    }

    /// Second half of an external acquire: wait for every response the
    /// request expects, then hold EXCLUSIVE.
    pub fn await_exclusive_from_external(&self, request: ExternalRequest) {
        let mut global = self.global.lock();
        vm_assert!(
            global.exclusive == ExclusiveState::Pending && global.stats.requester.is_none(),
            "external exclusive wait in state {:?}",
            global.exclusive
        );
        self.await_responses(&mut global, Rendezvous::Exclusive, request.tally);
        self.grant_exclusive(&mut global);
    }

    pub fn release_exclusive_from_external(&self) {
        {
            let global = self.global.lock();
            vm_assert!(
                global.exclusive == ExclusiveState::Exclusive && global.stats.requester.is_none(),
                "external exclusive release in state {:?}",
                global.exclusive
            );
        }

        self.run_release_hooks();

        let list = self.threads.lock();
        let mut global = self.global.lock();
        if let Some(next) = global.queue.pop_front() {
            global.exclusive = ExclusiveState::HandingOffFromExternal;
            self.hand_off(next, global, list);
        } else {
            global.exclusive = ExclusiveState::None;
            global.stats.clear_requester();
            self.global_cond.notify_all();
            drop(global);
            self.wake_halted(
                &list,
                None,
                AccessFlags::HALT_EXCLUSIVE | AccessFlags::NOT_COUNTED_BY_EXCLUSIVE,
            );
            log::debug!("external exclusive access released");
        }
    }

    /// Register maintenance to run while exclusivity is still held, just
    /// before each final release.
    pub fn add_exclusive_release_hook(&self, hook: ReleaseHook) {
        self.release_hooks.lock().push(hook);
    }

    fn run_release_hooks(&self) {
        for hook in self.release_hooks.lock().iter() {
            hook();
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn exclusive_state(&self) -> ExclusiveState {
        self.global.lock().exclusive
    }

    pub fn safepoint_state(&self) -> ExclusiveState {
        self.global.lock().safepoint
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive_state() == ExclusiveState::Exclusive
    }

    pub fn queue_len(&self) -> usize {
        self.global.lock().queue.len()
    }

    /// Ids of threads waiting in the exclusive FIFO, head first.
    pub fn queued_threads(&self) -> Vec<ThreadId> {
        self.global.lock().queue.iter().map(|t| t.id()).collect()
    }

    pub fn last_exclusive_stats(&self) -> ExclusiveAccessStats {
        self.global.lock().stats.clone()
    }

    /// Threads holding their token outside native code, `except` excluded.
    pub fn threads_running_managed_code(&self, except: Option<&VmThread>) -> usize {
        self.threads
            .lock()
            .iter()
            .filter(|t| !except.is_some_and(|e| std::ptr::eq(Arc::as_ptr(t), e)))
            .filter(|t| t.flags().running_managed_code())
            .count()
    }
}

impl fmt::Debug for VmAccessCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let global = self.global.lock();
        f.debug_struct("VmAccessCoordinator")
            .field("exclusive", &global.exclusive)
            .field("safepoint", &global.safepoint)
            .field("queued", &global.queue.len())
            .field("threads", &self.threads.len())
            .finish()
    }
}

/// Scoped exclusive access; released on drop.
pub struct ExclusiveGuard<'a> {
    coordinator: &'a VmAccessCoordinator,
    thread: &'a Arc<VmThread>,
}

impl<'a> ExclusiveGuard<'a> {
    pub fn new(coordinator: &'a VmAccessCoordinator, thread: &'a Arc<VmThread>) -> Self {
        coordinator.acquire_exclusive(thread);
        Self {
            coordinator,
            thread,
        }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release_exclusive(self.thread);
    }
}
