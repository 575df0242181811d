//! Safepoints
//!
//! A safepoint is the weaker rendezvous: every other thread must reach a
//! consistent point (give up its token, or be in native code, or never have
//! held it), but unlike exclusive access there is no FIFO and no hand-off.
//! Concurrent safepoint requesters simply wait for the current one to
//! finish.
//!
//! A thread inside exclusive access carries `NOT_AT_SAFE_POINT`; it is
//! counted as a responder even without releasing its token, and reports once
//! it leaves exclusive access and releases.

use super::{ExclusiveState, HaltTally, Rendezvous, VmAccessCoordinator};
use crate::thread::{AccessFlags, ThreadList, VmThread};
use crate::vm_assert;
use std::sync::atomic::Ordering;
use std::time::Instant;

impl VmAccessCoordinator {
    /// Bring every thread, the caller included, to a safepoint. Reentrant.
    pub fn acquire_safepoint(&self, thread: &VmThread) {
        let access = thread.access();
        vm_assert!(
            access.flags().running_managed_code(),
            "thread {} requesting a safepoint without running managed code",
            thread.id()
        );
        vm_assert!(
            !access.flags().contains(AccessFlags::NOT_AT_SAFE_POINT),
            "thread {} requesting a safepoint from inside exclusive access",
            thread.id()
        );
        if access.safepoint_counter().fetch_add(1, Ordering::Relaxed) > 0 {
            return;
        }
        vm_assert!(
            access.exclusive_count() == 0,
            "thread {} requesting a safepoint while holding exclusive access",
            thread.id()
        );

        let start = Instant::now();
        self.release_access(thread);
        {
            let mut global = self.global.lock();
            while global.state(Rendezvous::SafePoint) != ExclusiveState::None {
                self.global_cond.wait(&mut global);
            }
            global.set_state(Rendezvous::SafePoint, ExclusiveState::Pending);
            *global.responses(Rendezvous::SafePoint) = 0;
        }

        let mut tally = {
            let list = self.threads.lock();
            self.post_safepoint_requests(&list)
        };

        loop {
            {
                let mut global = self.global.lock();
                self.await_responses(&mut global, Rendezvous::SafePoint, tally);
            }
            // Our own HALTED_AT_SAFE_POINT is ignored; a concurrent exclusive
            // holder is not.
            self.acquire_access_with_mask(thread, AccessFlags::HALT_EXCLUSIVE);

            let mut global = self.global.lock();
            if *global.responses(Rendezvous::SafePoint) == 0 {
                global.set_state(Rendezvous::SafePoint, ExclusiveState::Exclusive);
                break;
            }
            drop(global);
            log::trace!("safepoint responders changed, retrying");
            self.release_access(thread);
            tally = HaltTally::default();
        }

        {
            let _guard = access.lock();
            access.clear(AccessFlags::HALTED_AT_SAFE_POINT | AccessFlags::NOT_COUNTED_BY_SAFE_POINT);
        }
        self.stats.record_safepoint();
        log::debug!(
            "safepoint reached by thread {} after {:?}",
            thread.id(),
            start.elapsed()
        );
    }

    /// Request a safepoint from every thread. Caller holds the list lock.
    fn post_safepoint_requests(&self, list: &ThreadList) -> HaltTally {
        if self.two_pass {
            for thread in list.iter() {
                let _guard = thread.access().lock();
                thread
                    .access()
                    .set(AccessFlags::REQUEST_SAFE_POINT | AccessFlags::NOT_COUNTED_BY_SAFE_POINT);
            }
        }

        let mut tally = HaltTally::default();
        for thread in list.iter() {
            let access = thread.access();
            let _guard = access.lock();
            if !self.two_pass {
                access.set(AccessFlags::REQUEST_SAFE_POINT);
            }
            let flags = access.flags();
            let owes_response = !flags.in_native()
                && (flags.has_access() || flags.contains(AccessFlags::NOT_AT_SAFE_POINT));
            if owes_response {
                if self.two_pass {
                    access.clear(AccessFlags::NOT_COUNTED_BY_SAFE_POINT);
                }
                tally.token_holders += 1;
            } else {
                access.set(AccessFlags::NOT_COUNTED_BY_SAFE_POINT | AccessFlags::HALTED_AT_SAFE_POINT);
                access.clear(AccessFlags::REQUEST_SAFE_POINT);
            }
        }
        log::trace!("safepoint requested, {} responders", tally.token_holders);
        tally
    }

    /// Leave one level of safepoint; the outermost release resumes everyone.
    pub fn release_safepoint(&self, thread: &VmThread) {
        let access = thread.access();
        vm_assert!(
            access.safepoint_count() > 0,
            "thread {} releasing a safepoint it does not hold",
            thread.id()
        );
        if access.safepoint_counter().fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }

        let list = self.threads.lock();
        for t in list.iter() {
            let a = t.access();
            let _guard = a.lock();
            a.clear(
                AccessFlags::HALTED_AT_SAFE_POINT
                    | AccessFlags::NOT_COUNTED_BY_SAFE_POINT
                    | AccessFlags::REQUEST_SAFE_POINT,
            );
            a.notify_all();
        }
        let mut global = self.global.lock();
        global.set_state(Rendezvous::SafePoint, ExclusiveState::None);
        self.global_cond.notify_all();
        log::debug!("safepoint released by thread {}", thread.id());
    }
}

#[cfg(test)]
mod tests {
    use crate::access::{ExclusiveState, VmAccessCoordinator};
    use crate::config::SyncConfig;
    use crate::stats::SyncStats;
    use crate::thread::AccessFlags;
    use std::sync::Arc;

    #[test]
    fn test_safepoint_marks_idle_and_native_threads_halted() {
        let stats = Arc::new(SyncStats::default());
        let vm = VmAccessCoordinator::new(&SyncConfig::default(), stats.clone());
        let requester = vm.attach("requester", 8);
        let idle = vm.attach("idle", 8);
        let native = vm.attach("native", 8);
        vm.acquire_access(&requester);
        vm.acquire_access(&native);
        vm.exit_to_native(&native);

        vm.acquire_safepoint(&requester);
        vm.acquire_safepoint(&requester);
        assert_eq!(vm.safepoint_state(), ExclusiveState::Exclusive);
        assert!(requester.has_access());
        assert!(!requester.flags().contains(AccessFlags::HALTED_AT_SAFE_POINT));
        assert!(idle.flags().contains(AccessFlags::HALTED_AT_SAFE_POINT));
        assert!(native.flags().contains(AccessFlags::HALTED_AT_SAFE_POINT));
        assert!(!vm.try_acquire_access(&idle));

        vm.release_safepoint(&requester);
        assert_eq!(vm.safepoint_state(), ExclusiveState::Exclusive);
        vm.release_safepoint(&requester);
        assert_eq!(vm.safepoint_state(), ExclusiveState::None);
        assert!(!idle.flags().is_halted());
        assert_eq!(stats.summary().safepoints, 1);

        vm.enter_from_native(&native);
        vm.release_access(&native);
        vm.release_access(&requester);
    }

    #[test]
    fn test_single_pass_safepoint() {
        let config = SyncConfig {
            two_pass_exclusive: false,
            ..SyncConfig::default()
        };
        let vm = VmAccessCoordinator::new(&config, Arc::new(SyncStats::default()));
        let t = vm.attach("main", 8);
        let other = vm.attach("other", 8);
        vm.acquire_access(&t);

        vm.acquire_safepoint(&t);
        assert!(other.flags().contains(AccessFlags::NOT_COUNTED_BY_SAFE_POINT));
        vm.release_safepoint(&t);
        assert_eq!(other.flags(), AccessFlags::EMPTY);
        vm.release_access(&t);
    }
}
