//! Native-code and critical-region transitions
//!
//! A thread running native code keeps its token (`HAS_ACCESS`) but sets
//! `IN_NATIVE`. Requesters treat it as already stopped: it cannot touch the
//! heap until it comes back through [`VmAccessCoordinator::enter_from_native`],
//! which honours any halt posted in the meantime.
//!
//! A critical region pins raw heap memory. An exclusive requester may halt
//! everyone else, but it must also wait for threads to leave their critical
//! regions before it is granted exclusivity.

use super::VmAccessCoordinator;
use crate::thread::{AccessFlags, ThreadStatus, VmThread};
use crate::vm_assert;
use std::sync::atomic::Ordering;

impl VmAccessCoordinator {
    /// Leave managed code. Never blocks.
    pub fn exit_to_native(&self, thread: &VmThread) {
        let access = thread.access();
        if !access.transition(
            AccessFlags::HAS_ACCESS,
            AccessFlags::HAS_ACCESS | AccessFlags::IN_NATIVE,
        ) {
            let _guard = access.lock();
            let prev = access.set(AccessFlags::IN_NATIVE);
            vm_assert!(
                prev.has_access() && !prev.in_native(),
                "thread {} exiting to native from state {:?}",
                thread.id(),
                prev
            );
            if prev.intersects(AccessFlags::RELEASE_REQUIRED) {
                self.release_access_locked(thread);
            }
        }
        thread.set_status(ThreadStatus::Native);
    }

    /// Return to managed code, waiting out any halt posted while away.
    pub fn enter_from_native(&self, thread: &VmThread) {
        let access = thread.access();
        if !access.transition(
            AccessFlags::HAS_ACCESS | AccessFlags::IN_NATIVE,
            AccessFlags::HAS_ACCESS,
        ) {
            let mut guard = access.lock();
            let prev = access.clear(AccessFlags::IN_NATIVE);
            vm_assert!(
                prev.in_native(),
                "thread {} entering from native while not in native",
                thread.id()
            );
            if prev.has_access() && prev.intersects(AccessFlags::RELEASE_REQUIRED) {
                log::trace!("thread {} returning from native under {:?}", thread.id(), prev);
                self.release_access_locked(thread);
            }
            if !access.flags().has_access() {
                self.acquire_access_locked(thread, &mut guard, AccessFlags::HALT_ANY);
            }
        }
        thread.set_status(ThreadStatus::Running);
    }

    /// Enter a (nestable) critical region.
    pub fn enter_critical(&self, thread: &VmThread) {
        let access = thread.access();
        vm_assert!(
            access.flags().running_managed_code(),
            "thread {} entering a critical region without running managed code",
            thread.id()
        );
        if access.critical_counter().fetch_add(1, Ordering::Relaxed) > 0 {
            return;
        }

        let _guard = access.lock();
        let prev = access.set(AccessFlags::IN_CRITICAL);
        // Halts already classified this thread as a plain token holder; the
        // requester also has to wait for this region to end.
        if prev.contains(AccessFlags::HALT_EXCLUSIVE)
            && !prev.contains(AccessFlags::NOT_COUNTED_BY_EXCLUSIVE)
        {
            access.critical_counted().store(true, Ordering::Release);
            self.global().critical_responses += 1;
        }
    }

    /// Leave a critical region. Also legal from native code.
    pub fn exit_critical(&self, thread: &VmThread) {
        let access = thread.access();
        let depth = access.critical_depth();
        vm_assert!(
            depth > 0,
            "thread {} exiting a critical region it never entered",
            thread.id()
        );
        if access.critical_counter().fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }

        let _guard = access.lock();
        access.clear(AccessFlags::IN_CRITICAL);
        self.leave_counted_critical(thread);
    }
}

#[cfg(test)]
mod tests {
    use crate::access::VmAccessCoordinator;
    use crate::config::SyncConfig;
    use crate::stats::SyncStats;
    use crate::thread::{AccessFlags, ThreadStatus};
    use std::sync::Arc;

    fn coordinator() -> VmAccessCoordinator {
        VmAccessCoordinator::new(&SyncConfig::default(), Arc::new(SyncStats::default()))
    }

    #[test]
    fn test_native_round_trip_fast_path() {
        let vm = coordinator();
        let t = vm.attach("main", 8);
        vm.acquire_access(&t);

        vm.exit_to_native(&t);
        assert_eq!(t.flags(), AccessFlags::HAS_ACCESS | AccessFlags::IN_NATIVE);
        assert_eq!(t.status(), ThreadStatus::Native);
        assert_eq!(vm.threads_running_managed_code(None), 0);

        vm.enter_from_native(&t);
        assert_eq!(t.flags(), AccessFlags::HAS_ACCESS);
        assert_eq!(t.status(), ThreadStatus::Running);
        vm.release_access(&t);
    }

    #[test]
    fn test_native_thread_does_not_delay_exclusive() {
        let vm = coordinator();
        let requester = vm.attach("requester", 8);
        let native = vm.attach("native", 8);
        vm.acquire_access(&requester);
        vm.acquire_access(&native);
        vm.exit_to_native(&native);

        vm.acquire_exclusive(&requester);
        let flags = native.flags();
        assert!(flags.contains(AccessFlags::HALT_EXCLUSIVE));
        assert!(flags.contains(AccessFlags::NOT_COUNTED_BY_EXCLUSIVE));
        vm.release_exclusive(&requester);

        vm.enter_from_native(&native);
        assert_eq!(native.flags(), AccessFlags::HAS_ACCESS);
        vm.release_access(&native);
        vm.release_access(&requester);
    }

    #[test]
    fn test_critical_regions_nest() {
        let vm = coordinator();
        let t = vm.attach("main", 8);
        vm.acquire_access(&t);

        vm.enter_critical(&t);
        vm.enter_critical(&t);
        assert_eq!(t.access().critical_depth(), 2);
        vm.exit_critical(&t);
        assert!(t.flags().contains(AccessFlags::IN_CRITICAL));
        vm.exit_critical(&t);
        assert!(!t.flags().contains(AccessFlags::IN_CRITICAL));
        vm.release_access(&t);
    }

    #[test]
    fn test_exit_critical_from_native() {
        let vm = coordinator();
        let t = vm.attach("main", 8);
        vm.acquire_access(&t);
        vm.enter_critical(&t);
        vm.exit_to_native(&t);
        vm.exit_critical(&t);
        assert_eq!(t.flags(), AccessFlags::HAS_ACCESS | AccessFlags::IN_NATIVE);
        vm.enter_from_native(&t);
        vm.release_access(&t);
    }
}
