//! Halting a single thread for inspection
//!
//! Debuggers and stack walkers need one particular thread stopped, not the
//! whole VM. `HALT_INSPECTION` is counted per target so several inspectors
//! can hold the same thread; the bit stays set until the last resume.

use super::VmAccessCoordinator;
use crate::thread::{AccessFlags, VmThread};
use crate::vm_assert;
use std::sync::atomic::Ordering;

impl VmAccessCoordinator {
    /// Stop `target` and return once it no longer holds its token (or is
    /// parked in native code, where it cannot touch the heap).
    ///
    /// `current` must hold its token. It is released while waiting, so two
    /// threads inspecting each other cannot deadlock: whichever notices it is
    /// itself being inspected backs off and retries.
    pub fn halt_thread_for_inspection(&self, current: &VmThread, target: &VmThread) {
        loop {
            vm_assert!(
                current.has_access(),
                "thread {} inspecting without its token",
                current.id()
            );
            if std::ptr::eq(current, target) {
                return;
            }

            let busy = AccessFlags::HAS_ACCESS | AccessFlags::QUEUED_FOR_EXCLUSIVE;
            {
                let access = target.access();
                let _guard = access.lock();
                access.inspection_counter().fetch_add(1, Ordering::Relaxed);
                let flags = access.set(AccessFlags::HALT_INSPECTION);
                if flags.in_native() || !flags.intersects(busy) {
                    return;
                }
            }

            self.release_access(current);
            {
                let access = target.access();
                let mut guard = access.lock();
                while !access.flags().in_native() && access.flags().intersects(busy) {
                    access.wait(&mut guard);
                }
            }
            self.acquire_access_with_mask(
                current,
                AccessFlags::HALT_ANY.difference(AccessFlags::HALT_INSPECTION),
            );

            if !current.flags().contains(AccessFlags::HALT_INSPECTION) {
                log::trace!("thread {} halted {} for inspection", current.id(), target.id());
                return;
            }
            // Someone is inspecting us: let them go first.
            self.undo_inspection_halt(target);
            self.release_access(current);
            self.acquire_access(current);
        }
    }

    pub fn resume_thread_for_inspection(&self, current: &VmThread, target: &VmThread) {
        if std::ptr::eq(current, target) {
            return;
        }
        self.undo_inspection_halt(target);
        if current.flags().contains(AccessFlags::HALT_INSPECTION) {
            self.release_access(current);
            self.acquire_access(current);
        }
    }

    fn undo_inspection_halt(&self, target: &VmThread) {
        let access = target.access();
        let _guard = access.lock();
        let count = access.inspection_count();
        vm_assert!(
            count > 0,
            "resuming thread {} that was never halted for inspection",
            target.id()
        );
        access.inspection_counter().store(count - 1, Ordering::Relaxed);
        if count == 1 {
            access.clear(AccessFlags::HALT_INSPECTION);
            access.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::access::VmAccessCoordinator;
    use crate::config::SyncConfig;
    use crate::stats::SyncStats;
    use crate::thread::AccessFlags;
    use std::sync::Arc;

    #[test]
    fn test_inspect_idle_thread_is_reentrant() {
        let vm = VmAccessCoordinator::new(&SyncConfig::default(), Arc::new(SyncStats::default()));
        let inspector = vm.attach("inspector", 8);
        let target = vm.attach("target", 8);
        vm.acquire_access(&inspector);

        vm.halt_thread_for_inspection(&inspector, &target);
        vm.halt_thread_for_inspection(&inspector, &target);
        assert_eq!(target.access().inspection_count(), 2);
        assert!(!vm.try_acquire_access(&target));

        vm.resume_thread_for_inspection(&inspector, &target);
        assert!(target.flags().contains(AccessFlags::HALT_INSPECTION));
        vm.resume_thread_for_inspection(&inspector, &target);
        assert_eq!(target.flags(), AccessFlags::EMPTY);

        vm.release_access(&inspector);
    }

    #[test]
    fn test_inspecting_self_is_a_no_op() {
        let vm = VmAccessCoordinator::new(&SyncConfig::default(), Arc::new(SyncStats::default()));
        let t = vm.attach("main", 8);
        vm.acquire_access(&t);
        vm.halt_thread_for_inspection(&t, &t);
        assert_eq!(t.flags(), AccessFlags::HAS_ACCESS);
        vm.resume_thread_for_inspection(&t, &t);
        vm.release_access(&t);
    }
}
