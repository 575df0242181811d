//! Runtime Context - Wiring of the Synchronization Substrate
//!
//! [`SyncRuntime`] owns one coordinator, one monitor table and one set of
//! counters, and hands out thread handles. Everything is reached through
//! it; there is no process-wide instance.
//!
//! It also carries the collaborator-facing entry points that need more than
//! one component: recorded monitor enters for the call-marshalling layer,
//! thread detach with orphan release, and GC-side table maintenance.

use crate::access::{ExclusiveGuard, VmAccessCoordinator};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::monitor::{MonitorRecord, MonitorTable, ObjectMonitor, TryEnter};
use crate::object::{ObjectHeader, ObjectId};
use crate::stats::{SyncStats, SyncSummary};
use crate::thread::{FrameId, MonitorEnterRecord, VmThread};
use crate::vm_assert;
use std::sync::Arc;
use std::time::Duration;

pub struct SyncRuntime {
    config: SyncConfig,
    coordinator: Arc<VmAccessCoordinator>,
    table: Arc<MonitorTable>,
    monitor: ObjectMonitor,
    stats: Arc<SyncStats>,
}

impl SyncRuntime {
    /// Create a runtime from a validated configuration.
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(SyncStats::new(config.stats_enabled));
        let coordinator = Arc::new(VmAccessCoordinator::new(&config, stats.clone()));
        let table = Arc::new(MonitorTable::new(config.max_monitors, stats.clone()));
        let monitor = ObjectMonitor::new(&config, coordinator.clone(), table.clone(), stats.clone());

        // Deflated records are freed at the end of the pause that retired them.
        {
            let table = Arc::downgrade(&table);
            coordinator.add_exclusive_release_hook(Box::new(move || {
                if let Some(table) = table.upgrade() {
                    table.reclaim_retired();
                }
            }));
        }

        log::debug!(
            "sync runtime created (reservation: {}, two-pass exclusive: {}, max monitors: {})",
            config.lock_reservation,
            config.two_pass_exclusive,
            config.max_monitors
        );

        Ok(Self {
            config,
            coordinator,
            table,
            monitor,
            stats,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<VmAccessCoordinator> {
        &self.coordinator
    }

    pub fn monitors(&self) -> &ObjectMonitor {
        &self.monitor
    }

    pub fn table(&self) -> &Arc<MonitorTable> {
        &self.table
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    pub fn summary(&self) -> SyncSummary {
        self.stats.summary()
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Register the calling thread. The handle starts without its token.
    pub fn attach_thread(&self, name: impl Into<String>) -> Arc<VmThread> {
        self.coordinator.attach(name, self.config.max_enter_records)
    }

    /// Unregister `thread`, force-releasing every monitor it entered through
    /// the recorded entry points. A monitor still held through plain
    /// [`enter`](Self::enter) afterwards is a fatal invariant violation.
    pub fn detach_thread(&self, thread: &Arc<VmThread>) -> Result<()> {
        let orphans = thread.enter_records().drain_all();
        if !orphans.is_empty() {
            log::warn!(
                "thread {} detaching with {} monitor enter records; releasing",
                thread.id(),
                orphans.len()
            );
            self.with_token(thread, |rt| rt.force_release(thread, orphans))?;
        }
        if thread.has_access() {
            self.coordinator.release_access(thread);
        }
        self.coordinator.detach(thread)
    }

    fn with_token<T>(&self, thread: &VmThread, f: impl FnOnce(&Self) -> T) -> T {
        let had = thread.has_access();
        if !had {
            self.coordinator.acquire_access(thread);
        }
        let out = f(self);
        if !had {
            self.coordinator.release_access(thread);
        }
        out
    }

    fn force_release(&self, thread: &VmThread, records: Vec<MonitorEnterRecord>) -> Result<usize> {
        let mut released = 0;
        for record in records {
            for _ in 0..record.count {
                self.monitor.exit(thread, record.object.as_ref())?;
                released += 1;
            }
        }
        Ok(released)
    }

    // ------------------------------------------------------------------
    // Monitors
    // ------------------------------------------------------------------

    pub fn enter(&self, thread: &Arc<VmThread>, object: &dyn ObjectHeader) -> Result<()> {
        self.monitor.enter(thread, object)
    }

    pub fn try_enter(&self, thread: &Arc<VmThread>, object: &dyn ObjectHeader) -> Result<TryEnter> {
        self.monitor.try_enter(thread, object)
    }

    pub fn exit(&self, thread: &VmThread, object: &dyn ObjectHeader) -> Result<()> {
        self.monitor.exit(thread, object)
    }

    pub fn wait(
        &self,
        thread: &Arc<VmThread>,
        object: &dyn ObjectHeader,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.monitor.wait(thread, object, timeout)
    }

    pub fn notify(&self, thread: &VmThread, object: &dyn ObjectHeader) -> Result<()> {
        self.monitor.notify(thread, object)
    }

    pub fn notify_all(&self, thread: &VmThread, object: &dyn ObjectHeader) -> Result<()> {
        self.monitor.notify_all(thread, object)
    }

    /// Enter on behalf of `frame`, keeping a record so the lock can be
    /// force-released if the frame unwinds abnormally.
    ///
    /// The record slot is checked before entering, so a full pool fails
    /// without taking the lock.
    pub fn enter_recorded(
        &self,
        thread: &Arc<VmThread>,
        object: Arc<dyn ObjectHeader>,
        frame: FrameId,
    ) -> Result<()> {
        thread.enter_records().reserve(object.object_id(), frame)?;
        self.monitor.enter(thread, object.as_ref())?;
        thread.enter_records().push(object, frame)
    }

    pub fn exit_recorded(&self, thread: &VmThread, object: &dyn ObjectHeader) -> Result<()> {
        self.monitor.exit(thread, object)?;
        if !thread.enter_records().pop(object.object_id()) {
            log::debug!(
                "thread {} exited object {} without an enter record",
                thread.id(),
                object.object_id()
            );
        }
        Ok(())
    }

    /// Release every monitor `frame` entered and did not exit. Returns the
    /// number of exits performed.
    pub fn release_frame_monitors(&self, thread: &VmThread, frame: FrameId) -> Result<usize> {
        let records = thread.enter_records().drain_frame(frame);
        self.force_release(thread, records)
    }

    // ------------------------------------------------------------------
    // Exclusive access and GC maintenance
    // ------------------------------------------------------------------

    pub fn exclusive<'a>(&'a self, thread: &'a Arc<VmThread>) -> ExclusiveGuard<'a> {
        ExclusiveGuard::new(&self.coordinator, thread)
    }

    /// Visit every live monitor record. Requires exclusive access.
    pub fn for_each_monitor<F>(&self, f: F)
    where
        F: FnMut(&MonitorRecord),
    {
        vm_assert!(
            self.coordinator.is_exclusive(),
            "walking the monitor table outside exclusive access"
        );
        self.table.for_each(f)
    }

    /// Re-key the monitor record of a moved object. Requires exclusive
    /// access.
    pub fn relocate(&self, from: ObjectId, to: ObjectId) -> bool {
        vm_assert!(
            self.coordinator.is_exclusive(),
            "relocating monitor of {} outside exclusive access",
            from
        );
        self.table.relocate(from, to)
    }

    /// Deflate the monitor of `object` if idle. Requires exclusive access.
    pub fn deflate(&self, object: &dyn ObjectHeader) -> bool {
        self.monitor.deflate(object)
    }
}
