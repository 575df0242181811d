//! Monitor table
//!
//! Maps object identity to its heavyweight [`MonitorRecord`]. Lookups are
//! sharded through DashMap so unrelated objects never contend on the table.
//!
//! At most one record exists per object: creation goes through the map's
//! entry API, which holds the shard lock for the key while the record is
//! built and inserted.
//!
//! Relocation, deflation and iteration are GC-side maintenance and run
//! under exclusive VM access; the table itself does not check that.

use super::record::MonitorRecord;
use crate::error::{Result, SyncError};
use crate::object::ObjectId;
use crate::stats::SyncStats;
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct MonitorTable {
    records: DashMap<ObjectId, Arc<MonitorRecord>, RandomState>,
    /// Records in the map. Tracked separately from the map length so the
    /// capacity check never has to touch other shards.
    live: AtomicUsize,
    /// 0 = unbounded
    capacity: usize,
    /// Deflated records awaiting reclamation
    retired: Mutex<Vec<Arc<MonitorRecord>>>,
    stats: Arc<SyncStats>,
}

impl MonitorTable {
    pub fn new(capacity: usize, stats: Arc<SyncStats>) -> Self {
        Self {
            records: DashMap::with_hasher(RandomState::new()),
            live: AtomicUsize::new(0),
            capacity,
            retired: Mutex::new(Vec::new()),
            stats,
        }
    }

    pub fn get(&self, object: ObjectId) -> Option<Arc<MonitorRecord>> {
        self.records.get(&object).map(|r| r.value().clone())
    }

    /// Record of `object`, created on first use.
    ///
    /// Fails with [`SyncError::AllocationFailure`] once `capacity` records
    /// are live.
    pub fn get_or_create(&self, object: ObjectId) -> Result<Arc<MonitorRecord>> {
        if let Some(record) = self.get(object) {
            return Ok(record);
        }

        match self.records.entry(object) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let capacity = self.capacity;
                self.live
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (capacity == 0 || n < capacity).then_some(n + 1)
                    })
                    .map_err(|_| SyncError::AllocationFailure {
                        resource: "monitor table",
                        limit: capacity,
                    })?;

                let record = Arc::new(MonitorRecord::new(object));
                e.insert(record.clone());
                self.stats.record_record_allocated();
                log::trace!("monitor record allocated for object {}", object);
                Ok(record)
            }
        }
    }

    /// Re-key the record of a moved object. Returns `false` if the object
    /// has no record.
    pub fn relocate(&self, from: ObjectId, to: ObjectId) -> bool {
        match self.records.remove(&from) {
            Some((_, record)) => {
                record.set_object(to);
                self.records.insert(to, record);
                true
            }
            None => false,
        }
    }

    /// Unlink the record of `object` and park it on the retired list.
    pub(crate) fn retire(&self, object: ObjectId) -> Option<Arc<MonitorRecord>> {
        let (_, record) = self.records.remove(&object)?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.retired.lock().push(record.clone());
        Some(record)
    }

    /// Free retired records. Returns how many were released.
    pub fn reclaim_retired(&self) -> usize {
        let drained: Vec<_> = self.retired.lock().drain(..).collect();
        if !drained.is_empty() {
            log::trace!("reclaimed {} retired monitor records", drained.len());
        }
        drained.len()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&MonitorRecord),
    {
        for entry in self.records.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> ObjectId {
        ObjectId::from_raw(n * 64)
    }

    #[test]
    fn test_one_record_per_object() {
        let stats = Arc::new(SyncStats::default());
        let table = MonitorTable::new(0, stats.clone());
        let a = table.get_or_create(id(1)).expect("create");
        let b = table.get_or_create(id(1)).expect("lookup");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert_eq!(stats.records_allocated(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let table = MonitorTable::new(2, Arc::new(SyncStats::default()));
        table.get_or_create(id(1)).expect("first");
        table.get_or_create(id(2)).expect("second");
        let err = table.get_or_create(id(3)).unwrap_err();
        assert!(matches!(
            err,
            SyncError::AllocationFailure {
                resource: "monitor table",
                limit: 2
            }
        ));
        // Existing records are still reachable at capacity.
        assert!(table.get_or_create(id(1)).is_ok());
    }

    #[test]
    fn test_relocate_and_retire() {
        let table = MonitorTable::new(1, Arc::new(SyncStats::default()));
        let record = table.get_or_create(id(1)).expect("create");
        assert!(table.relocate(id(1), id(9)));
        assert!(table.get(id(1)).is_none());
        assert_eq!(record.object(), id(9));
        assert!(!table.relocate(id(1), id(2)));

        assert!(table.retire(id(9)).is_some());
        assert!(table.is_empty());
        assert_eq!(table.retired_len(), 1);
        // Retiring frees capacity.
        table.get_or_create(id(2)).expect("slot freed");
        assert_eq!(table.reclaim_retired(), 1);
        assert_eq!(table.retired_len(), 0);
    }

    #[test]
    fn test_for_each_visits_all() {
        let table = MonitorTable::new(0, Arc::new(SyncStats::default()));
        for n in 1..=4 {
            table.get_or_create(id(n)).expect("create");
        }
        let mut seen = 0;
        table.for_each(|_| seen += 1);
        assert_eq!(seen, 4);
    }
}
