//! Monitor-enter records
//!
//! A stack of (object, frame, count) entries per thread, kept for monitors
//! entered through the call-marshalling boundary. They let the runtime
//! force-release orphaned locks when a frame unwinds abnormally or the
//! thread detaches.

use crate::ensure;
use crate::error::{Result, SyncError};
use crate::object::{ObjectHeader, ObjectId};
use std::fmt;
use std::sync::Arc;

/// Identity of the frame that entered a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub usize);

pub struct MonitorEnterRecord {
    pub(crate) object: Arc<dyn ObjectHeader>,
    pub frame: FrameId,
    /// Entries of `object` made by `frame`
    pub count: usize,
}

impl MonitorEnterRecord {
    pub fn object_id(&self) -> ObjectId {
        self.object.object_id()
    }
}

impl fmt::Debug for MonitorEnterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorEnterRecord")
            .field("object", &self.object_id())
            .field("frame", &self.frame)
            .field("count", &self.count)
            .finish()
    }
}

#[derive(Debug)]
pub struct EnterRecordStack {
    records: Vec<MonitorEnterRecord>,
    capacity: usize,
}

impl EnterRecordStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Room for one more entry of `object` by `frame`?
    ///
    /// Checked before the monitor is entered so a full pool never leaves an
    /// unrecorded lock behind.
    pub fn reserve(&self, object: ObjectId, frame: FrameId) -> Result<()> {
        let merges = self
            .records
            .last()
            .is_some_and(|top| top.frame == frame && top.object_id() == object);
        ensure!(
            merges || self.records.len() < self.capacity,
            SyncError::AllocationFailure {
                resource: "monitor enter records",
                limit: self.capacity,
            }
        );
        Ok(())
    }

    pub fn push(&mut self, object: Arc<dyn ObjectHeader>, frame: FrameId) -> Result<()> {
        let id = object.object_id();
        self.reserve(id, frame)?;
        match self.records.last_mut() {
            Some(top) if top.frame == frame && top.object_id() == id => top.count += 1,
            _ => self.records.push(MonitorEnterRecord {
                object,
                frame,
                count: 1,
            }),
        }
        Ok(())
    }

    /// Drop one entry of `object`, searching from the top of the stack.
    /// Returns `false` when no record names the object.
    pub fn pop(&mut self, object: ObjectId) -> bool {
        let Some(pos) = self.records.iter().rposition(|r| r.object_id() == object) else {
            return false;
        };
        let record = &mut self.records[pos];
        record.count -= 1;
        if record.count == 0 {
            self.records.remove(pos);
        }
        true
    }

    /// Remove every record made by `frame`, topmost first.
    pub fn drain_frame(&mut self, frame: FrameId) -> Vec<MonitorEnterRecord> {
        let mut drained = Vec::new();
        let mut i = self.records.len();
        while i > 0 {
            i -= 1;
            if self.records[i].frame == frame {
                drained.push(self.records.remove(i));
            }
        }
        drained
    }

    /// Remove every record, topmost first.
    pub fn drain_all(&mut self) -> Vec<MonitorEnterRecord> {
        let mut drained: Vec<_> = self.records.drain(..).collect();
        drained.reverse();
        drained
    }
}
