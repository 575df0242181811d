//! Object header collaborator
//!
//! The synchronization layer never decides object layout. It asks the
//! collaborator for two things: a stable identity key, and the address of
//! the inline lock word if the layout has one. Objects without an inline
//! lock word are locked through the alternate lock word of their record in
//! the [`MonitorTable`](crate::monitor::MonitorTable).

use crate::config::SpinCounts;
use crate::monitor::LockWord;
use std::fmt;
use std::sync::atomic::AtomicUsize;

/// Identity key of a managed object.
///
/// Must stay stable while a monitor record exists for the object. A moving
/// collector that changes identities rekeys the table with
/// [`MonitorTable::relocate`](crate::monitor::MonitorTable::relocate) during
/// an exclusive pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Layout-facing view of an object used by the monitor implementation.
pub trait ObjectHeader: Send + Sync {
    /// Identity key, see [`ObjectId`].
    fn object_id(&self) -> ObjectId;

    /// Inline lock word, `None` when the layout has no lock word slot.
    fn lockword(&self) -> Option<&AtomicUsize>;

    /// Per-type spin tuning. `None` uses the configured ladder.
    fn spin_override(&self) -> Option<SpinCounts> {
        None
    }
}

/// Plain object header used by embedders without their own layout, and by
/// the tests.
///
/// Identity is the header's address, so a `SyncObject` must not move while
/// it is locked or has a monitor record. Keep it behind `Arc`/`Box` or
/// borrow it in place.
#[derive(Debug)]
pub struct SyncObject {
    lockword: Option<AtomicUsize>,
    spin: Option<SpinCounts>,
}

impl SyncObject {
    /// Object with an inline, flat lock word.
    pub fn new() -> Self {
        Self {
            lockword: Some(AtomicUsize::new(LockWord::UNLOCKED.raw())),
            spin: None,
        }
    }

    /// Object whose lock word starts at the reservable baseline.
    pub fn reservable() -> Self {
        Self {
            lockword: Some(AtomicUsize::new(LockWord::RESERVABLE.raw())),
            spin: None,
        }
    }

    /// Object without an inline lock word.
    pub fn without_lockword() -> Self {
        Self {
            lockword: None,
            spin: None,
        }
    }

    pub fn with_spin(mut self, spin: SpinCounts) -> Self {
        self.spin = Some(spin);
        self
    }
}

impl Default for SyncObject {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectHeader for SyncObject {
    fn object_id(&self) -> ObjectId {
        ObjectId(self as *const Self as usize)
    }

    fn lockword(&self) -> Option<&AtomicUsize> {
        self.lockword.as_ref()
    }

    fn spin_override(&self) -> Option<SpinCounts> {
        self.spin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_identity_is_stable_and_distinct() {
        let a = Box::new(SyncObject::new());
        let b = Box::new(SyncObject::new());
        assert_eq!(a.object_id(), a.object_id());
        assert_ne!(a.object_id(), b.object_id());
    }

    #[test]
    fn test_initial_lockwords() {
        let flat = SyncObject::new();
        let reservable = SyncObject::reservable();
        let bare = SyncObject::without_lockword();

        assert_eq!(flat.lockword().map(|w| w.load(Ordering::Relaxed)), Some(0));
        assert_eq!(
            reservable.lockword().map(|w| w.load(Ordering::Relaxed)),
            Some(LockWord::RESERVABLE.raw())
        );
        assert!(bare.lockword().is_none());
    }
}
