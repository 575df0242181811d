//! Thread list
//!
//! The list mutex is the first lock in the fixed acquisition order
//! (thread list → per-thread flags → global exclusive-access lock).
//! Requesters hold it while walking threads to post halts, so a thread can
//! neither attach nor detach in the middle of a walk.

use super::{ThreadId, VmThread};
use crate::sync::{AtomicU32, Mutex, MutexGuard};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub type ThreadList = Vec<Arc<VmThread>>;

pub struct ThreadRegistry {
    threads: Mutex<ThreadList>,
    next_id: AtomicU32,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    pub(crate) fn next_id(&self) -> ThreadId {
        ThreadId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Take the thread-list lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ThreadList> {
        self.threads.lock()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<VmThread>> {
        self.threads.lock().iter().find(|t| t.id() == id).cloned()
    }

    pub fn contains(&self, thread: &VmThread) -> bool {
        self.threads
            .lock()
            .iter()
            .any(|t| std::ptr::eq(Arc::as_ptr(t), thread))
    }

    /// Copy of the current list, for introspection.
    pub fn snapshot(&self) -> ThreadList {
        self.threads.lock().clone()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_not_reused() {
        let registry = ThreadRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_lookup() {
        let registry = ThreadRegistry::new();
        let id = registry.next_id();
        let thread = Arc::new(VmThread::new(id, "worker", 4));
        registry.lock().push(thread.clone());

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&thread));
        assert_eq!(registry.get(id).map(|t| t.id()), Some(id));

        registry.lock().retain(|t| t.id() != id);
        assert!(registry.is_empty());
        assert!(!registry.contains(&thread));
    }
}
