//! Primitives under the access protocol
//!
//! The flags words, the thread list and the global exclusive-access state are
//! built on these names. Normally they are `parking_lot` locks and std
//! atomics; with `--cfg loom` they become loom's model-checked versions so
//! the owner/requester race on the flags word can be explored exhaustively:
//!
//! ```text
//! RUSTFLAGS="--cfg loom" cargo test --release -p vmsync --lib loom_
//! ```
//!
//! Only the `loom_` tests run under loom; everything else expects real
//! threads.

#[cfg(not(loom))]
pub(crate) use parking_lot::{Condvar, Mutex, MutexGuard};
#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize};

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize};
#[cfg(loom)]
pub(crate) use self::model::{Condvar, Mutex, MutexGuard};

/// loom's std-shaped locks behind the `parking_lot` call shapes used here.
#[cfg(loom)]
mod model {
    use std::ops::{Deref, DerefMut};

    #[derive(Debug)]
    pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self(loom::sync::Mutex::new(value))
        }

        pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
            let guard = match self.0.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            MutexGuard(Some(guard))
        }
    }

    /// Always `Some` outside [`Condvar::wait`].
    pub(crate) struct MutexGuard<'a, T>(Option<loom::sync::MutexGuard<'a, T>>);

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            match &self.0 {
                Some(guard) => guard,
                None => unreachable!("guard taken by a condvar wait"),
            }
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            match &mut self.0 {
                Some(guard) => guard,
                None => unreachable!("guard taken by a condvar wait"),
            }
        }
    }

    #[derive(Debug)]
    pub(crate) struct Condvar(loom::sync::Condvar);

    impl Condvar {
        pub(crate) fn new() -> Self {
            Self(loom::sync::Condvar::new())
        }

        pub(crate) fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
            if let Some(inner) = guard.0.take() {
                guard.0 = Some(match self.0.wait(inner) {
                    Ok(inner) => inner,
                    Err(poisoned) => poisoned.into_inner(),
                });
            }
        }

        pub(crate) fn notify_all(&self) {
            self.0.notify_all();
        }
    }
}
