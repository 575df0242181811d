//! Monitor Correctness Tests
//!
//! Single- and two-thread behaviour of object monitors:
//! - thin-lock round trips and recursion
//! - saturation and inflation
//! - lock reservation and its cancellation
//! - wait / notify
//! - illegal-state and allocation failures
//! - recorded enters and frame release

mod common;

use common::{wait_until, SyncFixture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vmsync::{FrameId, LockWord, ObjectHeader, SyncConfig, SyncError, SyncObject, TryEnter};

// ============================================================================
// THIN LOCKS
// ============================================================================

/// Uncontended enter/exit never touches the monitor table.
#[test]
fn test_uncontended_round_trip_stays_thin() {
    let fx = SyncFixture::with_defaults();
    let t = fx.running_thread("main");
    let obj = SyncObject::new();

    fx.rt.enter(&t, &obj).expect("enter");
    let word = fx.rt.monitors().lockword(&obj).expect("inline word");
    assert!(!word.is_inflated());
    assert_eq!(word.owner(), t.lock_token());
    assert_eq!(fx.rt.monitors().entry_count(&t, &obj), 1);

    fx.rt.exit(&t, &obj).expect("exit");
    assert_eq!(fx.rt.monitors().lockword(&obj), Some(LockWord::UNLOCKED));
    assert_eq!(fx.rt.stats().records_allocated(), 0);
    assert!(fx.rt.table().is_empty());

    fx.rt.coordinator().release_access(&t);
}

#[test]
fn test_recursion_counts_match_exits() {
    let fx = SyncFixture::with_defaults();
    let t = fx.running_thread("main");
    let obj = SyncObject::new();

    for depth in 1..=5 {
        fx.rt.enter(&t, &obj).expect("enter");
        assert_eq!(fx.rt.monitors().entry_count(&t, &obj), depth);
    }
    for depth in (0..5).rev() {
        fx.rt.exit(&t, &obj).expect("exit");
        assert_eq!(fx.rt.monitors().entry_count(&t, &obj), depth);
    }
    assert!(fx.rt.monitors().lockword(&obj).expect("word").is_free());

    let summary = fx.rt.summary();
    assert_eq!(summary.fast_enters, 1);
    assert_eq!(summary.recursive_enters, 4);

    fx.rt.coordinator().release_access(&t);
}

/// Entering past the recursion field's range inflates without losing count.
#[test]
fn test_recursion_overflow_inflates() {
    let fx = SyncFixture::with_defaults();
    let t = fx.running_thread("main");
    let obj = SyncObject::new();

    let depth = LockWord::MAX_RECURSION + 4;
    for _ in 0..depth {
        fx.rt.enter(&t, &obj).expect("enter");
    }
    assert!(fx.rt.monitors().lockword(&obj).expect("word").is_inflated());
    assert_eq!(fx.rt.monitors().entry_count(&t, &obj), depth);
    assert_eq!(fx.rt.summary().inflations, 1);

    for _ in 0..depth {
        fx.rt.exit(&t, &obj).expect("exit");
    }
    assert!(!fx.rt.monitors().holds_lock(&t, &obj));
    assert!(matches!(
        fx.rt.exit(&t, &obj),
        Err(SyncError::IllegalMonitorState { .. })
    ));

    fx.rt.coordinator().release_access(&t);
}

// ============================================================================
// RESERVATION
// ============================================================================

#[test]
fn test_reservation_sticks_to_first_owner() {
    let fx = SyncFixture::with_defaults();
    let t = fx.running_thread("owner");
    let obj = SyncObject::reservable();

    fx.rt.enter(&t, &obj).expect("enter");
    fx.rt.exit(&t, &obj).expect("exit");

    let word = fx.rt.monitors().lockword(&obj).expect("word");
    assert!(word.is_reserved());
    assert_eq!(word.owner(), t.lock_token());
    assert_eq!(word.entry_count(), 0);

    // Re-entry by the owner stays on the fast path.
    fx.rt.enter(&t, &obj).expect("re-enter");
    assert_eq!(fx.rt.monitors().entry_count(&t, &obj), 1);
    fx.rt.exit(&t, &obj).expect("exit");

    fx.rt.coordinator().release_access(&t);
}

/// A second thread cancels the reservation instead of waiting for it.
#[test]
fn test_reservation_cancelled_by_contender() {
    let fx = SyncFixture::with_defaults();
    let owner = fx.running_thread("owner");
    let obj = Arc::new(SyncObject::reservable());

    fx.rt.enter(&owner, obj.as_ref()).expect("enter");
    fx.rt.exit(&owner, obj.as_ref()).expect("exit");
    // Owner leaves managed code so the cancelling thread can go exclusive.
    fx.rt.coordinator().release_access(&owner);

    let handle = fx.spawn("contender", {
        let obj = obj.clone();
        move |rt, me| {
            rt.enter(me, obj.as_ref()).expect("enter");
            let holds = rt.monitors().holds_lock(me, obj.as_ref());
            rt.exit(me, obj.as_ref()).expect("exit");
            rt.coordinator().release_access(me);
            holds
        }
    });
    assert!(handle.join().expect("contender"));
    assert_eq!(fx.rt.summary().reservation_cancellations, 1);

    let word = fx.rt.monitors().lockword(obj.as_ref()).expect("word");
    assert!(!word.is_reserved());
}

#[test]
fn test_reservation_disabled_by_config() {
    let fx = SyncFixture::with_config(SyncConfig {
        lock_reservation: false,
        ..SyncFixture::config()
    });
    let t = fx.running_thread("main");
    let obj = SyncObject::reservable();

    fx.rt.enter(&t, &obj).expect("enter");
    assert!(!fx.rt.monitors().lockword(&obj).expect("word").is_reserved());
    fx.rt.exit(&t, &obj).expect("exit");
    // Enter and exit leave the word exactly as it was.
    assert_eq!(fx.rt.monitors().lockword(&obj), Some(LockWord::RESERVABLE));

    fx.rt.coordinator().release_access(&t);
}

// ============================================================================
// WAIT / NOTIFY
// ============================================================================

#[test]
fn test_timed_wait_returns_false() {
    let fx = SyncFixture::with_defaults();
    let t = fx.running_thread("main");
    let obj = SyncObject::new();

    fx.rt.enter(&t, &obj).expect("enter");
    fx.rt.enter(&t, &obj).expect("re-enter");
    let notified = fx
        .rt
        .wait(&t, &obj, Some(Duration::from_millis(5)))
        .expect("wait");
    assert!(!notified);
    // The full entry count comes back after the wait.
    assert_eq!(fx.rt.monitors().entry_count(&t, &obj), 2);
    assert!(t.has_access());

    fx.rt.exit(&t, &obj).expect("exit");
    fx.rt.exit(&t, &obj).expect("exit");
    fx.rt.coordinator().release_access(&t);
}

#[test]
fn test_notify_wakes_waiter() {
    let fx = SyncFixture::with_defaults();
    let obj = Arc::new(SyncObject::new());
    let ready = Arc::new(AtomicBool::new(false));

    let waiter = fx.spawn("waiter", {
        let obj = obj.clone();
        let ready = ready.clone();
        move |rt, me| {
            rt.enter(me, obj.as_ref()).expect("enter");
            ready.store(true, Ordering::Release);
            let notified = rt.wait(me, obj.as_ref(), None).expect("wait");
            rt.exit(me, obj.as_ref()).expect("exit");
            rt.coordinator().release_access(me);
            notified
        }
    });

    let t = fx.running_thread("notifier");
    wait_until(|| ready.load(Ordering::Acquire), "waiter to enter");
    wait_until(
        || {
            fx.rt
                .table()
                .get(obj.object_id())
                .is_some_and(|r| r.monitor.waiters() == 1)
        },
        "waiter to park",
    );

    fx.rt.enter(&t, obj.as_ref()).expect("enter");
    fx.rt.notify(&t, obj.as_ref()).expect("notify");
    fx.rt.exit(&t, obj.as_ref()).expect("exit");
    fx.rt.coordinator().release_access(&t);

    assert!(waiter.join().expect("waiter"));
}

#[test]
fn test_notify_all_wakes_every_waiter() {
    let fx = SyncFixture::with_defaults();
    let obj = Arc::new(SyncObject::new());
    let waiters = 4;

    let handles: Vec<_> = (0..waiters)
        .map(|i| {
            let obj = obj.clone();
            fx.spawn(&format!("waiter-{}", i), move |rt, me| {
                rt.enter(me, obj.as_ref()).expect("enter");
                let notified = rt.wait(me, obj.as_ref(), None).expect("wait");
                rt.exit(me, obj.as_ref()).expect("exit");
                rt.coordinator().release_access(me);
                notified
            })
        })
        .collect();

    wait_until(
        || {
            fx.rt
                .table()
                .get(obj.object_id())
                .is_some_and(|r| r.monitor.waiters() == waiters)
        },
        "all waiters to park",
    );

    let t = fx.running_thread("notifier");
    fx.rt.enter(&t, obj.as_ref()).expect("enter");
    fx.rt.notify_all(&t, obj.as_ref()).expect("notify_all");
    fx.rt.exit(&t, obj.as_ref()).expect("exit");
    fx.rt.coordinator().release_access(&t);

    for h in handles {
        assert!(h.join().expect("waiter"));
    }
}

// ============================================================================
// FAILURES
// ============================================================================

#[test]
fn test_illegal_state_for_non_owner() {
    let fx = SyncFixture::with_defaults();
    let owner = fx.running_thread("owner");
    let other = fx.running_thread("other");
    let obj = SyncObject::new();

    // Not locked at all.
    assert!(matches!(
        fx.rt.notify(&owner, &obj),
        Err(SyncError::IllegalMonitorState { .. })
    ));
    assert!(matches!(
        fx.rt.wait(&owner, &obj, Some(Duration::from_millis(1))),
        Err(SyncError::IllegalMonitorState { .. })
    ));

    fx.rt.enter(&owner, &obj).expect("enter");
    match fx.rt.exit(&other, &obj) {
        Err(SyncError::IllegalMonitorState { object, thread }) => {
            assert_eq!(object, obj.object_id());
            assert_eq!(thread, other.id());
        }
        other => panic!("expected IllegalMonitorState, got {:?}", other),
    }
    assert!(fx.rt.notify_all(&other, &obj).is_err());
    // The owner is unaffected.
    assert_eq!(fx.rt.monitors().entry_count(&owner, &obj), 1);
    fx.rt.exit(&owner, &obj).expect("exit");

    fx.rt.coordinator().release_access(&owner);
    fx.rt.coordinator().release_access(&other);
}

#[test]
fn test_monitor_table_exhaustion() {
    let fx = SyncFixture::with_config(SyncConfig {
        max_monitors: 1,
        ..SyncFixture::config()
    });
    let t = fx.running_thread("main");
    let first = SyncObject::without_lockword();
    let second = SyncObject::without_lockword();

    fx.rt.enter(&t, &first).expect("first record fits");
    match fx.rt.enter(&t, &second) {
        Err(SyncError::AllocationFailure { limit, .. }) => assert_eq!(limit, 1),
        other => panic!("expected AllocationFailure, got {:?}", other),
    }
    assert!(!fx.rt.monitors().holds_lock(&t, &second));
    fx.rt.exit(&t, &first).expect("exit");

    fx.rt.coordinator().release_access(&t);
}

#[test]
fn test_try_enter_reports_contention() {
    let fx = SyncFixture::with_defaults();
    let owner = fx.running_thread("owner");
    let obj = Arc::new(SyncObject::new());
    fx.rt.enter(&owner, obj.as_ref()).expect("enter");

    let result = fx
        .spawn("contender", {
            let obj = obj.clone();
            move |rt, me| {
                let r = rt.try_enter(me, obj.as_ref()).expect("try_enter");
                rt.coordinator().release_access(me);
                r
            }
        })
        .join()
        .expect("contender");
    assert_eq!(result, TryEnter::WouldBlock);
    // A failed try-enter leaves a record behind for the blocking retry.
    assert!(fx.rt.table().get(obj.object_id()).is_some());

    fx.rt.exit(&owner, obj.as_ref()).expect("exit");
    assert_eq!(
        fx.rt.try_enter(&owner, obj.as_ref()).expect("try_enter"),
        TryEnter::Acquired
    );
    fx.rt.exit(&owner, obj.as_ref()).expect("exit");
    fx.rt.coordinator().release_access(&owner);
}

// ============================================================================
// ENTER RECORDS
// ============================================================================

#[test]
fn test_release_frame_monitors() -> anyhow::Result<()> {
    let fx = SyncFixture::with_defaults();
    let t = fx.running_thread("main");
    let a: Arc<dyn ObjectHeader> = Arc::new(SyncObject::new());
    let b: Arc<dyn ObjectHeader> = Arc::new(SyncObject::new());

    fx.rt.enter_recorded(&t, a.clone(), FrameId(1))?;
    fx.rt.enter_recorded(&t, b.clone(), FrameId(2))?;
    fx.rt.enter_recorded(&t, b.clone(), FrameId(2))?;
    assert_eq!(t.enter_record_count(), 2);

    // Frame 2 unwinds abnormally.
    let released = fx.rt.release_frame_monitors(&t, FrameId(2))?;
    assert_eq!(released, 2);
    assert!(!fx.rt.monitors().holds_lock(&t, b.as_ref()));
    assert!(fx.rt.monitors().holds_lock(&t, a.as_ref()));

    fx.rt.exit_recorded(&t, a.as_ref())?;
    assert_eq!(t.enter_record_count(), 0);
    fx.rt.coordinator().release_access(&t);
    Ok(())
}

#[test]
fn test_enter_record_pool_exhaustion_leaves_lock_free() {
    let fx = SyncFixture::with_config(SyncConfig {
        max_enter_records: 1,
        ..SyncFixture::config()
    });
    let t = fx.running_thread("main");
    let a: Arc<dyn ObjectHeader> = Arc::new(SyncObject::new());
    let b: Arc<dyn ObjectHeader> = Arc::new(SyncObject::new());

    fx.rt.enter_recorded(&t, a.clone(), FrameId(1)).expect("enter a");
    assert!(matches!(
        fx.rt.enter_recorded(&t, b.clone(), FrameId(1)),
        Err(SyncError::AllocationFailure { .. })
    ));
    assert!(!fx.rt.monitors().holds_lock(&t, b.as_ref()));

    fx.rt.exit_recorded(&t, a.as_ref()).expect("exit a");
    fx.rt.coordinator().release_access(&t);
}

/// Releasing orphans on detach lets another thread take the lock.
#[test]
fn test_orphaned_lock_released_on_detach() {
    let fx = SyncFixture::with_defaults();
    let obj: Arc<dyn ObjectHeader> = Arc::new(SyncObject::new());

    fx.spawn("leaker", {
        let obj = obj.clone();
        move |rt, me| {
            rt.enter_recorded(me, obj, FrameId(7)).expect("enter");
            // exits without unlocking; the fixture detaches the thread
        }
    })
    .join()
    .expect("leaker");

    let t = fx.running_thread("main");
    assert_eq!(
        fx.rt.try_enter(&t, obj.as_ref()).expect("try_enter"),
        TryEnter::Acquired
    );
    fx.rt.exit(&t, obj.as_ref()).expect("exit");
    fx.rt.coordinator().release_access(&t);
}

#[test]
fn test_detach_while_owning_monitor_is_fatal() {
    let fx = SyncFixture::with_defaults();
    let obj = Arc::new(SyncObject::new());

    let outcome = fx
        .spawn("dying", {
            let obj = obj.clone();
            move |rt, me| {
                rt.enter(me, obj.as_ref()).expect("enter");
                assert_eq!(me.owned_monitor_count(), 1);
                rt.coordinator().release_access(me);
            }
        })
        .join();
    assert!(outcome.is_err(), "detach accepted a thread that still owns a monitor");
}
