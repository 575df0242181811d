//! Shared fixtures for the vmsync integration tests
//!
//! Spin counts are kept small so contended paths reach the blocking and
//! inflation code quickly.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vmsync::{SpinCounts, SyncConfig, SyncRuntime, VmThread};

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const SHORT_SPIN: SpinCounts = SpinCounts {
    spin1: 4,
    spin2: 4,
    yields: 2,
};

/// A runtime plus the helpers most tests need.
pub struct SyncFixture {
    pub rt: Arc<SyncRuntime>,
}

impl SyncFixture {
    pub fn with_defaults() -> Self {
        Self::with_config(Self::config())
    }

    /// Default configuration with short spins.
    pub fn config() -> SyncConfig {
        SyncConfig {
            spin: SHORT_SPIN,
            try_enter_spin: SHORT_SPIN,
            ..SyncConfig::default()
        }
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let rt = SyncRuntime::new(config).expect("valid configuration");
        Self { rt: Arc::new(rt) }
    }

    /// Attach a thread and give it its token.
    pub fn running_thread(&self, name: &str) -> Arc<VmThread> {
        let thread = self.rt.attach_thread(name);
        self.rt.coordinator().acquire_access(&thread);
        thread
    }

    /// Spawn an OS thread that attaches, takes its token, runs `f` and
    /// detaches again.
    pub fn spawn<F, T>(&self, name: &str, f: F) -> thread::JoinHandle<T>
    where
        F: FnOnce(&SyncRuntime, &Arc<VmThread>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let rt = self.rt.clone();
        let name = name.to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let me = rt.attach_thread(name);
                rt.coordinator().acquire_access(&me);
                let out = f(&rt, &me);
                rt.detach_thread(&me).expect("detach");
                out
            })
            .expect("spawn test thread")
    }
}

/// Poll `cond` until it holds or [`TEST_TIMEOUT`] expires.
#[track_caller]
pub fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

/// What a managed thread does at a back-edge: give the token up and take it
/// back, honouring any halt posted in the meantime.
pub fn poll(rt: &SyncRuntime, thread: &VmThread) {
    rt.coordinator().release_access(thread);
    rt.coordinator().acquire_access(thread);
}
