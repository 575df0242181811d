//! # vmsync - Thread Synchronization for a Managed Runtime
//!
//! vmsync is the layer a managed-language runtime uses to coordinate its
//! threads: a cooperative execution-token protocol that lets one thread bring
//! every other thread to a halt, and the per-object monitors built on top of
//! it.
//!
//! ## Overview
//!
//! - **Execution token ("VM access")**: a thread must hold its token to run
//!   managed code. Acquiring and releasing it uncontended is a single CAS on
//!   the thread's flags word.
//! - **Exclusive access**: one requester halts every other thread and waits
//!   for each token holder to report in. Concurrent requesters queue in FIFO
//!   order and receive exclusivity by direct hand-off.
//! - **Safepoints**: a lighter rendezvous where threads only have to reach a
//!   consistent point.
//! - **Object monitors**: thin locks in the object's lock word, optional lock
//!   reservation, spin-then-block escalation and inflation to heavyweight
//!   records.
//!
//! ## Quick Start
//!
//! ```rust
//! use vmsync::{SyncConfig, SyncObject, SyncRuntime};
//!
//! fn main() -> Result<(), vmsync::SyncError> {
//!     let runtime = SyncRuntime::new(SyncConfig::default())?;
//!     let thread = runtime.attach_thread("main");
//!     runtime.coordinator().acquire_access(&thread);
//!
//!     let object = SyncObject::new();
//!     runtime.enter(&thread, &object)?;
//!     runtime.enter(&thread, &object)?; // reentrant
//!     runtime.exit(&thread, &object)?;
//!     runtime.exit(&thread, &object)?;
//!
//!     {
//!         // Stop the world
//!         let _pause = runtime.exclusive(&thread);
//!     }
//!
//!     runtime.detach_thread(&thread)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        SyncRuntime                        │
//! │                                                           │
//! │   ┌───────────────┐      cancel reservation   ┌─────────┐ │
//! │   │ ObjectMonitor │ ─────────────────────────>│ VmAccess│ │
//! │   │  thin / spin  │   release/acquire token   │ Coord-  │ │
//! │   │  block / wait │ ─────────────────────────>│ inator  │ │
//! │   └───────┬───────┘                           └────┬────┘ │
//! │           │ records                                │      │
//! │   ┌───────▼───────┐                        ┌───────▼────┐ │
//! │   │ MonitorTable  │                        │ VmThread × │ │
//! │   │  (DashMap)    │                        │ flags word │ │
//! │   └───────────────┘                        └────────────┘ │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lock Order
//!
//! thread list → per-thread flags mutex → global exclusive-access mutex.
//! Never inverted.
//!
//! ## Errors
//!
//! Recoverable conditions ([`SyncError::AllocationFailure`],
//! [`SyncError::IllegalMonitorState`], [`SyncError::WouldBlock`]) are
//! returned. Broken invariants (releasing a token that is not held, counter
//! underflow) are fatal: they are logged and panic.
//!
//! ## Logging
//!
//! The crate logs through the `log` facade and installs no logger.
//!
//! ## Model Checking
//!
//! The owner/requester race on the flags word has loom models. Build with
//! `--cfg loom` and run the `loom_` tests (see the `sync` module source).
//!
//! ## Modules
//!
//! - [`access`]: execution token, exclusive access, safepoints, native and
//!   critical-region transitions, inspection
//! - [`config`]: tuning parameters and validation
//! - [`error`]: error type and fatal assertion macros
//! - [`monitor`]: lock words, monitor records and table, object monitor
//! - [`object`]: object-header collaborator trait
//! - [`runtime`]: runtime context
//! - [`stats`]: counters, histograms and metric export
//! - [`thread`]: thread handles, flags words and the thread list

pub mod config;
pub mod error;

pub mod access;
pub mod monitor;
pub mod object;
pub mod thread;

pub mod runtime;
pub mod stats;

mod sync;

pub use access::{
    ExclusiveAccessStats, ExclusiveGuard, ExclusiveState, ExternalRequest, Rendezvous, VmAccessCoordinator,
};
pub use config::{ConfigError, SpinCounts, SyncConfig};
pub use error::{Result, SyncError};
pub use monitor::{LockWord, MonitorRecord, MonitorTable, ObjectMonitor, TryEnter};
pub use object::{ObjectHeader, ObjectId, SyncObject};
pub use runtime::SyncRuntime;
pub use stats::{SyncStats, SyncSummary};
pub use thread::{AccessFlags, FrameId, ThreadId, ThreadStatus, VmThread};

/// vmsync version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a runtime from `VMSYNC_*` environment variables (defaults for
/// anything unset).
///
/// # Examples
///
/// ```rust
/// let runtime = vmsync::init()?;
/// assert!(runtime.coordinator().threads().is_empty());
/// # Ok::<(), vmsync::SyncError>(())
/// ```
pub fn init() -> Result<SyncRuntime> {
    SyncRuntime::new(SyncConfig::from_env())
}
