//! Error Module - Synchronization Error Types
//!
//! Defines the errors surfaced by the VM access protocol and the object
//! monitor implementation.
//!
//! # Error Categories
//!
//! ## Resource Errors
//! - `AllocationFailure` - monitor table or enter-record pool exhausted
//!
//! ## Ownership Errors
//! - `IllegalMonitorState` - exit/wait/notify by a thread that does not own the monitor
//!
//! ## Protocol Errors
//! - `NotAttached` - thread handle is not registered with the runtime
//! - `WouldBlock` - a non-blocking external exclusive request found the VM busy
//! - `Config` - invalid configuration
//!
//! ## Fatal Errors
//! - `InternalInvariantViolation` - never returned to callers; raised through
//!   [`vm_fatal!`](crate::vm_fatal) which logs and then panics
//!
//! Nothing in this layer has an exception mechanism. Failures are plain
//! return values and become managed-language errors only at the collaborator
//! boundary (an allocation failure becomes an out-of-memory condition, an
//! illegal monitor state becomes the language's illegal-monitor-state error).

use crate::config::ConfigError;
use crate::object::ObjectId;
use crate::thread::ThreadId;
use thiserror::Error;

/// Main error type for all synchronization operations
///
/// # Examples
///
/// ```rust
/// use vmsync::SyncError;
///
/// fn surface(err: SyncError) -> &'static str {
///     match err {
///         SyncError::AllocationFailure { .. } => "OutOfMemoryError",
///         SyncError::IllegalMonitorState { .. } => "IllegalMonitorStateException",
///         _ => "InternalError",
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum SyncError {
    /// A bounded resource needed to make progress is exhausted
    ///
    /// **When returned:** The monitor table is at `max_monitors` and an
    /// object needs a heavyweight record, or the calling thread's
    /// monitor-enter record pool is at `max_enter_records`.
    ///
    /// **Recovery strategy:** Surface a language-level out-of-memory
    /// condition. The lock was not acquired.
    #[error("Allocation failure: {resource} exhausted (limit {limit})")]
    AllocationFailure {
        resource: &'static str,
        limit: usize,
    },

    /// Monitor operation by a thread that does not own the monitor
    ///
    /// **When returned:** `exit`, `wait`, `notify` or `notify_all` called on
    /// an object whose monitor the calling thread does not hold.
    ///
    /// **Recovery strategy:** Surface a language-level illegal monitor state
    /// condition. The lock word is left untouched.
    #[error("Illegal monitor state: thread {thread} does not own monitor of object {object}")]
    IllegalMonitorState { object: ObjectId, thread: ThreadId },

    /// Internal invariant broken
    ///
    /// **When returned:** Never returned through `Result`. Built only to
    /// carry the message of a fatal assertion before the process goes down.
    ///
    /// **Recovery strategy:** None.
    #[error("Internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    /// Thread handle not registered
    ///
    /// **When returned:** A thread handle from another runtime, or one that
    /// was already detached, is passed in.
    ///
    /// **Recovery strategy:** Attach the thread first.
    #[error("Thread {0} is not attached to this runtime")]
    NotAttached(ThreadId),

    /// Non-blocking request could not be satisfied
    ///
    /// **When returned:** `acquire_exclusive_from_external(false)` while
    /// another exclusive or hand-off sequence is in progress.
    ///
    /// **Recovery strategy:** Retry later, or use the blocking form.
    #[error("Exclusive access is held by another requester")]
    WouldBlock,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::AllocationFailure { .. } | SyncError::WouldBlock
        )
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(self, SyncError::InternalInvariantViolation(_))
    }
}

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Report a broken internal invariant and bring the process down.
///
/// Logs through `log::error!` first so the message survives even when the
/// panic is swallowed by an embedder's hook.
#[macro_export]
macro_rules! vm_fatal {
    ($($arg:tt)*) => {{
        let err = $crate::error::SyncError::InternalInvariantViolation(format!($($arg)*));
        log::error!("{}", err);
        panic!("{}", err)
    }};
}

/// Fatal assertion for protocol preconditions (releasing a token that is not
/// held, exiting exclusive access that was never entered, ...).
#[macro_export]
macro_rules! vm_assert {
    ($cond:expr, $context:expr) => {
        if !$cond {
            $crate::vm_fatal!("{} ({})", $context, stringify!($cond));
        }
    };
    ($cond:expr, $context:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::vm_fatal!("{} ({})", format!($context, $($arg)*), stringify!($cond));
        }
    };
}

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
