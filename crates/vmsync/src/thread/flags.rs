//! Per-thread access flags word
//!
//! One atomic word per thread carries every bit the access protocol needs.
//! The owning thread flips `HAS_ACCESS` and `IN_NATIVE` with a single CAS on
//! its fast paths; every other update happens under the thread's flags
//! mutex. Requesters read the word without the mutex only to decide whether
//! taking the mutex is worthwhile.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessFlags(usize);

impl AccessFlags {
    pub const EMPTY: AccessFlags = AccessFlags(0);

    /// Thread holds the execution token.
    pub const HAS_ACCESS: AccessFlags = AccessFlags(1 << 0);
    /// An exclusive requester wants this thread stopped.
    pub const HALT_EXCLUSIVE: AccessFlags = AccessFlags(1 << 1);
    /// A safepoint requester wants this thread to report in.
    pub const REQUEST_SAFE_POINT: AccessFlags = AccessFlags(1 << 2);
    /// Thread has reached the current safepoint and must not resume.
    pub const HALTED_AT_SAFE_POINT: AccessFlags = AccessFlags(1 << 3);
    /// An inspector has suspended this thread.
    pub const HALT_INSPECTION: AccessFlags = AccessFlags(1 << 4);
    /// Thread waits in the exclusive FIFO.
    pub const QUEUED_FOR_EXCLUSIVE: AccessFlags = AccessFlags(1 << 5);
    /// Thread runs native code while keeping its token.
    pub const IN_NATIVE: AccessFlags = AccessFlags(1 << 6);
    /// Thread is inside a critical native region.
    pub const IN_CRITICAL: AccessFlags = AccessFlags(1 << 7);
    /// The current exclusive requester does not expect a response.
    pub const NOT_COUNTED_BY_EXCLUSIVE: AccessFlags = AccessFlags(1 << 8);
    /// The current safepoint requester does not expect a response.
    pub const NOT_COUNTED_BY_SAFE_POINT: AccessFlags = AccessFlags(1 << 9);
    /// Thread holds or is acquiring exclusive access; safepoints must wait for it.
    pub const NOT_AT_SAFE_POINT: AccessFlags = AccessFlags(1 << 10);

    /// Bits that keep a thread from (re)acquiring its token.
    pub const HALT_ANY: AccessFlags = AccessFlags(
        Self::HALT_EXCLUSIVE.0 | Self::HALTED_AT_SAFE_POINT.0 | Self::HALT_INSPECTION.0,
    );

    /// Bits that make a token release report to the coordinator.
    pub const RESPONSE_MASK: AccessFlags =
        AccessFlags(Self::HALT_EXCLUSIVE.0 | Self::REQUEST_SAFE_POINT.0);

    /// Bits that force the native transitions off their single-CAS path.
    pub const RELEASE_REQUIRED: AccessFlags = AccessFlags(
        Self::HALT_ANY.0 | Self::REQUEST_SAFE_POINT.0,
    );

    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> usize {
        self.0
    }

    pub const fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: AccessFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: AccessFlags) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: AccessFlags) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn has_access(self) -> bool {
        self.contains(Self::HAS_ACCESS)
    }

    pub fn in_native(self) -> bool {
        self.contains(Self::IN_NATIVE)
    }

    pub fn is_halted(self) -> bool {
        self.intersects(Self::HALT_ANY)
    }

    /// Holding the token and not parked in native code.
    pub fn running_managed_code(self) -> bool {
        self.has_access() && !self.in_native()
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        self.union(rhs)
    }
}

impl BitAnd for AccessFlags {
    type Output = AccessFlags;

    fn bitand(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 & rhs.0)
    }
}

impl Not for AccessFlags {
    type Output = AccessFlags;

    fn not(self) -> AccessFlags {
        AccessFlags(!self.0)
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(AccessFlags, &str); 11] = [
            (AccessFlags::HAS_ACCESS, "HAS_ACCESS"),
            (AccessFlags::HALT_EXCLUSIVE, "HALT_EXCLUSIVE"),
            (AccessFlags::REQUEST_SAFE_POINT, "REQUEST_SAFE_POINT"),
            (AccessFlags::HALTED_AT_SAFE_POINT, "HALTED_AT_SAFE_POINT"),
            (AccessFlags::HALT_INSPECTION, "HALT_INSPECTION"),
            (AccessFlags::QUEUED_FOR_EXCLUSIVE, "QUEUED_FOR_EXCLUSIVE"),
            (AccessFlags::IN_NATIVE, "IN_NATIVE"),
            (AccessFlags::IN_CRITICAL, "IN_CRITICAL"),
            (AccessFlags::NOT_COUNTED_BY_EXCLUSIVE, "NOT_COUNTED_BY_EXCLUSIVE"),
            (AccessFlags::NOT_COUNTED_BY_SAFE_POINT, "NOT_COUNTED_BY_SAFE_POINT"),
            (AccessFlags::NOT_AT_SAFE_POINT, "NOT_AT_SAFE_POINT"),
        ];

        if self.is_empty() {
            return f.write_str("AccessFlags(EMPTY)");
        }
        let mut first = true;
        f.write_str("AccessFlags(")?;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str(")")
    }
}
