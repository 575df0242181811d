//! Lock word encoding
//!
//! ```text
//!  thin:      [ owner token (thread id + 1) | rc:4 | BASE | RES | FLC | 0 ]
//!  inflated:  [ monitor record address                       | 1 ]
//!
//!  bit 0        INFLATED
//!  bit 1        FLC      (flat-lock contention: someone is blocked on it)
//!  bit 2        RESERVED (biased to the owner, may be held with rc == 0)
//!  bit 3        BASE     (plain thin lock taken from the reservable word;
//!                         the final exit puts RESERVABLE back)
//!  bits 4..8    recursion count
//!  bits 8..     owner token
//! ```
//!
//! Recursion counts differ by mode. A plain thin lock counts *extra* entries
//! (rc == 0 means held once). A reserved lock counts *all* entries, so a
//! reserved word with rc == 0 is biased to its owner but not held.

use static_assertions::const_assert;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockWord(usize);

const_assert!(LockWord::INFLATED_BIT & LockWord::FLC_BIT == 0);
const_assert!(LockWord::BASELINE_BIT & (LockWord::RC_MASK | LockWord::RESERVED_BIT) == 0);
const_assert!(LockWord::RC_MASK & LockWord::LOW_BITS_MASK == LockWord::RC_MASK);
const_assert!(LockWord::OWNER_SHIFT == 8);
const_assert!(std::mem::align_of::<u64>() > LockWord::INFLATED_BIT);

impl LockWord {
    pub const INFLATED_BIT: usize = 1 << 0;
    pub const FLC_BIT: usize = 1 << 1;
    pub const RESERVED_BIT: usize = 1 << 2;
    pub const BASELINE_BIT: usize = 1 << 3;
    pub const RC_SHIFT: u32 = 4;
    pub const RC_MASK: usize = 0xF0;
    pub const MAX_RECURSION: usize = Self::RC_MASK >> Self::RC_SHIFT;
    pub const RC_ONE: usize = 1 << Self::RC_SHIFT;
    pub const LOW_BITS_MASK: usize = 0xFF;
    pub const OWNER_SHIFT: u32 = 8;

    pub const UNLOCKED: LockWord = LockWord(0);
    /// Initial word of objects eligible for reservation.
    pub const RESERVABLE: LockWord = LockWord(Self::RESERVED_BIT);

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    /// Thin word owned by `owner` (a [`ThreadId::lock_token`](crate::thread::ThreadId::lock_token)).
    pub const fn thin(owner: usize, rc: usize, reserved: bool) -> Self {
        let mut raw = (owner & !Self::LOW_BITS_MASK) | ((rc << Self::RC_SHIFT) & Self::RC_MASK);
        if reserved {
            raw |= Self::RESERVED_BIT;
        }
        Self(raw)
    }

    /// Inflated word pointing at a monitor record.
    pub fn inflated(record: usize) -> Self {
        debug_assert!(record & Self::INFLATED_BIT == 0, "record address must be aligned");
        Self(record | Self::INFLATED_BIT)
    }

    pub const fn is_inflated(self) -> bool {
        self.0 & Self::INFLATED_BIT != 0
    }

    /// Unowned in either form: 0 or the bare reservable word.
    pub const fn is_free(self) -> bool {
        self.0 == Self::UNLOCKED.0 || self.0 == Self::RESERVABLE.0
    }

    /// Owner token of a thin word; 0 when unowned or inflated.
    pub const fn owner(self) -> usize {
        if self.is_inflated() {
            0
        } else {
            self.0 & !Self::LOW_BITS_MASK
        }
    }

    pub const fn recursion_count(self) -> usize {
        (self.0 & Self::RC_MASK) >> Self::RC_SHIFT
    }

    pub const fn has_flc(self) -> bool {
        !self.is_inflated() && self.0 & Self::FLC_BIT != 0
    }

    pub const fn is_reserved(self) -> bool {
        !self.is_inflated() && self.0 & Self::RESERVED_BIT != 0
    }

    /// Address of the monitor record of an inflated word.
    pub const fn record_address(self) -> Option<usize> {
        if self.is_inflated() {
            Some(self.0 & !Self::INFLATED_BIT)
        } else {
            None
        }
    }

    /// Mark a plain thin word as taken from [`LockWord::RESERVABLE`].
    pub const fn with_baseline(self) -> Self {
        Self(self.0 | Self::BASELINE_BIT)
    }

    /// Free word the final exit of this thin lock stores.
    pub const fn released(self) -> Self {
        if !self.is_inflated() && self.0 & Self::BASELINE_BIT != 0 {
            Self::RESERVABLE
        } else {
            Self::UNLOCKED
        }
    }

    pub const fn with_flc(self) -> Self {
        Self(self.0 | Self::FLC_BIT)
    }

    pub const fn without_flc(self) -> Self {
        Self(self.0 & !Self::FLC_BIT)
    }

    /// Number of times the owner holds a thin lock (0 for a reserved, unheld
    /// word or an unowned one).
    pub const fn entry_count(self) -> usize {
        if self.owner() == 0 {
            0
        } else if self.is_reserved() {
            self.recursion_count()
        } else {
            self.recursion_count() + 1
        }
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record_address() {
            Some(addr) => write!(f, "LockWord(inflated {:#x})", addr),
            None => write!(
                f,
                "LockWord(owner={:#x}, rc={}, flc={}, reserved={})",
                self.owner() >> Self::OWNER_SHIFT,
                self.recursion_count(),
                self.has_flc(),
                self.is_reserved()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_unlocked_and_reservable() {
        assert!(LockWord::UNLOCKED.is_free());
        assert!(LockWord::RESERVABLE.is_free());
        assert!(LockWord::RESERVABLE.is_reserved());
        assert_eq!(LockWord::RESERVABLE.owner(), 0);
        assert_eq!(LockWord::RESERVABLE.entry_count(), 0);
    }

    #[test]
    fn test_thin_entry_counts() {
        let me = ThreadId::from_raw(3).lock_token();
        let plain = LockWord::thin(me, 0, false);
        assert_eq!(plain.owner(), me);
        assert_eq!(plain.entry_count(), 1);

        let reserved_unheld = LockWord::thin(me, 0, true);
        assert_eq!(reserved_unheld.owner(), me);
        assert_eq!(reserved_unheld.entry_count(), 0);
        assert!(!reserved_unheld.is_free());

        let deep = LockWord::thin(me, LockWord::MAX_RECURSION, false);
        assert_eq!(deep.entry_count(), 16);
    }

    #[test]
    fn test_baseline_survives_flc_and_recursion() {
        let me = ThreadId::from_raw(5).lock_token();
        let w = LockWord::thin(me, 0, false).with_baseline();
        assert!(!w.is_reserved());
        assert_eq!(w.owner(), me);
        assert_eq!(w.entry_count(), 1);

        let bumped = LockWord::from_raw(w.raw() + LockWord::RC_ONE).with_flc();
        assert_eq!(bumped.entry_count(), 2);
        assert_eq!(bumped.released(), LockWord::RESERVABLE);
        assert_eq!(LockWord::thin(me, 0, false).released(), LockWord::UNLOCKED);
    }

    #[test]
    fn test_inflated_word_hides_thin_fields() {
        let w = LockWord::inflated(0x1000);
        assert!(w.is_inflated());
        assert_eq!(w.owner(), 0);
        assert!(!w.has_flc());
        assert!(!w.is_reserved());
        assert_eq!(w.record_address(), Some(0x1000));
    }

    #[quickcheck]
    fn prop_thin_fields_round_trip(id: u16, rc: u8, reserved: bool, flc: bool) -> bool {
        let owner = ThreadId::from_raw(id as u32).lock_token();
        let rc = rc as usize % (LockWord::MAX_RECURSION + 1);
        let mut w = LockWord::thin(owner, rc, reserved);
        if flc {
            w = w.with_flc();
        }
        w.owner() == owner
            && w.recursion_count() == rc
            && w.is_reserved() == reserved
            && w.has_flc() == flc
            && !w.is_inflated()
            && !w.without_flc().has_flc()
    }

    #[quickcheck]
    fn prop_recursion_increment_stays_in_field(id: u16, rc: u8) -> bool {
        let owner = ThreadId::from_raw(id as u32).lock_token();
        let rc = rc as usize % LockWord::MAX_RECURSION;
        let w = LockWord::thin(owner, rc, false);
        let bumped = LockWord::from_raw(w.raw() + LockWord::RC_ONE);
        bumped.owner() == owner && bumped.recursion_count() == rc + 1
    }
}
