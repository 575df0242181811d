//! Spin and back-off helpers for contended monitors

use crate::config::SpinCounts;
use std::time::Duration;

/// Run the three-tier spin ladder around `attempt`.
///
/// `yields` outer rounds; each round makes `spin2` attempts separated by
/// `spin1` busy-wait cycles, then yields the CPU. Returns `true` as soon as
/// an attempt succeeds.
pub fn spin_acquire<F>(counts: SpinCounts, mut attempt: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..counts.yields {
        for _ in 0..counts.spin2 {
            if attempt() {
                return true;
            }
            for _ in 0..counts.spin1 {
                std::hint::spin_loop();
            }
        }
        std::thread::yield_now();
    }
    false
}

/// Bounded waits used while blocked on a flat lock.
///
/// The waiter relies on the exiting owner to wake it, but re-examines the
/// lock word after each timeout anyway. The timeouts grow geometrically and
/// then stay at the last step.
#[derive(Debug, Clone, Default)]
pub struct TimeoutLadder {
    step: usize,
}

impl TimeoutLadder {
    pub const STEPS_MS: [u64; 4] = [1, 4, 16, 64];

    pub fn new() -> Self {
        Self { step: 0 }
    }

    pub fn next_timeout(&mut self) -> Duration {
        let last = Self::STEPS_MS.len() - 1;
        let ms = Self::STEPS_MS[self.step.min(last)];
        if self.step < last {
            self.step += 1;
        }
        Duration::from_millis(ms)
    }
}
