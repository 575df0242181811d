//! Timing of the current (or most recent) exclusive-access request.

use crate::thread::ThreadId;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct ExclusiveAccessStats {
    /// `None` for external requesters
    pub requester: Option<ThreadId>,
    pub last_responder: Option<ThreadId>,
    /// Threads that reported in
    pub halted_threads: usize,
    pub start: Option<Instant>,
    pub end: Option<Instant>,
    /// Sum over responders of (response time - start)
    pub total_response_time: Duration,
}

impl ExclusiveAccessStats {
    pub(crate) fn begin(&mut self, requester: Option<ThreadId>) {
        *self = Self {
            requester,
            last_responder: requester,
            start: Some(Instant::now()),
            ..Self::default()
        };
    }

    /// Account one response. Returns the time since the request started.
    pub(crate) fn respond(&mut self, responder: ThreadId) -> Duration {
        let elapsed = self.elapsed();
        self.last_responder = Some(responder);
        self.halted_threads += 1;
        self.total_response_time += elapsed;
        elapsed
    }

    pub(crate) fn finish(&mut self) -> Duration {
        let now = Instant::now();
        self.end = Some(now);
        self.start.map(|s| now - s).unwrap_or_default()
    }

    pub(crate) fn clear_requester(&mut self) {
        self.requester = None;
        self.last_responder = None;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Request-to-grant time, once granted.
    pub fn time_to_grant(&self) -> Option<Duration> {
        Some(self.end? - self.start?)
    }
}
