//! Stand-in for the OS alarm described in §5 and §9 of the spec. The source this crate is
//! grounded on arms a POSIX `SIGALRM` and polls a flag an async handler clears; this crate
//! takes the substitution the spec explicitly allows and uses a monotonic-clock deadline
//! instead, so the engine never depends on process-wide signal state.

use std::time::{Duration, Instant};

/// A single arm/cancel/expired timer, re-armed once per retransmission attempt.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    armed_until: Option<Instant>,
}

impl Deadline {
    /// A deadline that starts disarmed.
    pub fn new() -> Self {
        Deadline { armed_until: None }
    }

    /// Arms the deadline for `timeout` from now.
    pub fn arm(&mut self, timeout: Duration) {
        self.armed_until = Some(Instant::now() + timeout);
    }

    /// Cancels a pending deadline, mirroring `alarm(0)` in the source.
    pub fn cancel(&mut self) {
        self.armed_until = None;
    }

    /// True once the armed instant has passed. Always false if never armed or already cancelled.
    pub fn expired(&self) -> bool {
        match self.armed_until {
            Some(instant) => Instant::now() >= instant,
            None => false,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}
