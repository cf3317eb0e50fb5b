//! Monotonic uptime and the per-CPU clock event device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

pub type Nanoseconds = u64;

/// Charged instead of a measured interval when the clock is stuck or jumps
/// backwards, so the scheduler never sees a zero-length run.
pub(crate) const CONTEXT_SWITCH_PENALTY: Nanoseconds = 10_000;

static BOOT_TIME: OnceLock<Instant> = OnceLock::new();

/// Monotonically non-decreasing nanoseconds since first use.
pub fn uptime_now() -> Nanoseconds {
    BOOT_TIME.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

const UNARMED: u64 = u64::MAX;

/// One-shot clock event device. The owner CPU polls for the deadline at its
/// scheduler entry points and in the idle loop; arming an earlier deadline
/// wakes an idling owner so it can re-evaluate its sleep.
pub(crate) struct ClockEvent {
    deadline: AtomicU64,
}

impl ClockEvent {
    pub(crate) const fn new() -> Self {
        Self {
            deadline: AtomicU64::new(UNARMED),
        }
    }

    pub(crate) fn set_at(&self, t: Nanoseconds) {
        self.deadline.store(t, Ordering::SeqCst);
    }

    pub(crate) fn next_deadline(&self) -> Option<Nanoseconds> {
        match self.deadline.load(Ordering::SeqCst) {
            UNARMED => None,
            t => Some(t),
        }
    }

    /// Consume the event if its deadline has passed.
    pub(crate) fn take_pending(&self, now: Nanoseconds) -> bool {
        let dl = self.deadline.load(Ordering::SeqCst);
        dl != UNARMED
            && dl <= now
            && self
                .deadline
                .compare_exchange(dl, UNARMED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}
