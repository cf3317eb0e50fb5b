//! The per-thread status word.
//!
//! The status is the single authority for where a thread may be touched.
//! Every transition is a compare-and-swap; the `*Run` / `*Sto` suffix pairs
//! record whether the thread has already been switched out, which is what
//! lets a waker on another CPU decide between "the in-flight schedule will
//! consume this wakeup" and "the thread must be enqueued".

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Status {
    /// Created, not yet runnable.
    Unstarted,
    /// Started before the CPU set was brought up.
    Prestarted,
    /// About to sleep, still executing.
    WaitingRun,
    /// Sleeping, switched out.
    WaitingSto,
    /// Lock hand-off in progress, still executing.
    SendingLockRun,
    /// Lock hand-off in progress, switched out.
    SendingLockSto,
    /// Wake requested before the thread switched out.
    WakingRun,
    /// Wake requested; must be enqueued by the home CPU.
    WakingSto,
    /// Migrating to another CPU's stage queue, still executing.
    StagemigRun,
    /// Migrating, switched out; the target CPU may take it.
    StagemigSto,
    /// On exactly one CPU's run queue.
    Queued,
    /// Currently executing.
    Running,
    /// Left the scheduler, awaiting finalization.
    Terminating,
    /// Finalized; join may return.
    Terminated,
    Invalid,
}

impl Status {
    fn from_u32(v: u32) -> Status {
        use Status::*;
        match v {
            0 => Unstarted,
            1 => Prestarted,
            2 => WaitingRun,
            3 => WaitingSto,
            4 => SendingLockRun,
            5 => SendingLockSto,
            6 => WakingRun,
            7 => WakingSto,
            8 => StagemigRun,
            9 => StagemigSto,
            10 => Queued,
            11 => Running,
            12 => Terminating,
            13 => Terminated,
            _ => Invalid,
        }
    }
}

pub(crate) struct StatusWord(AtomicU32);

impl StatusWord {
    pub(crate) fn new(s: Status) -> Self {
        Self(AtomicU32::new(s as u32))
    }

    #[inline]
    pub(crate) fn load(&self) -> Status {
        Status::from_u32(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn store(&self, s: Status) {
        self.0.store(s as u32, Ordering::SeqCst);
    }

    /// CAS `cur -> new`; on failure returns the observed status.
    #[inline]
    pub(crate) fn cas(&self, cur: Status, new: Status) -> Result<(), Status> {
        self.0
            .compare_exchange(cur as u32, new as u32, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(Status::from_u32)
    }
}

bitflags! {
    /// Initial states a waker is allowed to transition from.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct WakeMask: u32 {
        const WAITING_RUN = 1 << (Status::WaitingRun as u32);
        const WAITING_STO = 1 << (Status::WaitingSto as u32);
        const SENDING_LOCK_RUN = 1 << (Status::SendingLockRun as u32);
        const SENDING_LOCK_STO = 1 << (Status::SendingLockSto as u32);
    }
}

impl WakeMask {
    pub(crate) fn waiting() -> Self {
        WakeMask::WAITING_RUN | WakeMask::WAITING_STO
    }

    pub(crate) fn allows(&self, s: Status) -> bool {
        self.bits() & (1u32 << (s as u32)) != 0
    }
}
