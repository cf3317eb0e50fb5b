//! Lock-free estimation of a running thread's total CPU time.
//!
//! `thread_clock()` on a running thread needs the pair
//! `(running_since, total_cpu_time_at_running_since)`, but a reader on another
//! CPU cannot load two words atomically and the context-switch path must not
//! pay for extra fences. Instead the scheduler publishes a single 64-bit word
//! packing 32 bits of each value: the low 10 bits are shifted off (micro-
//! second resolution) and the high 22 bits dropped. Readers recover the high
//! bits from the current clock and the current total, decrementing the
//! recovered part by one step when the saved low bits exceed the reference
//! (the save happened just before a carry). That is valid as long as less
//! than 2^(32+10-1) ns (~2200 s) passed since the save, which is far beyond
//! any context-switch interval.

use std::sync::atomic::Ordering;

use crate::clock::{self, Nanoseconds};
use crate::processor;
use crate::thread::{current_thread_ref, Status, Thread};

pub(crate) const CPUTIME_SHIFT: u32 = 10;

pub(crate) fn estimator_pack(running_since: Nanoseconds, total_cpu_time: Nanoseconds) -> u64 {
    let rs = (running_since >> CPUTIME_SHIFT) as u32;
    let tc = (total_cpu_time >> CPUTIME_SHIFT) as u32;
    rs as u64 | ((tc as u64) << 32)
}

pub(crate) fn estimator_unpack(
    e: u64,
    rs_ref: Nanoseconds,
    tc_ref: Nanoseconds,
) -> (Nanoseconds, Nanoseconds) {
    let rs = (e & 0xffff_ffff) << CPUTIME_SHIFT;
    let tc = (e >> 32) << CPUTIME_SHIFT;
    const HO: u64 = !(u64::MAX >> (64 - 32 - CPUTIME_SHIFT as u64));
    let mut rs_ho = rs_ref & HO;
    let mut tc_ho = tc_ref & HO;
    if (rs_ref & !HO) < rs {
        rs_ho = rs_ho.wrapping_sub(1 << (32 + CPUTIME_SHIFT));
    }
    if (tc_ref & !HO) < tc {
        tc_ho = tc_ho.wrapping_sub(1 << (32 + CPUTIME_SHIFT));
    }
    (rs_ho | rs, tc_ho | tc)
}

impl Thread {
    pub(crate) fn cputime_estimator_set(
        &self,
        running_since: Nanoseconds,
        total_cpu_time: Nanoseconds,
    ) {
        self.cputime_estimator
            .store(estimator_pack(running_since, total_cpu_time), Ordering::Relaxed);
    }

    pub(crate) fn cputime_estimator_get(&self) -> (Nanoseconds, Nanoseconds) {
        let e = self.cputime_estimator.load(Ordering::Relaxed);
        estimator_unpack(
            e,
            clock::uptime_now(),
            self.total_cpu_time.load(Ordering::SeqCst),
        )
    }

    /// Total CPU time consumed by this thread, including the current slice if
    /// it is running.
    pub fn thread_clock(&self) -> Nanoseconds {
        let cur = current_thread_ref();
        if cur.as_deref().map(|c| std::ptr::eq(c, self)) == Some(true) {
            // While preemption is off the scheduler cannot touch
            // total_cpu_time or running_since under us.
            crate::sched::preempt_disable();
            let c = processor::current_processor();
            let t = self.total_cpu_time.load(Ordering::SeqCst)
                + clock::uptime_now().saturating_sub(c.running_since.load(Ordering::SeqCst));
            crate::sched::preempt_enable();
            t
        } else if self.ds.st.load() == Status::Running {
            // The estimator published before the status became visible stays
            // valid even if the thread stops right now; the overshoot is
            // bounded by the duration of this read.
            let (running_since, total) = self.cputime_estimator_get();
            total + clock::uptime_now().saturating_sub(running_since)
        } else {
            // total_cpu_time is written before the status leaves Running, so
            // it is already visible here.
            self.total_cpu_time.load(Ordering::SeqCst)
        }
    }
}
