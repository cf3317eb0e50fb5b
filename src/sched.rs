//! The scheduler loop: selection, bookkeeping, dispatch, idle and the
//! preemption discipline.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::clock;
use crate::interrupt;
use crate::processor::{current_processor, get_processor, Processor};
use crate::stage;
use crate::thread::{current_thread_ref, start_early_threads, Status, ThreadRef, PRIORITY_IDLE};

thread_local! {
    // Both travel with the execution context, like the rest of the per-CPU
    // TLS: preemption state belongs to the thread, the reschedule request to
    // whoever currently holds the CPU.
    static PREEMPT_COUNTER: Cell<u32> = Cell::new(0);
    static NEED_RESCHEDULE: Cell<bool> = Cell::new(false);
}

pub fn preempt_disable() {
    PREEMPT_COUNTER.with(|c| c.set(c.get() + 1));
}

pub fn preempt_enable() {
    let count = PREEMPT_COUNTER.with(|c| {
        let v = c.get();
        assert!(v > 0, "unbalanced preempt_enable");
        c.set(v - 1);
        v - 1
    });
    if count == 0
        && NEED_RESCHEDULE.with(|n| n.get())
        && interrupt::is_enabled()
        && crate::processor::current_cpu_id().is_some()
    {
        schedule();
    }
}

pub fn preemptable() -> bool {
    PREEMPT_COUNTER.with(|c| c.get()) == 0
}

pub fn get_preempt_counter() -> u32 {
    PREEMPT_COUNTER.with(|c| c.get())
}

pub(crate) fn set_need_reschedule() {
    NEED_RESCHEDULE.with(|n| n.set(true));
}

pub fn needs_reschedule() -> bool {
    NEED_RESCHEDULE.with(|n| n.get())
}

/// Reschedule the calling CPU. Never reschedules a different CPU; running one
/// CPU's scheduler elsewhere would be disastrous.
pub fn schedule() {
    let istate = interrupt::disable();
    reschedule_from_interrupt(current_processor());
    interrupt::set(istate);
}

/// Deliver a due clock event on this CPU. The hosted stand-in for the timer
/// interrupt: polled at every scheduler entry point.
pub(crate) fn poll_clock_event(c: &'static Processor) {
    if c.clock_event.take_pending(clock::uptime_now()) {
        c.timers.fired(c);
    }
}

pub(crate) fn reschedule_from_interrupt(c: &'static Processor) {
    debug_assert!(!interrupt::is_enabled());
    NEED_RESCHEDULE.with(|n| n.set(false));
    poll_clock_event(c);
    handle_incoming_wakeups(c);

    let now = clock::uptime_now();
    let prev = c.running_since.swap(now, Ordering::SeqCst);
    let mut interval = now.saturating_sub(prev);
    if interval == 0 {
        // During startup the clock may be stuck; also ignore backward jumps.
        interval = clock::CONTEXT_SWITCH_PENALTY;
    }

    let p = current_thread_ref().expect("reschedule outside of a scheduler thread");
    let p_status = p.ds.st.load();
    assert_ne!(p_status, Status::Queued);

    if p_status != Status::StagemigRun {
        // During stage migration the home CPU has already moved; the drain
        // belongs to the target.
        stage::dequeue();
    }

    p.total_cpu_time.fetch_add(interval, Ordering::SeqCst);

    if p_status == Status::Running {
        let rq_len = c.rq.lock().len();
        if p.is_idle() && rq_len == 0 {
            return;
        }
        if !p.is_idle() && rq_len == 1 {
            // The only queued thread is the idle thread; keep running.
            return;
        }
        p.ds.st.store(Status::Queued);
        p.stat_preemptions.fetch_add(1, Ordering::SeqCst);
        c.stats.preempts.fetch_add(1, Ordering::SeqCst);
        c.enqueue(p.clone());
    } else if let Some(s) = p.ds.stage() {
        // Scheduling out for good (for now): the thread no longer counts
        // toward its stage's load.
        s.note_left();
    }

    let n = c
        .rq
        .lock()
        .pop_runnable()
        .expect("runqueue empty with a thread scheduling out");
    assert_eq!(n.ds.st.load(), Status::Queued);
    n.ds.st.store(Status::Running);
    n.cputime_estimator_set(now, n.total_cpu_time.load(Ordering::SeqCst));
    n.stat_switches.fetch_add(1, Ordering::SeqCst);
    c.stats.switches.fetch_add(1, Ordering::SeqCst);
    log::trace!("cpu {} switch {} -> {}", c.id, p.id(), n.id());

    // Don't write the cache line if it can be avoided.
    if c.app_thread.load(Ordering::Relaxed) != n.app_tag() {
        c.app_thread.store(n.app_tag(), Ordering::Relaxed);
    }
    if c.lazy_flush_tlb.swap(false, Ordering::SeqCst) {
        c.stats.tlb_flushes.fetch_add(1, Ordering::SeqCst);
    }

    switch_to(c, p, n);
}

/// Complete the outgoing thread's scheduled-out transition, hand the CPU to
/// `n`, and park until this context is dispatched again. Returns without
/// parking when the outgoing thread is terminating: its backing thread
/// unwinds and exits.
fn switch_to(c: &'static Processor, p: ThreadRef, n: ThreadRef) {
    debug_assert!(!Arc::ptr_eq(&p, &n));
    let exiting = finish_switch_out(&p);
    *c.current.lock() = Some(n.clone());
    n.context.grant();
    if exiting {
        return;
    }
    p.context.wait_for_cpu();
    // Dispatched again, possibly on a different CPU after pin or stage
    // migration; rebind and take over the deferred-destruction duty.
    let id = p.ds.cpu();
    crate::processor::set_current_cpu(id);
    let c2 = get_processor(id);
    let victim = c2.terminating_thread.lock().take();
    if let Some(t) = victim {
        t.destroy();
    }
}

/// The `*Run -> *Sto` half of the status protocol: once this CPU is done
/// executing the thread, record that it has scheduled out so remote CPUs may
/// take it. A waker can move the status between our load and CAS, so loop.
fn finish_switch_out(p: &ThreadRef) -> bool {
    use Status::*;
    loop {
        let s = p.ds.st.load();
        let target = match s {
            Queued => return false,
            Terminating => return true,
            WaitingRun => WaitingSto,
            SendingLockRun => SendingLockSto,
            WakingRun => WakingSto,
            StagemigRun => StagemigSto,
            other => panic!("impossible status {:?} at context switch", other),
        };
        if p.ds.st.cas(s, target).is_ok() {
            return false;
        }
    }
}

/// Drain the incoming wakeup fabric: snapshot-and-clear the source mask, then
/// empty each flagged source queue.
pub(crate) fn handle_incoming_wakeups(c: &'static Processor) {
    let mask = c.incoming_wakeups_mask.swap(0, Ordering::SeqCst);
    if mask == 0 {
        return;
    }
    let cur = current_thread_ref();
    for src in 0..c.incoming_wakeups.len() {
        if mask & (1u64 << src) == 0 {
            continue;
        }
        loop {
            let t = c.incoming_wakeups[src].lock().pop_front();
            let Some(t) = t else { break };
            if cur.as_ref().map(|cu| Arc::ptr_eq(cu, &t)) == Some(true) {
                // Woken before having a chance to schedule out; the wakeup is
                // consumed right here. No timers to resume: migration only
                // happens to stopped threads.
                t.ds.st
                    .cas(Status::WakingRun, Status::Running)
                    .expect("current thread in wakeup queue not waking");
            } else {
                // The source CPU may still be completing the thread's context
                // switch; wait for the Run -> Sto half.
                loop {
                    match t.ds.st.cas(Status::WakingSto, Status::Queued) {
                        Ok(()) => break,
                        Err(s) => {
                            assert_eq!(s, Status::WakingRun);
                            std::hint::spin_loop();
                        }
                    }
                }
                assert_eq!(t.ds.cpu(), c.id);
                c.enqueue(t.clone());
                if let Some(s) = t.ds.stage() {
                    s.note_entered();
                }
                t.resume_timers(c);
            }
        }
    }
    log::trace!("cpu {} load {}", c.id, c.rq.lock().len());
}

/// Voluntarily give up the CPU. Refuses to switch to idle-priority work.
pub fn yield_now() {
    let t = current_thread_ref().expect("yield outside of a scheduler thread");
    let istate = interrupt::disable();
    let c = current_processor();
    poll_clock_event(c);
    handle_incoming_wakeups(c);
    let next_priority = c.rq.lock().next_priority();
    match next_priority {
        None => {
            interrupt::set(istate);
            return;
        }
        Some(pri) if pri == PRIORITY_IDLE => {
            interrupt::set(istate);
            return;
        }
        Some(_) => {}
    }
    assert_eq!(t.ds.st.load(), Status::Running);
    reschedule_from_interrupt(c);
    interrupt::set(istate);
}

/// The idle loop. Runs with preemption disabled: the whole point of the idle
/// thread is that the scheduler can always find at least one runnable thread.
pub(crate) fn idle_main(c: &'static Processor) -> ! {
    crate::processor::fire_cpu_notifiers(c);
    preempt_disable();
    if c.id == 0 {
        start_early_threads();
    }
    loop {
        do_idle(c);
        // Idle priority: this runs whatever is on the run queue.
        schedule();
    }
}

fn do_idle(c: &'static Processor) {
    loop {
        interrupt::with_disabled(|| {
            handle_incoming_wakeups(c);
            stage::dequeue();
            poll_clock_event(c);
        });
        if !c.rq.lock().is_empty() {
            return;
        }
        // monitor/mwait stand-in: sleep until the wakeup mask, the stage
        // queue or the clock event changes. Writers unpark us; the grant
        // flag loop tolerates the shared token.
        if c.incoming_wakeups_mask.load(Ordering::SeqCst) != 0 || !c.stagesched_incoming.is_empty()
        {
            continue;
        }
        match c.clock_event.next_deadline() {
            Some(dl) => {
                let now = clock::uptime_now();
                if dl > now {
                    std::thread::park_timeout(Duration::from_nanos(dl - now));
                }
            }
            None => std::thread::park(),
        }
    }
}
