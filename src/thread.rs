//! Threads: creation, the wake/wait protocol, lifecycle and migration.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use intrusive_collections::LinkedListAtomicLink;
use parking_lot::RwLock;

use crate::clock::{self, Nanoseconds};
use crate::context::ThreadContext;
use crate::interrupt;
use crate::processor::{self, current_processor, get_processor, Processor};
use crate::sched;
use crate::spinlock::Spinlock;
use crate::timer::{Timer, TimerClient, TimerClientState};

pub mod registry;
pub(crate) mod reaper;
pub mod state;
mod time;

pub use state::Status;
pub(crate) use state::{StatusWord, WakeMask};

pub type ThreadRef = Arc<Thread>;

pub const PRIORITY_DEFAULT: f32 = 1.0;
pub const PRIORITY_IDLE: f32 = f32::INFINITY;

pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

const DETACH_ATTACHED: u32 = 0;
const DETACH_DETACHED: u32 = 1;
const DETACH_ATTACHED_COMPLETE: u32 = 2;

/// Creation-time attributes.
#[derive(Clone, Default)]
pub struct Attr {
    name: Option<String>,
    stack_size: Option<usize>,
    pinned_cpu: Option<u32>,
    detached: bool,
    app_tag: u64,
}

impl Attr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn pin(mut self, cpu: u32) -> Self {
        self.pinned_cpu = Some(cpu);
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn app_tag(mut self, tag: u64) -> Self {
        self.app_tag = tag;
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StackInfo {
    pub size: usize,
}

/// Scheduler state that outlives the thread object: a waker holding only a
/// handle can observe status transitions while the thread is being destroyed
/// concurrently. The thread owns the strong reference; wakers borrow
/// temporarily through their own clone.
pub(crate) struct DetachedState {
    pub(crate) st: StatusWord,
    cpu: AtomicU32,
    stage: AtomicU32,
    thread: OnceLock<Weak<Thread>>,
}

impl DetachedState {
    fn new() -> Self {
        Self {
            st: StatusWord::new(Status::Unstarted),
            cpu: AtomicU32::new(u32::MAX),
            stage: AtomicU32::new(0),
            thread: OnceLock::new(),
        }
    }

    pub(crate) fn cpu(&self) -> u32 {
        let id = self.cpu.load(Ordering::SeqCst);
        assert_ne!(id, u32::MAX, "thread has no home cpu");
        id
    }

    pub(crate) fn set_cpu(&self, id: u32) {
        self.cpu.store(id, Ordering::SeqCst);
    }

    pub(crate) fn stage(&self) -> Option<&'static crate::stage::Stage> {
        match self.stage.load(Ordering::SeqCst) {
            0 => None,
            id => Some(crate::stage::by_id(id - 1)),
        }
    }

    pub(crate) fn set_stage(&self, s: &'static crate::stage::Stage) {
        self.stage.store(s.id() as u32 + 1, Ordering::SeqCst);
    }

    fn thread(&self) -> Option<ThreadRef> {
        self.thread.get().and_then(Weak::upgrade)
    }
}

/// A wake-capable reference to a thread's scheduler state, safe to hold past
/// the thread's destruction.
pub struct ThreadHandle {
    ds: Arc<DetachedState>,
}

impl ThreadHandle {
    pub fn wake(&self) {
        wake_impl(&self.ds, WakeMask::waiting());
    }
}

type ThreadFn = Box<dyn FnOnce() + Send + 'static>;

pub struct Thread {
    id: u32,
    name: String,
    attr: Attr,
    is_idle: bool,
    func: Spinlock<Option<ThreadFn>>,
    pub(crate) ds: Arc<DetachedState>,
    pub(crate) context: ThreadContext,
    tls: Spinlock<Vec<Option<Box<[u8]>>>>,
    migration_lock_counter: AtomicU32,
    pinned: AtomicBool,
    detach_state: AtomicU32,
    joiner: AtomicPtr<Thread>,
    cleanup: Spinlock<Option<ThreadFn>>,
    finalized: AtomicBool,
    pub(crate) total_cpu_time: AtomicU64,
    pub(crate) cputime_estimator: AtomicU64,
    pub(crate) timer_client: TimerClientState,
    pub stat_preemptions: AtomicU64,
    pub stat_migrations: AtomicU64,
    pub stat_switches: AtomicU64,
    pub(crate) runqueue_link: LinkedListAtomicLink,
    pub(crate) wakeup_link: LinkedListAtomicLink,
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<ThreadRef>> = RefCell::new(None);
}

pub fn current_thread_ref() -> Option<ThreadRef> {
    CURRENT_THREAD.with(|c| c.borrow().clone())
}

pub(crate) fn set_current_thread(t: &ThreadRef) {
    CURRENT_THREAD.with(|c| c.replace(Some(t.clone())));
}

pub(crate) fn current_thread_id() -> Option<u32> {
    CURRENT_THREAD.with(|c| c.borrow().as_ref().map(|t| t.id))
}

/// Marker payload used to unwind a thread out of `exit()`.
struct ThreadExit;

static PANIC_NOTE: parking_lot::Mutex<Option<String>> = parking_lot::Mutex::new(None);

pub(crate) fn take_panic_note() -> String {
    PANIC_NOTE
        .lock()
        .take()
        .unwrap_or_else(|| "no panic note".to_string())
}

fn thread_entry(t: ThreadRef) {
    t.context.wait_for_cpu();
    processor::set_current_cpu(t.ds.cpu());
    set_current_thread(&t);
    let c = get_processor(t.ds.cpu());
    let victim = c.terminating_thread.lock().take();
    if let Some(v) = victim {
        v.destroy();
    }
    if t.is_idle {
        sched::idle_main(c);
    }
    let f = t.func.lock().take();
    if let Some(f) = f {
        if let Err(p) = catch_unwind(AssertUnwindSafe(f)) {
            if !p.is::<ThreadExit>() {
                let msg = if let Some(s) = p.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = p.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "opaque panic payload".to_string()
                };
                log::error!("thread {} panicked: {}", t.id, msg);
                PANIC_NOTE
                    .lock()
                    .get_or_insert_with(|| format!("thread {} panicked: {}", t.id, msg));
            }
        }
    }
    t.complete();
    // complete() switched away for the last time; the backing thread exits.
}

impl Thread {
    pub fn make(f: impl FnOnce() + Send + 'static, attr: Attr) -> ThreadRef {
        Self::make_inner(Some(Box::new(f)), attr, false)
    }

    pub(crate) fn make_idle(cpu: u32) -> ThreadRef {
        let attr = Attr::new().name(format!("idle{}", cpu)).pin(cpu);
        let t = Self::make_inner(None, attr, true);
        t.ds.set_cpu(cpu);
        t.ds.st.store(Status::Running);
        t
    }

    fn make_inner(func: Option<ThreadFn>, attr: Attr, is_idle: bool) -> ThreadRef {
        let parent = current_thread_ref();
        let name = match (&attr.name, &parent) {
            (Some(n), _) => n.clone(),
            (None, Some(p)) => format!(">{}", p.name),
            (None, None) => ">".to_string(),
        };
        let ds = Arc::new(DetachedState::new());
        let pinned = attr.pinned_cpu.is_some();
        let detached = attr.detached;
        let stack_size = attr.stack_size.unwrap_or(DEFAULT_STACK_SIZE);
        let t = registry::register(|id| {
            Arc::new(Thread {
                id,
                name: name.clone(),
                attr: attr.clone(),
                is_idle,
                func: Spinlock::new(func),
                ds: ds.clone(),
                context: ThreadContext::new(),
                // Module 0 is always the core slot.
                tls: Spinlock::new(vec![None]),
                migration_lock_counter: AtomicU32::new(if pinned { 1 } else { 0 }),
                pinned: AtomicBool::new(pinned),
                detach_state: AtomicU32::new(if detached {
                    DETACH_DETACHED
                } else {
                    DETACH_ATTACHED
                }),
                joiner: AtomicPtr::new(ptr::null_mut()),
                cleanup: Spinlock::new(None),
                finalized: AtomicBool::new(false),
                total_cpu_time: AtomicU64::new(0),
                cputime_estimator: AtomicU64::new(0),
                timer_client: TimerClientState::new(),
                stat_preemptions: AtomicU64::new(0),
                stat_migrations: AtomicU64::new(0),
                stat_switches: AtomicU64::new(0),
                runqueue_link: LinkedListAtomicLink::new(),
                wakeup_link: LinkedListAtomicLink::new(),
            })
        });
        t.ds.thread
            .set(Arc::downgrade(&t))
            .unwrap_or_else(|_| panic!("detached state bound twice"));
        log::trace!("created thread {} ({})", t.id, t.name);
        let t2 = t.clone();
        let handle = std::thread::Builder::new()
            .name(t.name.clone())
            .stack_size(stack_size)
            .spawn(move || thread_entry(t2))
            .expect("failed to spawn backing thread");
        t.context.set_host(handle.thread().clone());
        t
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            ds: self.ds.clone(),
        }
    }

    pub fn get_status(&self) -> Status {
        self.ds.st.load()
    }

    pub fn get_stack_info(&self) -> StackInfo {
        StackInfo {
            size: self.attr.stack_size.unwrap_or(DEFAULT_STACK_SIZE),
        }
    }

    /// Kept for ABI; priorities collapsed to a default plus the idle sentinel.
    pub fn set_priority(&self, _priority: f32) {}

    pub fn priority(&self) -> f32 {
        if self.is_idle {
            PRIORITY_IDLE
        } else {
            PRIORITY_DEFAULT
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub(crate) fn app_tag(&self) -> u64 {
        self.attr.app_tag
    }

    pub fn migratable(&self) -> bool {
        self.migration_lock_counter.load(Ordering::SeqCst) == 0
    }

    pub fn migrate_disable(&self) {
        self.migration_lock_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn migrate_enable(&self) {
        let prev = self.migration_lock_counter.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0);
    }

    /// Install per-module TLS storage; module 0 is the core slot.
    pub fn setup_tls(&self, module: usize, template: &[u8], uninit: usize) {
        let mut tls = self.tls.lock();
        if tls.len() <= module {
            tls.resize_with(module + 1, || None);
        }
        let mut buf = vec![0u8; template.len() + uninit];
        buf[..template.len()].copy_from_slice(template);
        tls[module] = Some(buf.into_boxed_slice());
    }

    pub fn with_tls<R>(&self, module: usize, f: impl FnOnce(Option<&mut [u8]>) -> R) -> R {
        let mut tls = self.tls.lock();
        f(tls.get_mut(module).and_then(|s| s.as_deref_mut()))
    }

    pub fn set_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        assert_eq!(self.ds.st.load(), Status::Unstarted);
        *self.cleanup.lock() = Some(Box::new(f));
    }

    pub(crate) fn run_cleanup(&self) {
        let f = self.cleanup.lock().take();
        if let Some(f) = f {
            f();
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detach_state.load(Ordering::SeqCst) == DETACH_DETACHED
    }

    /// Make the thread runnable. Threads started before the CPU set is up are
    /// parked as prestarted and released by CPU 0 once it is.
    pub fn start(&self) {
        assert_eq!(self.ds.st.load(), Status::Unstarted);
        if !processor::smp_up() {
            self.ds.st.store(Status::Prestarted);
            return;
        }
        let cpu = self
            .attr
            .pinned_cpu
            .or_else(processor::current_cpu_id)
            .unwrap_or(0);
        self.ds.set_cpu(cpu);
        self.ds.st.store(Status::WaitingSto);
        self.wake();
    }

    pub fn wake(&self) {
        wake_impl(&self.ds, WakeMask::waiting());
    }

    /// Publish data for the wakee, then wake it: the action is ordered before
    /// the status transition the wakee resumes through.
    pub fn wake_with(&self, action: impl FnOnce()) {
        // The wakee may observe the action's effect and run to completion
        // before wake_impl returns; only the detached state stays valid that
        // long.
        let ds = self.ds.clone();
        sched::preempt_disable();
        action();
        wake_impl(&ds, WakeMask::waiting());
        sched::preempt_enable();
    }

    /// Hand a lock directly to this (waiting) thread, so it wakes already
    /// owning it. Returns after the hand-off is published.
    pub(crate) fn wake_lock(&self, wr: &crate::mutex::WaitRecord) {
        let ds = &self.ds;
        for (from, to) in [
            (Status::WaitingRun, Status::SendingLockRun),
            (Status::WaitingSto, Status::SendingLockSto),
        ] {
            if ds.st.cas(from, to).is_ok() {
                if wr.try_deliver() {
                    wake_impl(ds, WakeMask::all());
                } else {
                    // The record was satisfied some other way; put the
                    // thread back the way we found it.
                    let reverted = ds.st.cas(to, from).is_ok();
                    assert!(reverted, "lock hand-off state changed under us");
                }
                return;
            }
        }
        // Not asleep (running between wait iterations, or already being
        // woken): the ownership record is enough, the waiter will observe it
        // on its next predicate check.
        wr.try_deliver();
        self.wake();
    }

    /// Cancel a blocked thread that is not cooperating. Only legal when the
    /// thread is parked in `WaitingSto`.
    pub fn unsafe_stop(&self) -> bool {
        match self.ds.st.cas(Status::WaitingSto, Status::Terminated) {
            Ok(()) => true,
            Err(s) => s == Status::Terminated,
        }
    }

    /// Going to sleep: from here until `stop_wait` the thread must not be
    /// preempted, it would never be scheduled in again.
    pub(crate) fn prepare_wait(&self) {
        sched::preempt_disable();
        assert_eq!(self.ds.st.load(), Status::Running);
        self.ds.st.store(Status::WaitingRun);
    }

    pub(crate) fn wait(&self) {
        sched::schedule();
    }

    /// Leave the wait protocol; post-condition is `Running`.
    pub(crate) fn stop_wait(&self) {
        let st = &self.ds.st;
        // The predicate came true before we scheduled out.
        if st.cas(Status::WaitingRun, Status::Running).is_ok() {
            sched::preempt_enable();
            return;
        }
        // An asynchronous event moved our status; wait for it to finish.
        sched::preempt_enable();
        if st.load() == Status::Terminated {
            // Lost a race with unsafe_stop; never returns.
            sched::schedule();
            unreachable!("terminated thread rescheduled");
        }
        loop {
            match st.load() {
                // The peer still owes us a transition; let the scheduler and
                // the wakeup fabric complete it.
                Status::SendingLockRun | Status::StagemigRun | Status::WakingRun => {
                    sched::schedule()
                }
                Status::Running => break,
                s => panic!("impossible status {:?} in stop_wait", s),
            }
        }
        assert_eq!(st.load(), Status::Running);
    }

    fn complete(&self) {
        let me = self.ds.thread().expect("completing thread vanished");
        run_exit_notifiers();
        if self
            .detach_state
            .compare_exchange(
                DETACH_ATTACHED,
                DETACH_ATTACHED_COMPLETE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // Detached before completion; nobody will join us.
            reaper::add_zombie(me.clone());
        }
        // Once the status changes we would never be scheduled in again to
        // finish up, so preemption must already be off.
        sched::preempt_disable();
        self.ds.st.store(Status::Terminating);
        let c = current_processor();
        let prev = c.terminating_thread.lock().replace(me.clone());
        if let Some(prev) = prev {
            assert!(!Arc::ptr_eq(&prev, &me));
            prev.destroy();
        }
        // The scheduler never picks a terminating thread again; this switches
        // away for good and the backing thread unwinds.
        sched::schedule();
    }

    /// Move the thread from `Terminating` to `Terminated`, waking a joiner if
    /// one raced in. Runs on the next thread occupying the CPU, never on the
    /// dying thread itself.
    pub(crate) fn destroy(&self) {
        assert_eq!(self.ds.st.load(), Status::Terminating);
        let ds = self.ds.clone();
        let sentinel = self as *const Thread as *mut Thread;
        match self.joiner.compare_exchange(
            ptr::null_mut(),
            sentinel,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                // A late join() will lose the CAS and observe the status.
                ds.st.store(Status::Terminated);
            }
            Err(j) => {
                // The joiner won the race and is waiting; it stays alive
                // inside join() until we publish the terminated state.
                let joiner = unsafe { &*j };
                joiner.wake_with(move || ds.st.store(Status::Terminated));
            }
        }
    }

    /// Wait for the thread to terminate and finalize it. Exactly one of the
    /// joiner and the completion path owns the terminated-state publication.
    pub fn join(&self) {
        if self.ds.st.load() == Status::Unstarted {
            // Allow destruction of a thread object before start().
            return;
        }
        let cur = current_thread_ref().expect("join requires a scheduler thread");
        assert!(!ptr::eq(&*cur, self));
        let cur_ptr = Arc::as_ptr(&cur) as *mut Thread;
        if self
            .joiner
            .compare_exchange(ptr::null_mut(), cur_ptr, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // destroy() got there first; it no longer touches the thread.
            self.finalize();
            return;
        }
        wait_until(|| self.ds.st.load() == Status::Terminated);
        self.finalize();
    }

    fn finalize(&self) {
        if !self.finalized.swap(true, Ordering::SeqCst) {
            registry::unregister(self.id, self.total_cpu_time.load(Ordering::SeqCst));
        }
    }

    pub fn detach(&self) {
        if self
            .detach_state
            .compare_exchange(
                DETACH_ATTACHED,
                DETACH_DETACHED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
            && self.detach_state.load(Ordering::SeqCst) == DETACH_ATTACHED_COMPLETE
        {
            // Completion beat us; if we don't enlist the reaper, nobody will.
            self.detach_state.store(DETACH_DETACHED, Ordering::SeqCst);
            reaper::add_zombie(self.ds.thread().expect("detached thread vanished"));
        }
    }

    pub fn unpin(&self) {
        if let Some(cur) = current_thread_ref() {
            if std::ptr::eq(&*cur, self) {
                sched::preempt_disable();
                if self.pinned.swap(false, Ordering::SeqCst) {
                    self.migrate_enable();
                }
                sched::preempt_enable();
                return;
            }
        }
        // Unpinning another thread must run on its CPU to avoid racing with
        // concurrent pin or migration; a helper chases it if it moves.
        let target = self.ds.thread().expect("unpinned thread vanished");
        let helper = Thread::make(
            move || {
                sched::preempt_disable();
                while processor::current_cpu_id() != Some(target.ds.cpu()) {
                    sched::preempt_enable();
                    pin(get_processor(target.ds.cpu()));
                    sched::preempt_disable();
                }
                if target.pinned.swap(false, Ordering::SeqCst) {
                    target.migrate_enable();
                }
                sched::preempt_enable();
            },
            Attr::new().name("unpin").pin(self.ds.cpu()),
        );
        helper.start();
        helper.join();
    }

    pub(crate) fn suspend_timers(&self) {
        let mut g = self.timer_client.lock.lock();
        if g.need_reload {
            return;
        }
        g.need_reload = true;
        let c = get_processor(self.ds.cpu());
        c.timers.suspend(&g.active);
    }

    pub(crate) fn resume_timers(&self, c: &'static Processor) {
        let mut g = self.timer_client.lock.lock();
        if !g.need_reload {
            return;
        }
        g.need_reload = false;
        c.timers.resume(c, &g.active);
    }
}

impl TimerClient for Thread {
    fn timer_client_state(&self) -> &TimerClientState {
        &self.timer_client
    }

    fn timer_fired(&self) {
        self.wake();
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Thread {}

/// Terminate the current thread without returning to its function.
pub fn exit() -> ! {
    assert!(
        current_thread_ref().is_some(),
        "exit outside of a scheduler thread"
    );
    std::panic::panic_any(ThreadExit);
}

/// Deliver a wakeup to the thread behind `ds`.
///
/// The CAS ladder is ordered by the temporal order of the states: a thread
/// first becomes `WaitingRun`, then `WaitingSto`, and the lock-sending pair
/// mirrors that. The first successful CAS tells us whether the thread already
/// scheduled out (`stopped`), which decides between consuming the wakeup in
/// the in-flight schedule and enqueuing on the home CPU.
pub(crate) fn wake_impl(ds: &Arc<DetachedState>, allowed: WakeMask) {
    debug_assert!(allowed.contains(WakeMask::waiting()));
    let ladder = [
        (Status::WaitingRun, Status::WakingRun, false),
        (Status::WaitingSto, Status::WakingSto, true),
        (Status::SendingLockRun, Status::WakingRun, false),
        (Status::SendingLockSto, Status::WakingSto, true),
    ];
    let mut stopped = None;
    for (from, to, stop) in ladder {
        if allowed.allows(from) && ds.st.cas(from, to).is_ok() {
            stopped = Some(stop);
            break;
        }
    }
    // Already waking, running, or woken by someone else.
    let Some(stopped) = stopped else { return };

    let t = ds.thread().expect("woken thread vanished");
    log::trace!("wake thread {}", t.id());

    sched::preempt_disable();
    let mut tcpu = get_processor(ds.cpu());
    if stopped && t.migratable() {
        if let Some(stage) = ds.stage() {
            let target = stage.enqueue_policy();
            if target.id != tcpu.id {
                // Remote migration: move the thread's home before delivering
                // the wakeup, so the enqueue lands on the stage's CPU.
                interrupt::with_disabled(|| {
                    log::trace!("migrate thread {} to cpu {}", t.id(), target.id);
                    t.stat_migrations.fetch_add(1, Ordering::SeqCst);
                    t.suspend_timers();
                    ds.set_cpu(target.id);
                });
                tcpu = target;
            }
        }
    }

    let src = processor::current_cpu_id().unwrap_or(0) as usize;
    interrupt::with_disabled(|| {
        tcpu.incoming_wakeups[src].lock().push_back(t.clone());
    });
    let bit = 1u64 << src;
    let prev = tcpu.incoming_wakeups_mask.fetch_or(bit, Ordering::SeqCst);
    if prev & bit == 0 {
        if processor::current_cpu_id() == Some(tcpu.id) {
            sched::set_need_reschedule();
        } else {
            tcpu.stats.wakeups.fetch_add(1, Ordering::SeqCst);
            tcpu.wakeup();
        }
    }
    sched::preempt_enable();
}

/// Block the current thread until the predicate holds. The predicate is
/// re-evaluated after every wakeup.
pub fn wait_until(mut pred: impl FnMut() -> bool) {
    let me = current_thread_ref().expect("wait_until requires a scheduler thread");
    loop {
        me.prepare_wait();
        if pred() {
            me.stop_wait();
            return;
        }
        me.wait();
        me.stop_wait();
    }
}

/// Like `wait_until`, bounded by a timeout. Returns whether the predicate
/// held (as opposed to the timer expiring first).
pub fn wait_until_timeout(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let tmr = Timer::for_current_thread();
    tmr.set(clock::uptime_now() + timeout.as_nanos() as Nanoseconds);
    let mut satisfied = false;
    wait_until(|| {
        satisfied = pred();
        satisfied || tmr.expired()
    });
    tmr.cancel();
    satisfied
}

pub fn sleep(d: Duration) {
    sleep_until(clock::uptime_now() + d.as_nanos() as Nanoseconds);
}

pub fn sleep_until(at: Nanoseconds) {
    let tmr = Timer::for_current_thread();
    tmr.set(at);
    wait_until(|| tmr.expired());
}

/// Pin the current thread to `target`, migrating it there if necessary.
pub fn pin(target: &'static Processor) {
    let t = current_thread_ref().expect("pin requires a scheduler thread");
    if !t.pinned.swap(true, Ordering::SeqCst) {
        // Pinning carries one migrate-disable count.
        t.migrate_disable();
    }
    let source = current_processor();
    if source.id == target.id {
        return;
    }
    // The wakeup must come from the source CPU after we have switched out, so
    // a one-shot helper thread pinned there completes it.
    let flag = Arc::new(AtomicBool::new(false));
    let woken = t.clone();
    let flag2 = flag.clone();
    let wakeme = Thread::make(
        move || {
            wait_until(|| flag2.load(Ordering::SeqCst));
            woken.wake();
        },
        Attr::new().name("wakeme").pin(source.id),
    );
    wakeme.start();
    {
        let istate = interrupt::disable();
        log::trace!("pin thread {} to cpu {}", t.id(), target.id);
        t.stat_migrations.fetch_add(1, Ordering::SeqCst);
        t.suspend_timers();
        t.ds.set_cpu(target.id);
        t.ds.st.store(Status::WaitingRun);
        // wakeme shares our CPU and IRQs are off: it cannot run until we
        // stop running.
        wakeme.wake_with(|| flag.store(true, Ordering::SeqCst));
        sched::reschedule_from_interrupt(source);
        interrupt::set(istate);
    }
    wakeme.join();
}

type ExitNotifier = Box<dyn Fn() + Send + Sync>;
static EXIT_NOTIFIERS: RwLock<Vec<ExitNotifier>> = RwLock::new(Vec::new());

/// Register a callback run by every thread as it completes.
pub fn register_exit_notifier(f: impl Fn() + Send + Sync + 'static) {
    EXIT_NOTIFIERS.write().insert(0, Box::new(f));
}

fn run_exit_notifiers() {
    for n in EXIT_NOTIFIERS.read().iter() {
        n();
    }
}

/// Release threads started before the CPU set came up. Runs on CPU 0's idle
/// thread.
pub(crate) fn start_early_threads() {
    for t in registry::snapshot() {
        if t.ds.st.cas(Status::Prestarted, Status::Unstarted).is_ok() {
            t.start();
        }
    }
}
