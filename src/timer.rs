//! Timers.
//!
//! Each CPU owns an ordered set of armed timers keyed by `(fire_time,
//! identity)` with a cached next expiry. Each client (usually a thread) owns
//! the list of its active timers, guarded by a recursive lock so a timer
//! callback may re-arm its own timer. Lock order is always client then CPU
//! tree: the dispatch pops due entries under the tree lock and expires them
//! under the client lock, re-checking the armed state to arbitrate against a
//! concurrent cancel.
//!
//! `suspend`/`resume` move a client's active timers between CPU trees during
//! cross-CPU migration; the `need_reload` flag makes the pair idempotent.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use intrusive_collections::{
    intrusive_adapter, KeyAdapter, LinkedList, LinkedListAtomicLink, RBTree, RBTreeAtomicLink,
};

use crate::clock::{self, Nanoseconds};
use crate::interrupt;
use crate::processor::{current_processor, get_processor, Processor};
use crate::spinlock::RecursiveSpinlock;

const TIMER_FREE: u8 = 0;
const TIMER_ARMED: u8 = 1;
const TIMER_EXPIRED: u8 = 2;

pub trait TimerClient: Send + Sync {
    fn timer_client_state(&self) -> &TimerClientState;
    fn timer_fired(&self);
}

pub(crate) struct ClientInner {
    pub(crate) active: LinkedList<ActiveTimerAdapter>,
    pub(crate) need_reload: bool,
}

pub struct TimerClientState {
    pub(crate) lock: RecursiveSpinlock<ClientInner>,
}

impl TimerClientState {
    pub fn new() -> Self {
        Self {
            lock: RecursiveSpinlock::new(ClientInner {
                active: LinkedList::new(ActiveTimerAdapter::new()),
                need_reload: false,
            }),
        }
    }
}

impl Default for TimerClientState {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct TimerEntry {
    time: AtomicU64,
    state: AtomicU8,
    cpu: AtomicU32,
    client: Arc<dyn TimerClient>,
    tree_link: RBTreeAtomicLink,
    active_link: LinkedListAtomicLink,
}

intrusive_adapter!(pub(crate) TimerTreeAdapter = Arc<TimerEntry>: TimerEntry { tree_link: RBTreeAtomicLink });
intrusive_adapter!(pub(crate) ActiveTimerAdapter = Arc<TimerEntry>: TimerEntry { active_link: LinkedListAtomicLink });

impl<'a> KeyAdapter<'a> for TimerTreeAdapter {
    type Key = (Nanoseconds, usize);
    fn get_key(&self, e: &'a TimerEntry) -> Self::Key {
        (e.time.load(Ordering::Relaxed), e as *const _ as usize)
    }
}

impl TimerEntry {
    /// Fire this timer. Runs on the owning CPU with the entry already popped
    /// from the CPU tree.
    fn expire(self: &Arc<Self>) {
        let mut g = self.client.timer_client_state().lock.lock();
        if self.state.load(Ordering::SeqCst) != TIMER_ARMED {
            // Lost a race with cancel while being dispatched.
            return;
        }
        self.state.store(TIMER_EXPIRED, Ordering::SeqCst);
        if self.active_link.is_linked() {
            unsafe { g.active.cursor_mut_from_ptr(&**self).remove() };
        }
        log::trace!("timer fired at {}", self.time.load(Ordering::Relaxed));
        // The client lock is recursive, so the callback may re-arm.
        self.client.timer_fired();
    }
}

struct TimerListInner {
    tree: RBTree<TimerTreeAdapter>,
    /// Cached earliest deadline the clock event was programmed for.
    last: Nanoseconds,
}

/// The per-CPU ordered timer set.
pub(crate) struct TimerList {
    inner: RecursiveSpinlock<TimerListInner>,
}

impl TimerList {
    pub(crate) fn new() -> Self {
        Self {
            inner: RecursiveSpinlock::new(TimerListInner {
                tree: RBTree::new(TimerTreeAdapter::new()),
                last: Nanoseconds::MAX,
            }),
        }
    }

    fn insert_and_rearm(&self, c: &'static Processor, e: Arc<TimerEntry>) {
        let mut inner = self.inner.lock();
        e.cpu.store(c.id, Ordering::SeqCst);
        inner.tree.insert(e);
        let front = inner
            .tree
            .front()
            .get()
            .map(|t| t.time.load(Ordering::Relaxed))
            .unwrap();
        if front < inner.last {
            inner.last = front;
            c.clock_event.set_at(front);
            c.wakeup();
        }
    }

    fn remove_entry(&self, e: &TimerEntry) {
        let mut inner = self.inner.lock();
        if e.tree_link.is_linked() {
            unsafe { inner.tree.cursor_mut_from_ptr(e).remove() };
        }
    }

    /// Clock event dispatch: expire everything due, then reprogram.
    pub(crate) fn fired(&self, c: &'static Processor) {
        loop {
            let mut due: Vec<Arc<TimerEntry>> = Vec::new();
            {
                let mut inner = self.inner.lock();
                let now = clock::uptime_now();
                inner.last = Nanoseconds::MAX;
                loop {
                    let front_due = inner
                        .tree
                        .front()
                        .get()
                        .map(|e| e.time.load(Ordering::Relaxed) <= now)
                        .unwrap_or(false);
                    if !front_due {
                        break;
                    }
                    due.push(inner.tree.front_mut().remove().unwrap());
                }
                if due.is_empty() {
                    if let Some(front) = inner.tree.front().get() {
                        let t = front.time.load(Ordering::Relaxed);
                        inner.last = t;
                        c.clock_event.set_at(t);
                    }
                    return;
                }
            }
            for e in due {
                assert_eq!(e.cpu.load(Ordering::SeqCst), c.id);
                e.expire();
            }
            // A callback may have taken long enough that the next timer is
            // already due; iterate instead of recursing through the event.
        }
    }

    /// Unhook a client's armed timers from this CPU's tree. Called with the
    /// client lock held.
    pub(crate) fn suspend(&self, active: &LinkedList<ActiveTimerAdapter>) {
        let mut inner = self.inner.lock();
        for e in active.iter() {
            if e.tree_link.is_linked() {
                unsafe { inner.tree.cursor_mut_from_ptr(e).remove() };
            }
        }
    }

    /// Re-insert a client's armed timers into this CPU's tree. Called with the
    /// client lock held.
    pub(crate) fn resume(&self, c: &'static Processor, active: &LinkedList<ActiveTimerAdapter>) {
        let mut inner = self.inner.lock();
        let mut cur = active.front();
        while let Some(e) = cur.get() {
            if e.state.load(Ordering::SeqCst) == TIMER_ARMED && !e.tree_link.is_linked() {
                e.cpu.store(c.id, Ordering::SeqCst);
                inner.tree.insert(cur.clone_pointer().unwrap());
            }
            cur.move_next();
        }
        if let Some(front) = inner.tree.front().get() {
            let t = front.time.load(Ordering::Relaxed);
            if t < inner.last {
                inner.last = t;
                c.clock_event.set_at(t);
                c.wakeup();
            }
        }
    }
}

/// A one-shot timer owned by its creator. Dropping cancels.
pub struct Timer {
    entry: Arc<TimerEntry>,
}

impl Timer {
    pub fn new(client: Arc<dyn TimerClient>) -> Self {
        Self {
            entry: Arc::new(TimerEntry {
                time: AtomicU64::new(0),
                state: AtomicU8::new(TIMER_FREE),
                cpu: AtomicU32::new(u32::MAX),
                client,
                tree_link: RBTreeAtomicLink::new(),
                active_link: LinkedListAtomicLink::new(),
            }),
        }
    }

    /// A timer that wakes the current thread when it fires.
    pub fn for_current_thread() -> Self {
        let t = crate::thread::current_thread_ref().expect("no current thread");
        Self::new(t)
    }

    /// Arm the timer for an absolute uptime instant.
    pub fn set(&self, at: Nanoseconds) {
        interrupt::with_disabled(|| {
            let e = &self.entry;
            let mut g = e.client.timer_client_state().lock.lock();
            assert_ne!(
                e.state.load(Ordering::SeqCst),
                TIMER_ARMED,
                "timer armed twice"
            );
            // An expired entry may still sit in a CPU tree if it was canceled
            // between dispatch and expiry; unhook it before rebinding.
            if e.tree_link.is_linked() {
                get_processor(e.cpu.load(Ordering::SeqCst))
                    .timers
                    .remove_entry(e);
            }
            e.state.store(TIMER_ARMED, Ordering::SeqCst);
            e.time.store(at, Ordering::SeqCst);
            g.active.push_back(e.clone());
            let c = current_processor();
            log::trace!("timer set for {} on cpu {}", at, c.id);
            c.timers.insert_and_rearm(c, e.clone());
        })
    }

    /// Re-arm for a new instant, preserving active-list membership if armed.
    pub fn reset(&self, at: Nanoseconds) {
        interrupt::with_disabled(|| {
            let e = &self.entry;
            let mut g = e.client.timer_client_state().lock.lock();
            if e.state.load(Ordering::SeqCst) == TIMER_ARMED {
                get_processor(e.cpu.load(Ordering::SeqCst))
                    .timers
                    .remove_entry(e);
            } else {
                if e.tree_link.is_linked() {
                    get_processor(e.cpu.load(Ordering::SeqCst))
                        .timers
                        .remove_entry(e);
                }
                e.state.store(TIMER_ARMED, Ordering::SeqCst);
                g.active.push_back(e.clone());
            }
            e.time.store(at, Ordering::SeqCst);
            let c = current_processor();
            log::trace!("timer reset for {} on cpu {}", at, c.id);
            c.timers.insert_and_rearm(c, e.clone());
        })
    }

    /// Disarm. The clock event is left programmed; a spurious dispatch finds
    /// nothing due.
    pub fn cancel(&self) {
        interrupt::with_disabled(|| {
            let e = &self.entry;
            let mut g = e.client.timer_client_state().lock.lock();
            match e.state.load(Ordering::SeqCst) {
                TIMER_FREE => {}
                TIMER_EXPIRED => e.state.store(TIMER_FREE, Ordering::SeqCst),
                TIMER_ARMED => {
                    if e.active_link.is_linked() {
                        unsafe { g.active.cursor_mut_from_ptr(&**e).remove() };
                    }
                    get_processor(e.cpu.load(Ordering::SeqCst))
                        .timers
                        .remove_entry(e);
                    e.state.store(TIMER_FREE, Ordering::SeqCst);
                }
                s => panic!("timer in impossible state {}", s),
            }
        })
    }

    pub fn expired(&self) -> bool {
        self.entry.state.load(Ordering::SeqCst) == TIMER_EXPIRED
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
