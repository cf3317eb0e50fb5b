//! CPU records and bring-up.
//!
//! Processors are process-wide, created at `bring_up` and never destroyed.
//! Per-CPU data is touched only by the owning CPU, except for the incoming
//! wakeup fabric, the stage migration queue (MPSC) and a few atomics.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Once, OnceLock};

use bitset_core::BitSet;
use crossbeam_queue::SegQueue;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use parking_lot::Mutex;

use crate::clock::{self, ClockEvent};
use crate::spinlock::Spinlock;
use crate::thread::{Thread, ThreadRef};
use crate::timer::TimerList;

pub(crate) mod rq;

use rq::RunQueue;

pub const MAX_CPUS: usize = 64;

/// Initial value of the reserved fair-runtime normalization constant.
const C_INITIAL: f32 = f32::MIN_POSITIVE;

intrusive_adapter!(pub WakeupQueueAdapter = ThreadRef: Thread { wakeup_link: LinkedListAtomicLink });

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub switches: AtomicU64,
    pub preempts: AtomicU64,
    pub wakeups: AtomicU64,
    pub tlb_flushes: AtomicU64,
}

pub struct Processor {
    pub id: u32,
    pub(crate) rq: Spinlock<RunQueue>,
    pub(crate) idle_thread: OnceLock<ThreadRef>,
    pub(crate) current: Spinlock<Option<ThreadRef>>,
    pub(crate) running_since: AtomicU64,
    pub(crate) incoming_wakeups_mask: AtomicU64,
    pub(crate) incoming_wakeups: Box<[Spinlock<LinkedList<WakeupQueueAdapter>>]>,
    pub(crate) stagesched_incoming: SegQueue<ThreadRef>,
    pub(crate) timers: TimerList,
    pub(crate) clock_event: ClockEvent,
    pub(crate) terminating_thread: Spinlock<Option<ThreadRef>>,
    pub(crate) app_thread: AtomicU64,
    pub(crate) lazy_flush_tlb: AtomicBool,
    pub stats: ProcessorStats,
    // Reserved for fair-runtime accounting.
    #[allow(dead_code)]
    pub(crate) c: AtomicU32,
    #[allow(dead_code)]
    pub(crate) renormalize_count: AtomicU64,
}

impl Processor {
    fn new(id: u32, ncpus: usize) -> Self {
        let incoming = (0..ncpus)
            .map(|_| Spinlock::new(LinkedList::new(WakeupQueueAdapter::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            id,
            rq: Spinlock::new(RunQueue::new()),
            idle_thread: OnceLock::new(),
            current: Spinlock::new(None),
            running_since: AtomicU64::new(0),
            incoming_wakeups_mask: AtomicU64::new(0),
            incoming_wakeups: incoming,
            stagesched_incoming: SegQueue::new(),
            timers: TimerList::new(),
            clock_event: ClockEvent::new(),
            terminating_thread: Spinlock::new(None),
            app_thread: AtomicU64::new(0),
            lazy_flush_tlb: AtomicBool::new(false),
            stats: ProcessorStats::default(),
            c: AtomicU32::new(C_INITIAL.to_bits()),
            renormalize_count: AtomicU64::new(0),
        }
    }

    /// Run queue length.
    pub fn load(&self) -> usize {
        self.rq.lock().len()
    }

    pub fn current_thread(&self) -> Option<ThreadRef> {
        self.current.lock().clone()
    }

    /// Pending source bits of the incoming wakeup fabric.
    pub fn incoming_wakeups_pending(&self) -> u64 {
        self.incoming_wakeups_mask.load(Ordering::SeqCst)
    }

    /// Request a TLB flush on the next pass through the scheduler.
    pub fn request_lazy_tlb_flush(&self) {
        self.lazy_flush_tlb.store(true, Ordering::SeqCst);
    }

    pub(crate) fn enqueue(&self, t: ThreadRef) {
        log::trace!("queue thread {} on cpu {}", t.id(), self.id);
        self.rq.lock().push_back(t);
    }

    /// Kick the CPU out of its idle wait (the mwait stand-in).
    pub(crate) fn wakeup(&self) {
        if let Some(idle) = self.idle_thread.get() {
            idle.context.unpark_host();
        }
    }
}

/// A set of CPU ids.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CpuSet {
    set: [u64; MAX_CPUS / 64],
}

impl CpuSet {
    pub fn empty() -> Self {
        let mut set = [0u64; MAX_CPUS / 64];
        set.bit_init(false);
        Self { set }
    }

    pub fn insert(&mut self, id: u32) {
        self.set.bit_set(id as usize);
    }

    pub fn remove(&mut self, id: u32) {
        self.set.bit_reset(id as usize);
    }

    pub fn contains(&self, id: u32) -> bool {
        self.set.bit_test(id as usize)
    }

    pub fn is_empty(&self) -> bool {
        !self.set.bit_any()
    }

    pub fn count(&self) -> usize {
        self.set.bit_count()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        let words = self.set;
        (0..MAX_CPUS as u32).filter(move |&i| words.bit_test(i as usize))
    }
}

impl std::fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CpuSet[")?;
        for (i, w) in self.set.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:#x}", w)?;
        }
        write!(f, "]")
    }
}

static ALL_PROCESSORS: OnceLock<Vec<&'static Processor>> = OnceLock::new();
static SMP_UP: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CPU_ID: Cell<u32> = Cell::new(u32::MAX);
}

pub(crate) fn set_current_cpu(id: u32) {
    CPU_ID.with(|c| c.set(id));
}

pub(crate) fn current_cpu_id() -> Option<u32> {
    CPU_ID.with(|c| match c.get() {
        u32::MAX => None,
        id => Some(id),
    })
}

pub fn current_processor() -> &'static Processor {
    get_processor(current_cpu_id().expect("not running on a scheduler cpu"))
}

pub fn get_processor(id: u32) -> &'static Processor {
    all_processors()[id as usize]
}

pub fn all_processors() -> &'static [&'static Processor] {
    ALL_PROCESSORS.get().expect("cpus not brought up")
}

pub fn nr_cpus() -> usize {
    all_processors().len()
}

pub(crate) fn smp_up() -> bool {
    SMP_UP.load(Ordering::SeqCst)
}

type CpuNotifier = Box<dyn Fn(&'static Processor) + Send + Sync>;
static CPU_NOTIFIERS: Mutex<Vec<CpuNotifier>> = Mutex::new(Vec::new());

/// Subscribe a callback fired on each CPU as it comes up, pinned to that CPU.
/// Register before `bring_up`; callbacks do not fire retroactively.
pub fn register_cpu_notifier(f: impl Fn(&'static Processor) + Send + Sync + 'static) {
    CPU_NOTIFIERS.lock().push(Box::new(f));
}

pub(crate) fn fire_cpu_notifiers(c: &'static Processor) {
    for n in CPU_NOTIFIERS.lock().iter() {
        n(c);
    }
}

static BRING_UP: Once = Once::new();

/// Bring up the CPU set. The first caller fixes the CPU count for the rest of
/// the process; later calls are no-ops.
pub fn bring_up(ncpus: usize) {
    assert!(ncpus >= 1 && ncpus <= MAX_CPUS);
    BRING_UP.call_once(|| {
        let v: Vec<&'static Processor> = (0..ncpus as u32)
            .map(|i| &*Box::leak(Box::new(Processor::new(i, ncpus))))
            .collect();
        ALL_PROCESSORS
            .set(v)
            .unwrap_or_else(|_| panic!("cpu set initialized twice"));
        SMP_UP.store(true, Ordering::SeqCst);
        let now = clock::uptime_now();
        for &c in all_processors() {
            let idle = Thread::make_idle(c.id);
            c.running_since.store(now, Ordering::SeqCst);
            *c.current.lock() = Some(idle.clone());
            c.idle_thread
                .set(idle.clone())
                .unwrap_or_else(|_| panic!("idle thread set twice"));
            idle.context.grant();
        }
        crate::thread::reaper::init();
    });
}
