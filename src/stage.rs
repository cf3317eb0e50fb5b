//! Stage-based CPU partitioning.
//!
//! A stage is a named phase of a pipeline; threads declare membership by
//! calling `Stage::enqueue`, which places them on a CPU drawn from the
//! current stage-to-CPU assignment. The assignment itself is refreshed
//! periodically by whichever CPU first observes that it is stale, from the
//! observed per-stage load (an exponential moving average of each stage's
//! attributed-thread count).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock;
use crate::interrupt;
use crate::processor::{
    all_processors, current_processor, get_processor, nr_cpus, CpuSet, Processor,
};
use crate::sched;
use crate::spinlock::Spinlock;
use crate::thread::{current_thread_ref, Status};

pub const MAX_STAGES: usize = 8;

const EXPAVG_FACTOR: f32 = 0.1;

pub struct Stage {
    id: usize,
    name: OnceLock<String>,
    /// Approximate count of runnable threads attributed to this stage. May go
    /// transiently negative between a decrement/increment pair; accepted
    /// slack, not an invariant violation.
    c_in: AtomicI64,
}

impl Stage {
    fn new(id: usize) -> Self {
        Self {
            id,
            name: OnceLock::new(),
            c_in: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or("")
    }

    /// Current (unsmoothed) attributed-thread count.
    pub fn load_estimate(&self) -> i64 {
        self.c_in.load(Ordering::SeqCst)
    }

    pub(crate) fn note_entered(&self) {
        self.c_in.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_left(&self) {
        self.c_in.fetch_sub(1, Ordering::SeqCst);
    }

    /// CPUs currently assigned to this stage.
    pub fn cpus(&self) -> CpuSet {
        let a = assignment_snapshot();
        a.stage_cpus(self.id)
    }
}

static STAGES: OnceLock<Box<[Stage]>> = OnceLock::new();
static STAGES_NEXT: AtomicU32 = AtomicU32::new(0);
static STAGES_MTX: Mutex<()> = Mutex::new(());

static ASSIGNMENT: Spinlock<Option<Arc<Assignment>>> = Spinlock::new(None);
static ASSIGNMENT_CREATION: AtomicU64 = AtomicU64::new(0);
static ASSIGNMENT_UPDATING: AtomicBool = AtomicBool::new(false);
static STAGE_LOAD_EXPAVG: Spinlock<[f32; MAX_STAGES]> = Spinlock::new([0.0; MAX_STAGES]);
static UPDATE_COUNT: AtomicU64 = AtomicU64::new(0);

static MAX_ASSIGNMENT_AGE: AtomicU64 = AtomicU64::new(20_000_000);
static FIXED_CPUS_PER_STAGE: AtomicU32 = AtomicU32::new(0);

fn stages() -> &'static [Stage] {
    STAGES.get_or_init(|| (0..MAX_STAGES).map(Stage::new).collect())
}

pub(crate) fn by_id(id: u32) -> &'static Stage {
    &stages()[id as usize]
}

fn stages_defined() -> usize {
    STAGES_NEXT.load(Ordering::SeqCst) as usize
}

/// How long an assignment may be used before a CPU volunteers to recompute it.
pub fn set_max_assignment_age(age: Duration) {
    MAX_ASSIGNMENT_AGE.store(age.as_nanos() as u64, Ordering::SeqCst);
}

pub fn max_assignment_age() -> Duration {
    Duration::from_nanos(MAX_ASSIGNMENT_AGE.load(Ordering::SeqCst))
}

/// Static override: stage `i` uses CPUs `n*i` and `n*i + 1` instead of the
/// adaptive assignment. Zero disables the override.
pub fn set_fixed_cpus_per_stage(n: usize) {
    FIXED_CPUS_PER_STAGE.store(n as u32, Ordering::SeqCst);
}

/// How many times the adaptive assignment has been recomputed.
pub fn assignment_update_count() -> u64 {
    UPDATE_COUNT.load(Ordering::SeqCst)
}

fn assignment_snapshot() -> Arc<Assignment> {
    ASSIGNMENT
        .lock()
        .as_ref()
        .expect("no stages defined")
        .clone()
}

fn publish_assignment(a: Assignment) {
    // Readers hold clones of the old Arc; it is disposed when the last one
    // drops.
    *ASSIGNMENT.lock() = Some(Arc::new(a));
}

/// Allocate the next stage slot. Returns `None` when all slots are taken.
/// Stages must be defined before any enqueue on them; growing the stage count
/// concurrently with an assignment update is not supported.
pub fn define(name: &str) -> Option<&'static Stage> {
    assert!(
        crate::processor::smp_up(),
        "stages require the cpu set to be up"
    );
    let _guard = STAGES_MTX.lock();
    let next = stages_defined();
    if next == MAX_STAGES {
        return None;
    }
    let s = &stages()[next];
    s.name
        .set(name.to_string())
        .unwrap_or_else(|_| panic!("stage slot named twice"));
    STAGES_NEXT.store(next as u32 + 1, Ordering::SeqCst);
    publish_assignment(Assignment::new(nr_cpus(), next + 1));
    ASSIGNMENT_CREATION.store(clock::uptime_now(), Ordering::SeqCst);
    log::trace!("defined stage {} ({})", next, name);
    Some(s)
}

impl Stage {
    /// Declare that the current thread now belongs to this stage and wants to
    /// run on one of its CPUs. Migrates the still-running thread when the
    /// policy picks a remote CPU.
    pub fn enqueue(&'static self) {
        let target = self.enqueue_policy();

        let istate = interrupt::disable();
        let source = current_processor();
        let t = current_thread_ref().expect("stage enqueue outside of a scheduler thread");
        log::trace!(
            "stage {} enqueue: thread {} cpu {} -> {}",
            self.id,
            t.id(),
            source.id,
            target.id
        );
        assert!(t.migratable());

        let st = &t.ds.st;
        st.cas(Status::Running, Status::StagemigRun)
            .expect("stage enqueue from a non-running thread");

        if let Some(old) = t.ds.stage() {
            old.note_left();
        }
        t.ds.set_stage(self);
        // To the scheduler this now looks like scheduling out, and it will
        // decrement the target stage's count rather than the previous one's.
        self.note_entered();

        if target.id == source.id {
            st.store(Status::Running);
            sched::reschedule_from_interrupt(source);
            interrupt::set(istate);
            return;
        }

        // StagemigRun keeps the target CPU from executing the thread while it
        // is still running here.
        t.stat_migrations.fetch_add(1, Ordering::SeqCst);
        t.suspend_timers();
        t.ds.set_cpu(target.id);

        // Enqueue as late as possible to shorten the window the target spins
        // on the migration status.
        target.stagesched_incoming.push(t.clone());
        target
            .incoming_wakeups_mask
            .fetch_or(1u64 << source.id, Ordering::SeqCst);
        target.wakeup();

        // Pick another thread here; the migrating one stops being runnable on
        // this CPU the moment the switch completes.
        sched::reschedule_from_interrupt(source);
        interrupt::set(istate);
    }

    /// Pick the CPU a thread entering this stage should land on.
    pub(crate) fn enqueue_policy(&'static self) -> &'static Processor {
        let fixed = FIXED_CPUS_PER_STAGE.load(Ordering::SeqCst) as usize;
        if fixed != 0 {
            let a = get_processor((fixed * self.id) as u32);
            let b = get_processor((fixed * self.id + 1) as u32);
            return if a.load() <= b.load() { a } else { b };
        }

        // Use the published assignment for roughly max_assignment_age; a
        // single elected updater recomputes it while everyone else keeps
        // reading the old one.
        let age = clock::uptime_now().saturating_sub(ASSIGNMENT_CREATION.load(Ordering::SeqCst));
        let can_update =
            sched::preemptable() && age > MAX_ASSIGNMENT_AGE.load(Ordering::SeqCst);
        if can_update
            && ASSIGNMENT_UPDATING
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            update_assignment();
            // Restart aging only after the statistics were collected.
            ASSIGNMENT_CREATION.store(clock::uptime_now(), Ordering::SeqCst);
            ASSIGNMENT_UPDATING.store(false, Ordering::SeqCst);
        }

        let acpus = assignment_snapshot().stage_cpus(self.id);
        if acpus.is_empty() {
            // Rare: the stage is so irrelevant it got no dedicated CPU.
            return all_processors()[nr_cpus() - 1];
        }
        let least_busy = acpus
            .iter()
            .min_by_key(|&id| get_processor(id).load())
            .unwrap();
        get_processor(least_busy)
    }
}

/// Drain threads migrating into the current CPU and make them runnable.
/// Called early in every scheduler pass and from idle polling. The drain is
/// unbounded by contract.
pub fn dequeue() {
    if let Some(t) = current_thread_ref() {
        // The dequeuing side of a migration runs on the target only; the
        // source's current thread is mid-flight by definition.
        assert_ne!(t.ds.st.load(), Status::StagemigRun);
    }
    interrupt::with_disabled(|| {
        let c = current_processor();
        while let Some(t) = c.stagesched_incoming.pop() {
            // The source CPU may not have completed the context switch yet;
            // wait for StagemigRun to become StagemigSto.
            loop {
                match t.ds.st.cas(Status::StagemigSto, Status::Queued) {
                    Ok(()) => break,
                    Err(s) => {
                        assert_eq!(s, Status::StagemigRun);
                        std::hint::spin_loop();
                    }
                }
            }
            assert_eq!(t.ds.cpu(), c.id);
            log::trace!("stage dequeue: thread {} on cpu {}", t.id(), c.id);
            c.enqueue(t.clone());
            if let Some(s) = t.ds.stage() {
                s.note_entered();
            }
            t.resume_timers(c);
        }
    })
}

/// The assignment of CPUs to stages.
#[derive(Clone)]
pub(crate) struct Assignment {
    reqs: Vec<i32>,
    cpus_per_stage: Vec<CpuSet>,
    cpus: usize,
    stages: usize,
}

impl Assignment {
    /// Initial assignment: CPUs dealt round-robin to the defined stages.
    fn new(cpus: usize, stages: usize) -> Self {
        assert!(stages <= cpus, "more stages than cpus");
        let mut a = Self {
            reqs: vec![0; MAX_STAGES],
            cpus_per_stage: vec![CpuSet::empty(); MAX_STAGES],
            cpus,
            stages,
        };
        for c in 0..cpus {
            a.reqs[c % stages] += 1;
            a.cpus_per_stage[c % stages].insert(c as u32);
        }
        a.validate();
        a
    }

    pub(crate) fn stage_cpus(&self, stage: usize) -> CpuSet {
        self.cpus_per_stage[stage]
    }

    fn validate(&self) {
        let mut core_sum = 0;
        for si in 0..self.stages {
            assert!(self.reqs[si] >= 0);
            core_sum += self.reqs[si];
        }
        assert_eq!(core_sum as usize, self.cpus);
    }

    /// Transition to an assignment fulfilling `new_reqs`, leaving as many
    /// CPUs as possible on their previous stage.
    fn transition_to(&mut self, new_reqs: &[i32]) {
        let stages = self.stages;
        let mut delta = vec![0i32; stages];
        let mut delta_total = 0;
        for si in 0..stages {
            delta[si] = new_reqs[si] - self.reqs[si];
            delta_total += delta[si];
        }
        // Anything else means the distribution handed out a different number
        // of CPUs than exist.
        assert_eq!(delta_total, 0);

        // delta > 0: the stage needs CPUs; delta < 0: it gives them up.
        for si in 0..stages {
            if delta[si] == 0 {
                continue;
            }
            for isi in si..stages {
                let tx = delta[isi].abs().min(delta[si].abs());
                if delta[isi] < 0 && delta[si] > 0 {
                    delta[si] -= tx;
                    delta[isi] += tx;
                    self.transfer_cpus(isi, si, tx);
                } else if delta[isi] > 0 && delta[si] < 0 {
                    delta[si] += tx;
                    delta[isi] -= tx;
                    self.transfer_cpus(si, isi, tx);
                }
            }
            assert_eq!(delta[si], 0);
        }
        self.reqs[..stages].copy_from_slice(&new_reqs[..stages]);
        for si in stages..MAX_STAGES {
            self.reqs[si] = 0;
        }
        self.validate();
    }

    fn transfer_cpus(&mut self, from: usize, to: usize, amount: i32) {
        let mut left = amount;
        let from_set = self.cpus_per_stage[from];
        for f in from_set.iter() {
            if left == 0 {
                break;
            }
            // Stage CPU sets are disjoint by construction.
            debug_assert!(!self.cpus_per_stage[to].contains(f));
            self.cpus_per_stage[to].insert(f);
            self.cpus_per_stage[from].remove(f);
            left -= 1;
        }
        assert_eq!(left, 0);
    }
}

/// Distribute `ncpus` CPUs among stages proportionally to their smoothed
/// loads. CPUs are integral, so after handing out the floor of every share
/// the remainders become the next round's priorities. When no stage wins a
/// whole CPU, priority is transferred from the rightmost non-zero minimum to
/// the leftmost maximum, driving exactly one extra CPU toward the neediest
/// stage per round while resolving ties as fairly as possible.
pub(crate) fn distribute_cpus(loads: &[f32], ncpus: usize) -> Vec<i32> {
    let stages = loads.len();
    let total: f32 = loads.iter().sum();
    debug_assert!(total > 0.0);

    let mut reqs = vec![0i32; stages];
    let mut sp: Vec<f32> = loads.iter().map(|l| l / total).collect();

    let mut cpus_left = ncpus as i32;
    while cpus_left > 0 {
        let mut remainders = vec![0f32; stages];
        let mut cpus_assigned;
        let mut total_remainders;
        loop {
            cpus_assigned = 0;
            total_remainders = 0.0;
            for si in 0..stages {
                let cpus_fp = cpus_left as f32 * sp[si];
                let whole = cpus_fp.floor() as i32;
                assert!(whole >= 0);
                remainders[si] = cpus_fp - whole as f32;
                total_remainders += remainders[si];
                reqs[si] += whole;
                cpus_assigned += whole;
            }
            if cpus_assigned > 0 {
                break;
            }
            // No stage has enough priority to win a whole CPU. Give the
            // lowest non-zero priority to the highest to drive toward a
            // winner.
            let mut max_idx = 0;
            for si in 1..stages {
                if sp[si] > sp[max_idx] {
                    max_idx = si;
                }
            }
            let mut min_idx = stages - 1;
            for si in (0..stages - 1).rev() {
                if sp[min_idx] == 0.0 || (sp[si] != 0.0 && sp[si] < sp[min_idx]) {
                    min_idx = si;
                }
            }
            if min_idx == max_idx {
                // One stage holds essentially all priority and one CPU is
                // left; it gets it.
                assert_eq!(cpus_left, 1);
                reqs[max_idx] += 1;
                cpus_assigned = 1;
                break;
            }
            sp[max_idx] += sp[min_idx];
            sp[min_idx] = 0.0;
        }
        assert!(cpus_assigned > 0 && cpus_assigned <= cpus_left);

        cpus_left -= cpus_assigned;
        if cpus_left > 0 {
            // Whole CPUs cannot be split: the remainders are the priorities
            // for distributing what is left.
            for si in 0..stages {
                sp[si] = remainders[si] / total_remainders;
            }
        }
    }
    debug_assert_eq!(reqs.iter().sum::<i32>(), ncpus as i32);
    reqs
}

/// Recompute the stage-to-CPU assignment from observed load. Must run
/// exclusively (single elected updater) and in a preemptible context.
pub(crate) fn update_assignment() {
    assert!(sched::preemptable());
    let begin = clock::uptime_now();

    let a = assignment_snapshot();
    let nstages = stages_defined();

    // Smooth each stage's attributed count with an exponential moving
    // average so one bursty interval does not thrash the partition.
    let mut sizes = [0f32; MAX_STAGES];
    let mut total = 0f32;
    {
        let mut avg = STAGE_LOAD_EXPAVG.lock();
        for (si, stage) in stages()[..nstages].iter().enumerate() {
            // Clamp away the transient negative slack of the attribution
            // counter.
            let raw = stage.load_estimate().max(0);
            let s = EXPAVG_FACTOR * raw as f32 + (1.0 - EXPAVG_FACTOR) * avg[si];
            avg[si] = s;
            sizes[si] = s;
            total += s;
        }
    }
    if total <= 0.0 {
        return;
    }

    let reqs = distribute_cpus(&sizes[..nstages], nr_cpus());

    // Clone-and-transition keeps the maximum number of CPUs on their
    // previous stage.
    let mut na = (*a).clone();
    na.transition_to(&reqs);

    UPDATE_COUNT.fetch_add(1, Ordering::SeqCst);
    log::trace!(
        "assignment update on cpu {} took {}ns: reqs {:?}",
        current_processor().id,
        clock::uptime_now() - begin,
        &reqs,
    );

    publish_assignment(na);
}
