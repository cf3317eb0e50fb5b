//! A per-CPU, preemptive thread scheduler with a cross-CPU stage dispatcher.
//!
//! Threads run on a fixed set of CPUs, each with its own run queue, timer
//! set and scheduler loop. Wakeups travel between CPUs over a lock-free
//! per-source fabric. Threads may declare membership in a named pipeline
//! stage; an adaptive controller periodically re-partitions the CPU set among
//! stages according to observed load and migrates threads so that distinct
//! stages run on disjoint CPU subsets.
//!
//! The hardware collaborators (context switch, clock event, per-CPU storage)
//! are realized by a hosted substrate: every scheduler thread is backed by a
//! parked OS thread, and a CPU is granted by unparking. See `context` and
//! `clock`.
//!
//! ```no_run
//! let total = stagesched::run(2, || {
//!     let t = stagesched::Thread::make(
//!         || println!("hello from a scheduler thread"),
//!         stagesched::Attr::new(),
//!     );
//!     t.start();
//!     t.join();
//!     42
//! });
//! assert_eq!(total, 42);
//! ```

pub mod clock;
pub(crate) mod context;
pub mod interrupt;
pub mod mutex;
pub mod processor;
pub mod sched;
pub mod spinlock;
pub mod stage;
pub mod thread;
pub mod timer;

pub use mutex::Mutex;
pub use processor::{
    all_processors, bring_up, current_processor, get_processor, nr_cpus, register_cpu_notifier,
    CpuSet, Processor, MAX_CPUS,
};
pub use sched::{preempt_disable, preempt_enable, preemptable, schedule, yield_now};
pub use stage::Stage;
pub use thread::{
    current_thread_ref, exit, pin, sleep, sleep_until, wait_until, wait_until_timeout, Attr,
    Status, Thread, ThreadHandle, ThreadRef, PRIORITY_DEFAULT, PRIORITY_IDLE,
};
pub use timer::Timer;

/// Bring up `ncpus` CPUs (first caller fixes the count) and run `f` as a
/// scheduler thread, returning its value.
pub fn run<T, F>(ncpus: usize, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    bring_up(ncpus);
    let (tx, rx) = std::sync::mpsc::channel();
    let t = Thread::make(
        move || {
            let _ = tx.send(f());
        },
        Attr::new().name("main").detached(true),
    );
    t.start();
    match rx.recv() {
        Ok(v) => v,
        Err(_) => panic!("main scheduler thread died: {}", thread::take_panic_note()),
    }
}
