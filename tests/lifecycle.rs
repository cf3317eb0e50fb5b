//! Thread lifecycle: join/detach races, the reaper, cancellation and exit.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stagesched::thread::registry;
use stagesched::{run, sleep, wait_until, Attr, Status, Thread};

#[test]
fn join_detach_race() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        for round in 0..50u32 {
            let t = Thread::make(move || {
                let _ = round.wrapping_mul(3);
            }, Attr::new().name("victim"));
            let id = t.id();
            t.start();

            let t_j = t.clone();
            let joiner = Thread::make(move || t_j.join(), Attr::new().name("joiner"));
            let t_d = t.clone();
            let detacher = Thread::make(move || t_d.detach(), Attr::new().name("detacher"));
            joiner.start();
            detacher.start();
            joiner.join();
            detacher.join();
            drop(t);

            // Whoever won, the thread leaves the registry exactly once.
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while registry::find_by_id(id).is_some() {
                assert!(std::time::Instant::now() < deadline, "thread {} leaked", id);
                sleep(Duration::from_millis(2));
            }
        }
    });
}

#[test]
fn reaper_cleans_up_detached_threads() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned2 = cleaned.clone();
        let t = Thread::make(|| {}, Attr::new().name("ephemeral").detached(true));
        let id = t.id();
        t.set_cleanup(move || cleaned2.store(true, Ordering::SeqCst));
        t.start();
        drop(t);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cleaned.load(Ordering::SeqCst) || registry::find_by_id(id).is_some() {
            assert!(
                std::time::Instant::now() < deadline,
                "detached thread never reaped"
            );
            sleep(Duration::from_millis(2));
        }
    });
}

#[test]
fn unsafe_stop_cancels_a_blocked_thread() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        let t = Thread::make(
            || {
                // Blocks forever; only unsafe_stop can end this.
                wait_until(|| false);
                unreachable!();
            },
            Attr::new().name("stuck"),
        );
        t.start();
        // Let it reach WaitingSto.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while t.get_status() != Status::WaitingSto {
            assert!(std::time::Instant::now() < deadline);
            sleep(Duration::from_millis(2));
        }
        assert!(t.unsafe_stop());
        t.join();
        assert_eq!(t.get_status(), Status::Terminated);
    });
}

#[test]
fn exit_skips_the_rest_of_the_function() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        let after = Arc::new(AtomicBool::new(false));
        let after2 = after.clone();
        let t = Thread::make(
            move || {
                stagesched::exit();
                #[allow(unreachable_code)]
                after2.store(true, Ordering::SeqCst);
            },
            Attr::new().name("quitter"),
        );
        t.start();
        t.join();
        assert!(!after.load(Ordering::SeqCst));
    });
}

#[test]
fn registry_lookups() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        let release = Arc::new(AtomicBool::new(false));
        let release2 = release.clone();
        let t = Thread::make(
            move || wait_until(|| release2.load(Ordering::SeqCst)),
            Attr::new().name("lookme"),
        );
        let id = t.id();
        t.start();

        assert!(registry::numthreads() >= 1);
        assert!(registry::find_by_id(id).is_some());
        registry::with_thread_by_id(id, |th| {
            assert_eq!(th.expect("registered").name(), "lookme");
        });
        let mut seen = false;
        registry::with_all_threads(|th| seen |= th.id() == id);
        assert!(seen);

        release.store(true, Ordering::SeqCst);
        t.wake();
        t.join();
        assert!(registry::find_by_id(id).is_none());
    });
}

#[test]
fn thread_clock_accumulates() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let t = Thread::make(
            move || {
                while !stop2.load(Ordering::SeqCst) {
                    stagesched::yield_now();
                }
            },
            Attr::new().name("worker").pin(1),
        );
        t.start();
        sleep(Duration::from_millis(50));
        // Reader on another CPU, while the worker keeps running.
        let c1 = t.thread_clock();
        sleep(Duration::from_millis(50));
        let c2 = t.thread_clock();
        assert!(c2 >= c1, "thread clock went backwards: {} -> {}", c1, c2);
        assert!(c2 > 0);
        stop.store(true, Ordering::SeqCst);
        t.join();
        // Terminated: the final total is stable and was folded into the
        // process-wide exited-time accumulator.
        let f1 = t.thread_clock();
        let f2 = t.thread_clock();
        assert_eq!(f1, f2);
        assert!(registry::exited_cpu_time() > 0);
    });
}

#[test]
fn lazy_tlb_flush_happens_at_the_next_switch() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        let c = stagesched::current_processor();
        let me = stagesched::current_thread_ref().unwrap();
        assert_eq!(c.current_thread().map(|t| t.id()), Some(me.id()));
        let before = c.stats.tlb_flushes.load(Ordering::SeqCst);
        c.request_lazy_tlb_flush();
        // A real switch is needed; the keep-running fast path skips the
        // flush check.
        sleep(Duration::from_millis(2));
        let c2 = stagesched::current_processor();
        assert!(
            c2.stats.tlb_flushes.load(Ordering::SeqCst) > before || c2.id != c.id,
            "lazy flush never consumed"
        );
    });
}

#[test]
fn exit_notifiers_run_on_completion() {
    let _ = env_logger::builder().is_test(true).try_init();
    run(2, || {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        stagesched::thread::register_exit_notifier(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        let before = FIRED.load(Ordering::SeqCst);
        let t = Thread::make(|| {}, Attr::new().name("notifiee"));
        t.start();
        t.join();
        assert!(FIRED.load(Ordering::SeqCst) > before);
    });
}
