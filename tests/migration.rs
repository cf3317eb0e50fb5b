//! Pinning, unpinning and cross-CPU migration, including timers that follow
//! their thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagesched::clock::uptime_now;
use stagesched::{
    current_processor, current_thread_ref, get_processor, pin, run, sleep, stage, wait_until,
    wait_until_timeout, yield_now, Attr, Thread,
};

const MS: u64 = 1_000_000;

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn pin_migrates_and_sticks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _g = serial();
    let seen = run(3, || {
        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let seen2 = seen.clone();
        let t = Thread::make(
            move || {
                pin(get_processor(1));
                // Still on CPU 1 across yields and sleeps.
                for _ in 0..50 {
                    yield_now();
                    assert_eq!(current_processor().id, 1);
                }
                sleep(Duration::from_millis(5));
                assert_eq!(current_processor().id, 1);
                pin(get_processor(2));
                assert_eq!(current_processor().id, 2);
                seen2.store(current_processor().id, Ordering::SeqCst);
            },
            Attr::new().name("pinner"),
        );
        t.start();
        t.join();
        seen.load(Ordering::SeqCst)
    });
    assert_eq!(seen, 2);
}

#[test]
fn unpin_from_another_thread() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _g = serial();
    let migratable = run(3, || {
        let me = current_thread_ref().unwrap();
        let parked = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let parked2 = parked.clone();
        let release2 = release.clone();
        let main = me.handle();
        let t = Thread::make(
            move || {
                pin(get_processor(1));
                parked2.store(true, Ordering::SeqCst);
                main.wake();
                wait_until(|| release2.load(Ordering::SeqCst));
            },
            Attr::new().name("pinned"),
        );
        t.start();
        wait_until(|| parked.load(Ordering::SeqCst));
        assert!(!t.migratable());
        t.unpin();
        let migratable = t.migratable();
        release.store(true, Ordering::SeqCst);
        t.wake();
        t.join();
        migratable
    });
    assert!(migratable);
}

/// A sleeping staged thread woken from a third CPU migrates to the CPU the
/// stage policy picks, and its armed timer moves with it and fires there.
#[test]
fn stage_wake_migrates_sleeper_with_timers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _g = serial();
    let (home, woke_cpu, waited, migrations) = run(3, || {
        // Two fixed CPUs per stage: stage 0 owns CPUs 0 and 1.
        stage::set_fixed_cpus_per_stage(1);
        let s = stage::define("net").expect("stage slot");

        let me = current_thread_ref().unwrap();
        let main = me.handle();
        let home_cpu = Arc::new(AtomicU32::new(u32::MAX));
        let flag = Arc::new(AtomicBool::new(false));
        let woke_cpu = Arc::new(AtomicU32::new(u32::MAX));
        let waited = Arc::new(AtomicU64::new(0));
        let migrations = Arc::new(AtomicU64::new(0));

        let home_cpu_t = home_cpu.clone();
        let flag_t = flag.clone();
        let woke_cpu_t = woke_cpu.clone();
        let waited_t = waited.clone();
        let migrations_t = migrations.clone();
        let t = Thread::make(
            move || {
                s.enqueue();
                home_cpu_t.store(current_processor().id, Ordering::SeqCst);
                main.wake();
                let start = uptime_now();
                // Blocks with a 200ms timer armed on the stage's CPU; the
                // mid-sleep wake relocates thread and timer together.
                let got_flag =
                    wait_until_timeout(|| flag_t.load(Ordering::SeqCst), Duration::from_millis(200));
                assert!(!got_flag, "nothing sets the flag");
                waited_t.store(uptime_now() - start, Ordering::SeqCst);
                woke_cpu_t.store(current_processor().id, Ordering::SeqCst);
                let me = current_thread_ref().unwrap();
                migrations_t.store(me.stat_migrations.load(Ordering::SeqCst), Ordering::SeqCst);
            },
            Attr::new().name("staged"),
        );
        t.start();
        wait_until(|| home_cpu.load(Ordering::SeqCst) != u32::MAX);
        let home = home_cpu.load(Ordering::SeqCst);

        // Keep the sleeper's CPU visibly loaded so the wake-time policy must
        // pick the stage's other CPU.
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let spinner = Thread::make(
            move || {
                while !stop2.load(Ordering::SeqCst) {
                    yield_now();
                }
            },
            Attr::new().name("spinner").pin(home),
        );
        spinner.start();
        sleep(Duration::from_millis(40));

        // Wake it from CPU 2; the (false) predicate puts the thread back to
        // sleep wherever the policy landed it.
        let handle = t.handle();
        let waker = Thread::make(move || handle.wake(), Attr::new().name("waker").pin(2));
        waker.start();
        waker.join();

        t.join();
        stop.store(true, Ordering::SeqCst);
        spinner.join();
        (
            home,
            woke_cpu.load(Ordering::SeqCst),
            waited.load(Ordering::SeqCst),
            migrations.load(Ordering::SeqCst),
        )
    });
    // The stage owns CPUs 0 and 1 only.
    assert!(woke_cpu == 0 || woke_cpu == 1, "woke on cpu {}", woke_cpu);
    assert!(home == 0 || home == 1, "staged onto cpu {}", home);
    // The wake found the home CPU loaded and moved the sleeper.
    assert_ne!(woke_cpu, home, "wake did not migrate");
    // The timeout elapsed in full despite the mid-sleep wake and migration.
    assert!(waited >= 200 * MS, "timer fired early: {}", waited);
    assert!(waited < 600 * MS, "timer lost in migration: {}", waited);
    assert!(migrations >= 1, "never migrated");
}
