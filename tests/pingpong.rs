//! Single-CPU yield behavior: strict alternation between two yielding
//! threads, and the refusal to yield to idle-priority work.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use stagesched::{preempt_disable, preempt_enable, run, yield_now, Attr, Thread};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn yield_ping_pong() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _g = serial();
    const ROUNDS: u64 = 1000;
    let (pa, pb, sa, sb) = run(1, || {
        let a = Thread::make(
            || {
                for _ in 0..ROUNDS {
                    yield_now();
                }
            },
            Attr::new().name("a").pin(0),
        );
        let b = Thread::make(
            || {
                for _ in 0..ROUNDS {
                    yield_now();
                }
            },
            Attr::new().name("b").pin(0),
        );
        // Start both before either can preempt us, so they enter the run
        // queue back to back.
        preempt_disable();
        a.start();
        b.start();
        preempt_enable();
        a.join();
        b.join();
        (
            a.stat_preemptions.load(Ordering::SeqCst),
            b.stat_preemptions.load(Ordering::SeqCst),
            a.stat_switches.load(Ordering::SeqCst),
            b.stat_switches.load(Ordering::SeqCst),
        )
    });
    // Every yield found the peer runnable, so every yield preempted.
    assert_eq!(pa, ROUNDS);
    assert_eq!(pb, ROUNDS);
    // Picked once at start plus once after each preemption.
    assert!((ROUNDS..=ROUNDS + 2).contains(&sa), "a switches {}", sa);
    assert!((ROUNDS..=ROUNDS + 2).contains(&sb), "b switches {}", sb);
}

#[test]
fn yield_refuses_idle() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _g = serial();
    let delta = run(1, || {
        let delta = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(u64::MAX));
        let delta2 = delta.clone();
        let t = Thread::make(
            move || {
                // Let the spawner go to sleep in join() first, so the run
                // queue holds nothing but the idle thread.
                stagesched::sleep(std::time::Duration::from_millis(20));
                let me = stagesched::current_thread_ref().unwrap();
                let before = me.stat_preemptions.load(Ordering::SeqCst);
                for _ in 0..100 {
                    yield_now();
                }
                delta2.store(
                    me.stat_preemptions.load(Ordering::SeqCst) - before,
                    Ordering::SeqCst,
                );
            },
            Attr::new().name("loner").pin(0),
        );
        t.start();
        t.join();
        delta.load(Ordering::SeqCst)
    });
    assert_eq!(delta, 0);
}
