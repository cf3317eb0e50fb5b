//! Cross-CPU wakeup properties: no lost wakeups, no double resumes, and a
//! waker's writes are visible to the woken thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stagesched::{get_processor, run, wait_until, yield_now, Attr, Thread};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn cross_cpu_wake_race() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _g = serial();
    const ROUNDS: u64 = 1000;
    let resumes = run(2, || {
        let seq = Arc::new(AtomicU64::new(0));
        let resumes = Arc::new(AtomicU64::new(0));

        let seq_t = seq.clone();
        let resumes_t = resumes.clone();
        let t = Thread::make(
            move || {
                for i in 1..=ROUNDS {
                    // The waker stores seq before waking: observing seq >= i
                    // here is the wake-ordering property.
                    wait_until(|| seq_t.load(Ordering::SeqCst) >= i);
                    resumes_t.fetch_add(1, Ordering::SeqCst);
                }
            },
            Attr::new().name("sleeper").pin(1),
        );
        t.start();

        let handle = t.handle();
        let resumes_w = resumes.clone();
        let waker = Thread::make(
            move || {
                for i in 1..=ROUNDS {
                    seq.store(i, Ordering::SeqCst);
                    handle.wake();
                    while resumes_w.load(Ordering::SeqCst) < i {
                        yield_now();
                    }
                }
            },
            Attr::new().name("waker").pin(0),
        );
        waker.start();

        waker.join();
        t.join();
        // Every wakeup was drained; the fabric is quiescent.
        assert_eq!(get_processor(1).incoming_wakeups_pending(), 0);
        resumes.load(Ordering::SeqCst)
    });
    assert_eq!(resumes, ROUNDS);
}

#[test]
fn concurrent_wakers_are_safe() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _g = serial();
    let resumes = run(2, || {
        let hits = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let resumes = Arc::new(AtomicU64::new(0));

        let hits_t = hits.clone();
        let done_t = done.clone();
        let resumes_t = resumes.clone();
        let t = Thread::make(
            move || {
                let mut seen = 0;
                loop {
                    wait_until(|| hits_t.load(Ordering::SeqCst) > seen || done_t.load(Ordering::SeqCst));
                    resumes_t.fetch_add(1, Ordering::SeqCst);
                    seen = hits_t.load(Ordering::SeqCst);
                    if done_t.load(Ordering::SeqCst) {
                        break;
                    }
                }
            },
            Attr::new().name("target").pin(0),
        );
        t.start();

        let mut wakers = Vec::new();
        for w in 0..2u32 {
            let hits_w = hits.clone();
            let handle = t.handle();
            wakers.push(Thread::make(
                move || {
                    for _ in 0..500 {
                        hits_w.fetch_add(1, Ordering::SeqCst);
                        handle.wake();
                    }
                },
                Attr::new().name("waker").pin(1 - (w % 2)),
            ));
        }
        for w in &wakers {
            w.start();
        }
        for w in &wakers {
            w.join();
        }
        done.store(true, Ordering::SeqCst);
        t.wake();
        t.join();
        resumes.load(Ordering::SeqCst)
    });
    // The target resumed at least once and at most once per winning CAS:
    // never more than the number of wake calls.
    assert!(resumes >= 1);
    assert!(resumes <= 1001, "double resume: {}", resumes);
}
