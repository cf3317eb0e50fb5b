//! The blocking mutex: mutual exclusion under contention across CPUs, with
//! the lock handed directly to the next waiter.

use std::sync::Arc;

use stagesched::{run, Attr, Mutex, Thread};

#[test]
fn contended_increments_are_exact() {
    let _ = env_logger::builder().is_test(true).try_init();
    const THREADS: usize = 4;
    const ROUNDS: usize = 1000;
    let total = run(2, || {
        let counter = Arc::new(Mutex::new(0u64));
        let ts: Vec<_> = (0..THREADS)
            .map(|i| {
                let counter = counter.clone();
                let t = Thread::make(
                    move || {
                        for _ in 0..ROUNDS {
                            let mut g = counter.lock();
                            *g += 1;
                        }
                    },
                    Attr::new().name("adder").pin((i % 2) as u32),
                );
                t.start();
                t
            })
            .collect();
        for t in ts {
            t.join();
        }
        let total = *counter.lock();
        total
    });
    assert_eq!(total, (THREADS * ROUNDS) as u64);
}

#[test]
fn try_lock_respects_the_owner() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ok = run(2, || {
        let m = Mutex::new(5u32);
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        let g = m.try_lock().expect("uncontended");
        *g == 5
    });
    assert!(ok);
}
