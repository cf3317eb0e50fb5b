//! Threads started before the CPU set is up park as prestarted and are
//! released by CPU 0 once the machine boots.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use stagesched::{register_cpu_notifier, run, Attr, Status, Thread};

#[test]
fn prestarted_threads_run_after_bring_up() {
    let _ = env_logger::builder().is_test(true).try_init();
    static CPUS_UP: AtomicU32 = AtomicU32::new(0);
    register_cpu_notifier(|c| {
        // Runs pinned on the CPU that just came up.
        assert_eq!(stagesched::current_processor().id, c.id);
        CPUS_UP.fetch_add(1, Ordering::SeqCst);
    });
    let ran = Arc::new(AtomicU32::new(0));
    let ts: Vec<_> = (0..3)
        .map(|i| {
            let ran = ran.clone();
            let t = Thread::make(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                Attr::new().name(format!("early{}", i)),
            );
            t.start();
            t
        })
        .collect();
    for t in &ts {
        assert_eq!(t.get_status(), Status::Prestarted);
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let ran2 = ran.clone();
    let joined = run(2, move || {
        for t in &ts {
            t.join();
        }
        ran2.load(Ordering::SeqCst)
    });
    assert_eq!(joined, 3);
    assert_eq!(CPUS_UP.load(Ordering::SeqCst), 2);
}
