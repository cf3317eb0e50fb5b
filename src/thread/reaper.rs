//! The reaper: a system thread that joins and cleans up detached zombies.

use std::collections::VecDeque;
use std::sync::OnceLock;

use crate::spinlock::Spinlock;
use crate::thread::{wait_until, Attr, Thread, ThreadRef};

static ZOMBIES: Spinlock<VecDeque<ThreadRef>> = Spinlock::new(VecDeque::new());
static REAPER: OnceLock<ThreadRef> = OnceLock::new();

pub(crate) fn init() {
    let t = Thread::make(reap, Attr::new().name("reaper"));
    t.start();
    REAPER.set(t).unwrap_or_else(|_| panic!("reaper started twice"));
}

pub(crate) fn add_zombie(z: ThreadRef) {
    assert!(z.is_detached());
    ZOMBIES.lock().push_back(z);
    if let Some(r) = REAPER.get() {
        r.wake();
    }
}

fn reap() {
    loop {
        wait_until(|| !ZOMBIES.lock().is_empty());
        loop {
            let z = ZOMBIES.lock().pop_front();
            let Some(z) = z else { break };
            z.join();
            z.run_cleanup();
        }
    }
}
