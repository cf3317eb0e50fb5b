//! Context-switch substrate.
//!
//! Every scheduler thread is backed by a dedicated OS thread which is parked
//! whenever the thread does not hold a CPU. Handing a CPU to a thread is a
//! grant: set the flag, unpark the backing thread. The outgoing side then
//! parks itself. The flag is consumed in a loop, so stray unparks (shared with
//! the idle loop's mwait stand-in) are harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread as host;

pub(crate) struct ThreadContext {
    granted: AtomicBool,
    host: OnceLock<host::Thread>,
}

impl ThreadContext {
    pub(crate) fn new() -> Self {
        Self {
            granted: AtomicBool::new(false),
            host: OnceLock::new(),
        }
    }

    pub(crate) fn set_host(&self, h: host::Thread) {
        self.host
            .set(h)
            .unwrap_or_else(|_| panic!("backing thread registered twice"));
    }

    pub(crate) fn unpark_host(&self) {
        if let Some(h) = self.host.get() {
            h.unpark();
        }
    }

    /// Hand the CPU to this context. Callable from any thread.
    pub(crate) fn grant(&self) {
        self.granted.store(true, Ordering::Release);
        self.unpark_host();
    }

    /// Park until the CPU is granted to this context.
    pub(crate) fn wait_for_cpu(&self) {
        while !self.granted.swap(false, Ordering::Acquire) {
            host::park();
        }
    }
}
