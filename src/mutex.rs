//! A blocking mutex with wait morphing: `unlock` hands the lock directly to
//! the first waiter, which wakes already owning it. The hand-off goes through
//! the `SendingLock*` status states so no other waker can steal the wakeup
//! while the transfer is in flight.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::spinlock::Spinlock;
use crate::thread::{current_thread_ref, wait_until, ThreadRef};

/// One parked acquisition attempt. `woken` doubles as the ownership transfer:
/// once set, the waiter owns the mutex.
pub(crate) struct WaitRecord {
    thread: ThreadRef,
    woken: AtomicBool,
}

impl WaitRecord {
    fn new(thread: ThreadRef) -> Arc<Self> {
        Arc::new(Self {
            thread,
            woken: AtomicBool::new(false),
        })
    }

    /// Mark the record satisfied. Returns false if it already was.
    pub(crate) fn try_deliver(&self) -> bool {
        !self.woken.swap(true, Ordering::SeqCst)
    }

    fn woken(&self) -> bool {
        self.woken.load(Ordering::SeqCst)
    }
}

struct MutexInner {
    owned: bool,
    waiters: VecDeque<Arc<WaitRecord>>,
}

pub struct Mutex<T> {
    inner: Spinlock<MutexInner>,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Spinlock::new(MutexInner {
                owned: false,
                waiters: VecDeque::new(),
            }),
            cell: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let wr = {
            let mut q = self.inner.lock();
            if !q.owned {
                q.owned = true;
                return MutexGuard { lock: self };
            }
            let me = current_thread_ref().expect("contended mutex requires a scheduler thread");
            let wr = WaitRecord::new(me);
            q.waiters.push_back(wr.clone());
            wr
        };
        // Ownership arrives with the wakeup; no re-acquisition race.
        wait_until(|| wr.woken());
        MutexGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut q = self.inner.lock();
        if q.owned {
            return None;
        }
        q.owned = true;
        Some(MutexGuard { lock: self })
    }

    fn release(&self) {
        let next = {
            let mut q = self.inner.lock();
            match q.waiters.pop_front() {
                Some(wr) => Some(wr), // ownership stays set, it moves to wr
                None => {
                    q.owned = false;
                    None
                }
            }
        };
        if let Some(wr) = next {
            wr.thread.wake_lock(&wr);
        }
    }
}

pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<T> std::ops::Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> std::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
