use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU64, Ordering},
};

/// A ticket spinlock that disables interrupts for the duration of the guard.
/// Critical sections must be short and must not block.
#[repr(align(64))]
struct AlignedAtomicU64(AtomicU64);

pub struct Spinlock<T> {
    next_ticket: AlignedAtomicU64,
    current: AlignedAtomicU64,
    cell: UnsafeCell<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AlignedAtomicU64(AtomicU64::new(0)),
            current: AlignedAtomicU64(AtomicU64::new(0)),
            cell: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let interrupt_state = crate::interrupt::disable();
        let ticket = self.next_ticket.0.fetch_add(1, Ordering::Relaxed);
        while self.current.0.load(Ordering::Acquire) != ticket {
            std::hint::spin_loop();
        }
        SpinLockGuard {
            lock: self,
            interrupt_state,
        }
    }

    fn release(&self) {
        let next = self.current.0.load(Ordering::Relaxed) + 1;
        self.current.0.store(next, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    interrupt_state: bool,
}

impl<T> std::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> std::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
        crate::interrupt::set(self.interrupt_state);
    }
}

unsafe impl<T> Send for Spinlock<T> where T: Send {}
unsafe impl<T> Sync for Spinlock<T> where T: Send {}

/// A recursive spinlock whose holder is the `(cpu, thread)` pair packed into a
/// single word. Re-entry by the same logical holder nests; the lock is
/// released when the outermost guard drops. Preemption is disabled while the
/// lock is held so the holder identity stays valid.
pub struct RecursiveSpinlock<T> {
    holder: AtomicU64,
    depth: UnsafeCell<u32>,
    cell: UnsafeCell<T>,
}

const HOLDER_NONE: u64 = 0;

fn current_holder() -> u64 {
    let cpu = crate::processor::current_cpu_id().expect("recursive lock outside of a cpu context");
    let tid = crate::thread::current_thread_id().expect("recursive lock outside of a thread");
    assert_ne!(tid, 0);
    ((cpu as u64) << 32) | tid as u64
}

impl<T> RecursiveSpinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            holder: AtomicU64::new(HOLDER_NONE),
            depth: UnsafeCell::new(0),
            cell: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> RecursiveGuard<'_, T> {
        crate::sched::preempt_disable();
        let caller = current_holder();
        if self.holder.load(Ordering::Acquire) != caller {
            loop {
                match self.holder.compare_exchange(
                    HOLDER_NONE,
                    caller,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(_) => std::hint::spin_loop(),
                }
            }
        }
        unsafe { *self.depth.get() += 1 };
        RecursiveGuard { lock: self }
    }
}

pub struct RecursiveGuard<'a, T> {
    lock: &'a RecursiveSpinlock<T>,
}

impl<T> std::ops::Deref for RecursiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> std::ops::DerefMut for RecursiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for RecursiveGuard<'_, T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.lock.holder.load(Ordering::Relaxed), current_holder());
        let depth = unsafe {
            let d = self.lock.depth.get();
            *d -= 1;
            *d
        };
        if depth == 0 {
            self.lock.holder.store(HOLDER_NONE, Ordering::Release);
        }
        crate::sched::preempt_enable();
    }
}

unsafe impl<T> Send for RecursiveSpinlock<T> where T: Send {}
unsafe impl<T> Sync for RecursiveSpinlock<T> where T: Send {}
