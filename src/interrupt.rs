//! IRQ-disable bookkeeping.
//!
//! On real hardware this maps to the interrupt flag of the executing CPU. In
//! the hosted model the flag travels with the execution context: interrupt
//! delivery (clock events) only happens at scheduler entry points, so the
//! flag's job is to delimit critical sections and to keep the preemption
//! discipline honest. The state is saved and restored across context switches
//! for free because it lives in the backing thread's TLS.

use std::cell::Cell;

thread_local! {
    static IRQ_ENABLED: Cell<bool> = Cell::new(true);
}

/// Disable interrupts, returning whether they were enabled before.
#[inline]
pub fn disable() -> bool {
    IRQ_ENABLED.with(|e| e.replace(false))
}

/// Restore a previously saved interrupt state.
#[inline]
pub fn set(state: bool) {
    IRQ_ENABLED.with(|e| e.set(state));
}

#[inline]
pub fn is_enabled() -> bool {
    IRQ_ENABLED.with(|e| e.get())
}

#[inline]
pub fn with_disabled<T, F: FnOnce() -> T>(f: F) -> T {
    let tmp = disable();
    let t = f();
    set(tmp);
    t
}
