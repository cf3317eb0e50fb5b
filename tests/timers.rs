//! Timer round-trip, cancel and reset behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stagesched::clock::uptime_now;
use stagesched::timer::{TimerClient, TimerClientState};
use stagesched::{run, sleep, wait_until, wait_until_timeout, ThreadHandle, Timer};

const MS: u64 = 1_000_000;

// Scheduling slack for a loaded host.
const SLACK: u64 = 150 * MS;

#[test]
fn sleep_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (asked, took) = run(2, || {
        let start = uptime_now();
        sleep(Duration::from_millis(30));
        (30 * MS, uptime_now() - start)
    });
    assert!(took >= asked, "woke early: {} < {}", took, asked);
    assert!(took < asked + SLACK, "woke late: {}", took);
}

#[test]
fn cancel_prevents_firing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let expired = run(2, || {
        let tmr = Timer::for_current_thread();
        tmr.set(uptime_now() + 20 * MS);
        tmr.cancel();
        sleep(Duration::from_millis(60));
        tmr.expired()
    });
    assert!(!expired);
}

#[test]
fn reset_replaces_fire_time() {
    let _ = env_logger::builder().is_test(true).try_init();
    let took = run(2, || {
        let start = uptime_now();
        let tmr = Timer::for_current_thread();
        tmr.set(start + 500 * MS);
        tmr.reset(start + 40 * MS);
        wait_until(|| tmr.expired());
        uptime_now() - start
    });
    assert!(took >= 40 * MS, "fired early: {}", took);
    assert!(took < 300 * MS, "reset did not move the fire time: {}", took);
}

#[test]
fn rearming_an_expired_timer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ok = run(2, || {
        let tmr = Timer::for_current_thread();
        tmr.set(uptime_now() + 10 * MS);
        wait_until(|| tmr.expired());
        // Arm the same timer again after expiry.
        tmr.set(uptime_now() + 10 * MS);
        wait_until(|| tmr.expired());
        true
    });
    assert!(ok);
}

struct FlagClient {
    state: TimerClientState,
    fired: AtomicBool,
    notify: ThreadHandle,
}

impl TimerClient for FlagClient {
    fn timer_client_state(&self) -> &TimerClientState {
        &self.state
    }

    fn timer_fired(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.wake();
    }
}

#[test]
fn custom_clients_get_callbacks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ok = run(2, || {
        let me = stagesched::current_thread_ref().unwrap();
        let client = Arc::new(FlagClient {
            state: TimerClientState::new(),
            fired: AtomicBool::new(false),
            notify: me.handle(),
        });
        let tmr = Timer::new(client.clone());
        tmr.set(uptime_now() + 15 * MS);
        wait_until(|| client.fired.load(Ordering::SeqCst));
        tmr.expired()
    });
    assert!(ok);
}

#[test]
fn timed_wait_reports_outcome() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (timed_out_result, satisfied_result) = run(2, || {
        let start = uptime_now();
        let a = wait_until_timeout(|| false, Duration::from_millis(25));
        let waited = uptime_now() - start;
        assert!(waited >= 25 * MS);
        let b = wait_until_timeout(|| true, Duration::from_secs(60));
        (a, b)
    });
    assert!(!timed_out_result);
    assert!(satisfied_result);
}
