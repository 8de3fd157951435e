//! Spin lock guarding the throttler state.
//!
//! Critical sections are a handful of float operations, so waiters spin
//! instead of parking. The raw lock plugs into `lock_api` to get the usual
//! RAII guard.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{self, GuardSend, RawMutex};

/// Spin iterations double until this step, after which waiters yield.
const SPIN_LIMIT: u32 = 6;

/// Exponential spin, then yield to the scheduler.
#[derive(Debug, Default)]
struct Backoff {
    step: u32,
}

impl Backoff {
    fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// A test-and-test-and-set lock over a single atomic flag.
#[derive(Debug)]
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let mut backoff = Backoff::default();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // Spin on a plain load so the cache line stays shared while held.
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Mutual exclusion over `T` using [`RawSpinLock`].
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// RAII guard returned by [`SpinLock::lock`].
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;
