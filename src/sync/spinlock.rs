//! Busy-wait mutual exclusion for short critical sections.
//!
//! The raw lock is a test-and-test-and-set flag. A contended acquirer spins
//! with a CPU pause hint for a bounded number of iterations, then yields its
//! time slice and starts over. Yields are counted per lock so contention can
//! be observed; they are never an error.
//!
//! The lock is neither fair nor reentrant: acquiring it twice from the same
//! thread deadlocks.

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

/// A spinlock protecting a value of type `T`.
///
/// ```
/// use tasktimer::sync::{RawSpinlock, Spinlock};
///
/// let lock = Spinlock::from_raw(RawSpinlock::named("counter"), 0_u32);
/// *lock.lock() += 1;
/// assert_eq!(*lock.lock(), 1);
/// ```
pub type Spinlock<T> = lock_api::Mutex<RawSpinlock, T>;

/// RAII guard returned by [`Spinlock::lock`]; the lock is released on drop.
pub type SpinlockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinlock, T>;

/// The raw lock state behind [`Spinlock`].
pub struct RawSpinlock {
    locked: AtomicBool,
    name: &'static str,
    spin_limit: u32,
    yields: AtomicU64,
}

impl RawSpinlock {
    /// Number of pause iterations before a contended acquirer yields.
    pub const DEFAULT_SPIN_LIMIT: u32 = 10_000;

    // Warnings start once a single acquisition has yielded more often than this.
    const QUIET_YIELDS: u32 = 3;

    /// Creates an unlocked raw spinlock with a diagnostic name and spin limit.
    pub const fn new(name: &'static str, spin_limit: u32) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            spin_limit,
            yields: AtomicU64::new(0),
        }
    }

    /// Creates an unlocked raw spinlock with the default spin limit.
    pub const fn named(name: &'static str) -> Self {
        Self::new(name, Self::DEFAULT_SPIN_LIMIT)
    }

    /// The diagnostic name used in contention warnings.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Total number of times acquirers of this lock fell back to yielding.
    pub fn yields(&self) -> u64 {
        self.yields.load(Ordering::Relaxed)
    }

    #[cold]
    fn contend(&self) {
        let mut spins = 0_u32;
        let mut rounds = 0_u32;

        loop {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
                spins += 1;

                if spins >= self.spin_limit {
                    spins = 0;
                    rounds += 1;
                    self.yields.fetch_add(1, Ordering::Relaxed);

                    if rounds > Self::QUIET_YIELDS && rounds.is_power_of_two() {
                        tracing::warn!(lock = self.name, yields = rounds, "spinlock contended");
                    }

                    thread::yield_now();
                }
            }

            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::named("spinlock")
    }
}

// SAFETY: `locked` is only set by a successful acquire CAS and only cleared by
// `unlock`, which lock_api calls exclusively from the current holder.
unsafe impl lock_api::RawMutex for RawSpinlock {
    type GuardMarker = lock_api::GuardSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::named("spinlock");

    fn lock(&self) {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.contend();
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

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Returns how many times acquirers of `lock` had to yield.
pub fn yield_count<T: ?Sized>(lock: &Spinlock<T>) -> u64 {
    // SAFETY: only the counter is read; the raw lock is never unlocked here.
    unsafe { lock.raw() }.yields()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lock_api::RawMutex as _;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::from_raw(RawSpinlock::named("try"), 7);

        let guard = lock.try_lock();
        assert_eq!(guard.as_deref(), Some(&7));
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn yields_after_spin_limit() {
        let raw = std::sync::Arc::new(RawSpinlock::new("tiny", 1));
        raw.lock();

        let contender = {
            let raw = raw.clone();
            thread::spawn(move || {
                raw.lock();
                // SAFETY: acquired just above.
                unsafe { raw.unlock() };
            })
        };

        while raw.yields() == 0 {
            thread::yield_now();
        }
        // SAFETY: acquired at the start of the test.
        unsafe { raw.unlock() };
        contender.join().unwrap();

        assert!(raw.yields() >= 1);
    }
}
