use std::sync::Arc;
use std::thread;

use tasktimer::sync::{RawSpinlock, Spinlock, yield_count};

#[test]
fn test_spinlock_mutual_exclusion() {
    let counter = Arc::new(Spinlock::from_raw(RawSpinlock::named("counter"), 0u64));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*counter.lock(), 80_000, "No increment should be lost");
}

#[test]
fn test_spinlock_try_lock_while_held() {
    let lock = Spinlock::new(5);
    let guard = lock.lock();
    assert!(lock.try_lock().is_none(), "try_lock should fail while held");
    drop(guard);

    let guard = lock.try_lock().expect("lock should be free");
    assert_eq!(*guard, 5);
}

#[test]
fn test_spinlock_yields_under_long_contention() {
    let lock = Arc::new(Spinlock::from_raw(RawSpinlock::new("slow", 16), ()));
    let guard = lock.lock();

    let waiter = {
        let lock = lock.clone();
        thread::spawn(move || {
            drop(lock.lock());
        })
    };

    while yield_count(&lock) == 0 {
        thread::yield_now();
    }
    drop(guard);
    waiter.join().unwrap();

    assert!(yield_count(&lock) > 0, "A starved waiter should yield the CPU");
}
