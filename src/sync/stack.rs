//! Unbounded lock-free LIFO stack (Treiber stack).

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Owned};

struct Node<T> {
    data: ManuallyDrop<T>,
    next: *const Node<T>,
}

/// A lock-free stack; nodes are reclaimed through `crossbeam_epoch`.
pub struct LockFreeStack<T> {
    top: Atomic<Node<T>>,
    count: AtomicIsize,
}

// SAFETY: values move between threads only by being pushed and popped whole.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
// SAFETY: all shared mutation goes through atomics.
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self {
            top: Atomic::null(),
            count: AtomicIsize::new(0),
        }
    }

    /// Pushes `value` on top of the stack.
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node {
            data: ManuallyDrop::new(value),
            next: ptr::null(),
        });

        loop {
            let top = self.top.load(Ordering::Relaxed, guard);
            node.next = top.as_raw();

            match self
                .top
                .compare_exchange(top, node, Ordering::Release, Ordering::Relaxed, guard)
            {
                Ok(_) => break,
                Err(err) => node = err.new,
            }
        }

        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes and returns the most recently pushed value.
    ///
    /// # Returns
    /// Some(value) if the stack was non-empty, None otherwise
    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();

        loop {
            let top = self.top.load(Ordering::Acquire, guard);
            // SAFETY: nodes reachable from `top` stay alive while pinned.
            let top_ref = unsafe { top.as_ref() }?;
            let next = epoch::Shared::from(top_ref.next);

            if self
                .top
                .compare_exchange(top, next, Ordering::Relaxed, Ordering::Relaxed, guard)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::Relaxed);

                // SAFETY: winning the CAS unlinked `top`; this thread is the
                // only one that reads its value, and `ManuallyDrop` keeps the
                // deferred destructor from dropping it again.
                unsafe {
                    guard.defer_destroy(top);
                    return Some(ManuallyDrop::into_inner(ptr::read(&top_ref.data)));
                }
            }
        }
    }

    /// Approximate number of stacked values.
    pub fn size(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Checks if the stack has no elements.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.top.load(Ordering::Acquire, guard).is_null()
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_in_first_out() {
        let stack = LockFreeStack::new();
        stack.push("a");
        stack.push("b");
        stack.push("c");
        assert_eq!(stack.size(), 3);

        assert_eq!(stack.pop(), Some("c"));
        assert_eq!(stack.pop(), Some("b"));
        assert_eq!(stack.pop(), Some("a"));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_push_pop_loses_nothing() {
        let stack = std::sync::Arc::new(LockFreeStack::new());
        let mut handles = Vec::new();

        for t in 0..4 {
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10_000 {
                    stack.push(t * 10_000 + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(value) = stack.pop() {
            seen.push(value);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..40_000).collect::<Vec<_>>());
    }
}
