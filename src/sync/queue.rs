//! Unbounded multi-producer/multi-consumer FIFO queue.
//!
//! A Michael–Scott queue over a singly-linked list with a sentinel head. The
//! node that `head` points to never holds a live value: the logical front of
//! the queue is `head.next`. Pushers link behind `tail` with a CAS on
//! `tail.next` and then try to swing `tail`; poppers swing `head` forward and
//! take the value out of the new sentinel. A lagging `tail` is helped forward
//! by whichever thread notices it.
//!
//! Popped sentinels are retired through `crossbeam_epoch`, so a thread that
//! loaded a node just before another thread unlinked it never reads freed
//! memory.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

struct Node<T> {
    // Initialised for every node except the current sentinel.
    data: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            data: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

/// A lock-free FIFO queue.
///
/// ```
/// use tasktimer::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.push(1);
/// queue.push(2);
/// assert_eq!(queue.pop(), Some(1));
/// assert_eq!(queue.pop(), Some(2));
/// assert_eq!(queue.pop(), None);
/// ```
pub struct LockFreeQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
    count: AtomicIsize,
}

// SAFETY: values move between threads only by being pushed and popped whole.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
// SAFETY: all shared mutation goes through atomics; see above.
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue holding only its sentinel node.
    pub fn new() -> Self {
        let queue = Self {
            head: Atomic::null(),
            tail: Atomic::null(),
            count: AtomicIsize::new(0),
        };

        // SAFETY: the queue is not shared yet.
        let sentinel = Owned::new(Node::sentinel()).into_shared(unsafe { epoch::unprotected() });
        queue.head.store(sentinel, Ordering::Relaxed);
        queue.tail.store(sentinel, Ordering::Relaxed);

        queue
    }

    /// Appends `value` at the back of the queue.
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let node = Owned::new(Node {
            data: MaybeUninit::new(value),
            next: Atomic::null(),
        })
        .into_shared(guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: `tail` is never null and cannot be reclaimed while pinned.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if !next.is_null() {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed, guard);
                continue;
            }

            if tail_ref
                .next
                .compare_exchange(Shared::null(), node, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed, guard);
                break;
            }
        }

        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes the oldest value, or returns `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();

        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: `head` is never null and cannot be reclaimed while pinned.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
            // SAFETY: as above; a non-null `next` is a live node.
            let next_ref = unsafe { next.as_ref() }?;

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_err()
            {
                continue;
            }

            let tail = self.tail.load(Ordering::Relaxed, guard);
            if tail == head {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed, guard);
            }

            self.count.fetch_sub(1, Ordering::Relaxed);

            // SAFETY: winning the head CAS makes this thread the only reader
            // of `next.data`; `next` is now the sentinel and its data is
            // never read again. The old sentinel is unreachable.
            unsafe {
                guard.defer_destroy(head);
                return Some(next_ref.data.assume_init_read());
            }
        }
    }

    /// Approximate number of queued values.
    ///
    /// The counter is updated after the structural change, so concurrent
    /// readers may observe transient skew.
    pub fn size(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Counts the queued values by walking the list.
    pub fn stat_size(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        let mut node = self.head.load(Ordering::Acquire, guard);

        // SAFETY: every reachable node stays alive while pinned.
        while let Some(current) = unsafe { node.as_ref() } {
            node = current.next.load(Ordering::Acquire, guard);
            if !node.is_null() {
                count += 1;
            }
        }

        count
    }

    /// Checks if the sentinel has no successor.
    ///
    /// # Returns
    /// true if nothing is queued at the instant of the check
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: `head` is never null and cannot be reclaimed while pinned.
        unsafe { head.deref() }.next.load(Ordering::Acquire, guard).is_null()
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}

        // SAFETY: `&mut self` means no other thread can reach the sentinel,
        // whose data was already taken (or never set).
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = self.head.load(Ordering::Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}
