//! Synchronization primitives shared by the pools, the timer engine and the
//! task manager.
//!
//! - [`spinlock`]: bounded-spin-then-yield mutual exclusion
//! - [`queue`]: lock-free MPMC FIFO queue
//! - [`stack`]: lock-free LIFO stack

pub mod queue;
pub mod spinlock;
pub mod stack;

pub use queue::LockFreeQueue;
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard, yield_count};
pub use stack::LockFreeStack;
