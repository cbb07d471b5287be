//! Timer-driven asynchronous task execution.
//!
//! This crate schedules user tasks on a pool of worker threads and enforces
//! per-task timeouts with a dedicated timer thread driven by the OS readiness
//! API (epoll + timerfd on Linux, kqueue on macOS).
//!
//! # Architecture
//!
//! - **AsyncTaskManager**: Owns workers, timer and task pools; enqueues tasks
//!   and arbitrates between `finish()` and the timeout
//! - **Task / AsyncTask**: Pooled task instances and the trait task types implement
//! - **TimerController**: One-shot and periodic callbacks ordered by deadline
//! - **WorkerPool**: Fixed set of threads draining a FIFO job queue
//! - **ObjectPool / LockFreePool**: Instance reuse with ownership checks
//! - **sync**: Spinlock, lock-free MPMC queue and lock-free stack
//! - **ManagerBuilder**: Fluent builder for manager construction

mod error;
mod manager;
mod pool;
mod runtime;
pub mod sync;
mod task;
mod timer;

pub use error::{ManagerError, PoolError, SubmitError, TimerError};
pub use manager::{AsyncTaskManager, ManagerBuilder, ManagerConfig, ShutdownReport};
pub use pool::{LockFreePool, ObjectPool};
pub use runtime::WorkerPool;
pub use sync::{LockFreeQueue, LockFreeStack, Spinlock};
pub use task::{AsyncTask, RunningTask, Task, TaskStatus};
pub use timer::{CycleHandle, Completion, Deadline, TimerConfig, TimerController, TimerState};
