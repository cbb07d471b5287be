//! Error types for the timer engine, the worker pool, the object pools and
//! the task manager.
//!
//! Fatal misuse (recycling an object a pool never created) is not represented
//! here: it aborts the process. Everything below is reported to the caller.

use std::io;

use thiserror::Error;

use crate::task::TaskStatus;

/// Errors reported by [`TimerController`](crate::TimerController).
#[derive(Debug, Error)]
pub enum TimerError {
    /// Creating the readiness descriptors failed; the controller never reached RUNNING.
    #[error("failed to initialise timer descriptors: {0}")]
    Init(#[source] io::Error),

    /// Arming the OS timer failed.
    #[error("failed to arm OS timer: {0}")]
    Arm(#[source] io::Error),

    /// Waking the timer thread failed.
    #[error("failed to notify timer thread: {0}")]
    Notify(#[source] io::Error),

    /// The timer thread could not be spawned.
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[source] io::Error),

    /// Work was submitted to a controller that is not running.
    #[error("timer controller is stopped")]
    Stopped,

    /// A delay below zero milliseconds was requested.
    #[error("negative delay: {0} ms")]
    NegativeDelay(i64),

    /// A periodic interval must be strictly positive.
    #[error("invalid cycle interval: {0} ms")]
    InvalidInterval(i64),

    /// The controller stopped before the callback fired.
    #[error("timer callback was discarded before it fired")]
    Canceled,
}

/// Errors reported by [`WorkerPool`](crate::WorkerPool) submissions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The bounded job queue is at capacity.
    #[error("worker queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    /// The pool has been shut down.
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Errors reported by [`ObjectPool::try_recycle`](crate::ObjectPool::try_recycle).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The object was not created by this pool.
    #[error("object {0:#x} was not created by this pool")]
    Foreign(usize),

    /// The object is already sitting in the recycle queue.
    #[error("object {0:#x} is already idle")]
    AlreadyIdle(usize),
}

/// Errors reported by [`AsyncTaskManager`](crate::AsyncTaskManager).
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Timer(#[from] TimerError),

    /// The worker threads could not be spawned.
    #[error("failed to spawn worker threads: {0}")]
    Spawn(#[source] io::Error),

    /// The manager is shutting down and accepts no new work.
    #[error("task manager is shutting down")]
    ShuttingDown,

    /// Admission control refused the task.
    #[error("too many active tasks ({active}, limit {limit})")]
    Saturated { active: usize, limit: usize },

    /// The worker queue refused the task body.
    #[error("task {id} rejected by worker pool: {source}")]
    Rejected {
        id: i64,
        #[source]
        source: SubmitError,
    },

    /// The task is not in the UNSCHEDULED state.
    #[error("task {id} is already scheduled ({status:?})")]
    AlreadyScheduled { id: i64, status: TaskStatus },

    /// The task was created by a different manager.
    #[error("task {0} belongs to another manager")]
    ForeignTask(i64),
}
