//! Tasks scheduled by the [`AsyncTaskManager`](crate::AsyncTaskManager).
//!
//! A task type implements [`AsyncTask`]; the manager wraps each instance in a
//! [`Task`] that carries the scheduling header (id, parent id, timeout
//! threshold, status) and the task's typed context.
//!
//! # Status
//!
//! ```text
//! UNSCHEDULED --enqueue--> PROCESSING --finish()--> FINISHED
//!                                     \--deadline--> TIMEOUT
//! ```
//!
//! Exactly one terminal state is reached per scheduling round. Both paths
//! check-and-set the status under the task's own lock, and both compare the
//! task id against the id captured when the round was dispatched, so a late
//! caller from a previous round never touches a recycled instance.
//!
//! # Example
//!
//! ```
//! use tasktimer::{AsyncTask, AsyncTaskManager, RunningTask};
//!
//! #[derive(Default)]
//! struct Double;
//!
//! impl AsyncTask for Double {
//!     type Context = u32;
//!
//!     fn process(&self, task: RunningTask<'_, Self>) {
//!         *task.context() *= 2;
//!         task.finish();
//!     }
//!
//!     fn timeout(&self, _task: RunningTask<'_, Self>) {}
//! }
//!
//! let manager = AsyncTaskManager::builder().workers(1).build().unwrap();
//! let task = manager.create_task::<Double>();
//! *task.context() = 21;
//! manager.enqueue(task.clone()).unwrap();
//! # while !task.is_finished() { std::thread::yield_now(); }
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::manager::{Inner, TaskPools};
use crate::sync::{RawSpinlock, Spinlock, SpinlockGuard};

/// Where a task is in its scheduling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Unscheduled,
    Processing,
    Timeout,
    Finished,
}

impl TaskStatus {
    /// Whether the round has been decided.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Timeout | Self::Finished)
    }
}

/// The capability set a task type provides to the manager.
///
/// Instances are pooled and reused: [`AsyncTask::reset`] must bring any state
/// the task keeps outside its context back to a pristine value.
pub trait AsyncTask: Default + Send + Sync + Sized + 'static {
    /// Per-task payload, reset to `Default` whenever the instance is reused.
    type Context: Default + Send + 'static;

    /// Performs the work on a worker thread.
    ///
    /// The implementation must call [`RunningTask::finish`] once the work is
    /// logically complete. If `finish` returns `false` the round already
    /// timed out and no further business effect should be produced.
    fn process(&self, task: RunningTask<'_, Self>);

    /// Runs on a worker thread when the deadline passes before `finish`.
    fn timeout(&self, task: RunningTask<'_, Self>);

    /// Called once when the manager disposes of the instance for good.
    fn close(&self) {}

    /// Called before a pooled instance is reused.
    fn reset(&self) {}
}

struct TaskState {
    id: i64,
    status: TaskStatus,
    manager: Weak<Inner>,
}

/// A pooled task instance: scheduling header, context, and the task body.
pub struct Task<T: AsyncTask> {
    state: Spinlock<TaskState>,
    parent_id: AtomicI64,
    timeout_threshold: AtomicU32,
    context: Spinlock<T::Context>,
    body: T,
}

impl<T: AsyncTask> Default for Task<T> {
    fn default() -> Self {
        Self {
            state: Spinlock::from_raw(
                RawSpinlock::named("task"),
                TaskState {
                    id: 0,
                    status: TaskStatus::Unscheduled,
                    manager: Weak::new(),
                },
            ),
            parent_id: AtomicI64::new(0),
            timeout_threshold: AtomicU32::new(0),
            context: Spinlock::from_raw(RawSpinlock::named("task.context"), T::Context::default()),
            body: T::default(),
        }
    }
}

impl<T: AsyncTask> Task<T> {
    /// The id of the current scheduling round; 0 before the first assignment.
    pub fn id(&self) -> i64 {
        self.state.lock().id
    }

    /// Current status of the instance, guarded by its state lock.
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Checks if the task is waiting to be enqueued.
    pub fn is_unscheduled(&self) -> bool {
        self.status() == TaskStatus::Unscheduled
    }

    /// Checks if the current round ended by timeout.
    ///
    /// # Returns
    /// true once the deadline won the round, false while processing or after `finish()`
    pub fn is_timeout(&self) -> bool {
        self.status() == TaskStatus::Timeout
    }

    /// Checks if the current round ended through [`RunningTask::finish`].
    pub fn is_finished(&self) -> bool {
        self.status() == TaskStatus::Finished
    }

    /// Informational link to the task that caused this one.
    pub fn parent_id(&self) -> i64 {
        self.parent_id.load(Ordering::Relaxed)
    }

    /// Records the task that caused this one. Informational only.
    pub fn set_parent_id(&self, parent_id: i64) {
        self.parent_id.store(parent_id, Ordering::Relaxed);
    }

    /// Timeout in milliseconds; 0 disables timeout enforcement.
    pub fn timeout_threshold(&self) -> u32 {
        self.timeout_threshold.load(Ordering::Relaxed)
    }

    /// Sets the timeout for the next round.
    ///
    /// Must be called before [`AsyncTaskManager::enqueue`](crate::AsyncTaskManager::enqueue);
    /// the value is read once at dispatch.
    ///
    /// # Arguments
    /// * `millis` - Milliseconds until the timeout fires, 0 to disable it
    pub fn set_timeout_threshold(&self, millis: u32) {
        self.timeout_threshold.store(millis, Ordering::Relaxed);
    }

    /// Locks and returns the task's context.
    pub fn context(&self) -> SpinlockGuard<'_, T::Context> {
        self.context.lock()
    }

    /// The task implementation shared by every round of this instance.
    pub fn body(&self) -> &T {
        &self.body
    }

    /// Resets a reused instance and assigns it a new round. Returns the previous id.
    pub(crate) fn prepare(&self, id: i64, manager: Weak<Inner>) -> i64 {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.id;
            state.id = id;
            state.status = TaskStatus::Unscheduled;
            state.manager = manager;
            previous
        };

        if previous != 0 {
            self.parent_id.store(0, Ordering::Relaxed);
            self.timeout_threshold.store(0, Ordering::Relaxed);
            *self.context.lock() = T::Context::default();
            self.body.reset();
        }

        previous
    }

    pub(crate) fn belongs_to(&self, manager: &Arc<Inner>) -> bool {
        Weak::as_ptr(&self.state.lock().manager) == Arc::as_ptr(manager)
    }

    /// Moves an unscheduled task to PROCESSING and returns the round id.
    pub(crate) fn begin(&self) -> Result<i64, TaskStatus> {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Unscheduled {
            return Err(state.status);
        }
        state.status = TaskStatus::Processing;
        Ok(state.id)
    }

    /// Undoes [`Task::begin`] after a failed dispatch.
    pub(crate) fn rollback(&self, round: i64) {
        let mut state = self.state.lock();
        if state.id == round && state.status == TaskStatus::Processing {
            state.status = TaskStatus::Unscheduled;
        }
    }

    /// Decides round `round` in favour of `to`; false if already decided or stale.
    fn settle(&self, round: i64, to: TaskStatus) -> bool {
        let mut state = self.state.lock();
        if state.id != round || state.status != TaskStatus::Processing {
            return false;
        }
        state.status = to;
        true
    }

    /// Whether round `round` is dispatched and still undecided.
    fn is_processing(&self, round: i64) -> bool {
        let state = self.state.lock();
        state.id == round && state.status == TaskStatus::Processing
    }

    fn manager(&self) -> Option<Arc<Inner>> {
        self.state.lock().manager.upgrade()
    }
}

/// A task seen from inside one scheduling round.
///
/// Handed to [`AsyncTask::process`] and [`AsyncTask::timeout`].
pub struct RunningTask<'a, T: AsyncTask> {
    task: &'a Arc<Task<T>>,
    round: i64,
}

impl<T: AsyncTask> RunningTask<'_, T> {
    /// The id this round was dispatched under.
    pub fn id(&self) -> i64 {
        self.round
    }

    /// The pooled instance running this round.
    pub fn task(&self) -> &Arc<Task<T>> {
        self.task
    }

    /// Locks and returns the task's context.
    pub fn context(&self) -> SpinlockGuard<'_, T::Context> {
        self.task.context()
    }

    /// Status of the instance; no longer this round's once [`RunningTask::is_current`] is false.
    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    /// Whether the instance still belongs to this round.
    pub fn is_current(&self) -> bool {
        self.task.id() == self.round
    }

    /// Marks the round FINISHED and releases the task back to the manager.
    ///
    /// Returns `false` if the round already timed out (or the instance moved
    /// on to another round); the caller then performs cleanup only.
    pub fn finish(&self) -> bool {
        if !self.task.settle(self.round, TaskStatus::Finished) {
            tracing::debug!(id = self.round, "task already settled; finish ignored");
            return false;
        }

        if let Some(manager) = self.task.manager() {
            manager.release(self.round);
        }
        true
    }
}

/// Type-erased view of an active task, as stored by the manager.
pub(crate) trait ActiveTask: Send + Sync {
    fn status(&self) -> TaskStatus;

    /// Decides round `round` as TIMEOUT; false if the other path won.
    fn expire(&self, round: i64) -> bool;

    fn run_process(self: Arc<Self>, round: i64);

    fn run_timeout(self: Arc<Self>, round: i64);

    fn recycle(self: Arc<Self>, pools: &TaskPools);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: AsyncTask> ActiveTask for Task<T> {
    fn status(&self) -> TaskStatus {
        Task::status(self)
    }

    fn expire(&self, round: i64) -> bool {
        self.settle(round, TaskStatus::Timeout)
    }

    fn run_process(self: Arc<Self>, round: i64) {
        if !self.is_processing(round) {
            tracing::debug!(id = round, "round settled before its body started; skipping process");
            return;
        }

        let running = RunningTask {
            task: &self,
            round,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.body.process(running)));
        if outcome.is_err() {
            tracing::error!(id = round, "task process panicked; settling it as finished");
            RunningTask {
                task: &self,
                round,
            }
            .finish();
        }
    }

    fn run_timeout(self: Arc<Self>, round: i64) {
        let running = RunningTask {
            task: &self,
            round,
        };

        if panic::catch_unwind(AssertUnwindSafe(|| self.body.timeout(running))).is_err() {
            tracing::error!(id = round, "task timeout handler panicked");
        }
    }

    fn recycle(self: Arc<Self>, pools: &TaskPools) {
        pools.get::<T>().recycle(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
