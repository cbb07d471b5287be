//! Task lifecycle management.
//!
//! The [`AsyncTaskManager`] owns the worker pool, the timer controller, one
//! object pool per task type and the map of active tasks. Enqueueing a task
//! registers it, schedules its timeout (if any) and hands its body to a
//! worker. Whichever of `finish()` and the timeout gets there first decides
//! the round; the other becomes a no-op.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ManagerError, SubmitError};
use crate::pool::ObjectPool;
use crate::runtime::WorkerPool;
use crate::sync::{RawSpinlock, Spinlock};
use crate::task::{ActiveTask, AsyncTask, Task, TaskStatus};
use crate::timer::TimerController;

mod builder;

pub use builder::{ManagerBuilder, ManagerConfig};

/// Outcome of [`AsyncTaskManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every active task settled on its own within the grace period.
    pub drained: bool,
    /// Tasks that were still active when the grace period ran out and were
    /// forced through their timeout path.
    pub forced: usize,
}

trait CloseAll: Send + Sync {
    fn close_all(&self);
}

impl<T: AsyncTask> CloseAll for ObjectPool<Task<T>> {
    fn close_all(&self) {
        self.for_each_live(|task| task.body().close());
    }
}

struct PoolEntry {
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn CloseAll>,
}

/// One object pool per task type.
pub(crate) struct TaskPools {
    pools: Spinlock<HashMap<TypeId, PoolEntry>>,
}

impl TaskPools {
    fn new() -> Self {
        Self {
            pools: Spinlock::from_raw(RawSpinlock::named("manager.pools"), HashMap::new()),
        }
    }

    pub(crate) fn get<T: AsyncTask>(&self) -> Arc<ObjectPool<Task<T>>> {
        let typed = {
            let mut pools = self.pools.lock();
            let entry = pools.entry(TypeId::of::<T>()).or_insert_with(|| {
                let pool = Arc::new(ObjectPool::<Task<T>>::new(std::any::type_name::<T>()));
                PoolEntry {
                    typed: pool.clone(),
                    erased: pool,
                }
            });
            entry.typed.clone()
        };

        match typed.downcast::<ObjectPool<Task<T>>>() {
            Ok(pool) => pool,
            Err(_) => unreachable!("task pool keyed by a foreign type id"),
        }
    }

    fn close_all(&self) {
        let pools: Vec<Arc<dyn CloseAll>> = self
            .pools
            .lock()
            .values()
            .map(|entry| entry.erased.clone())
            .collect();

        for pool in pools {
            pool.close_all();
        }
    }
}

pub(crate) struct Inner {
    config: ManagerConfig,
    active: Spinlock<HashMap<i64, Arc<dyn ActiveTask>>>,
    pools: TaskPools,
    next_id: AtomicI64,
    workers: WorkerPool,
    timer: TimerController,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn lookup(&self, id: i64) -> Option<Arc<dyn ActiveTask>> {
        self.active.lock().get(&id).cloned()
    }

    /// Removes `id` from the active map and returns its instance to the pool.
    ///
    /// Idempotent: only the first call for a given id has an effect.
    pub(crate) fn release(&self, id: i64) -> bool {
        let Some(task) = self.active.lock().remove(&id) else {
            return false;
        };

        task.recycle(&self.pools);
        tracing::debug!(id, "task released");
        true
    }

    /// Deadline path: runs on the timer thread.
    fn timeout_task(self: &Arc<Self>, id: i64) {
        let Some(task) = self.lookup(id) else {
            tracing::debug!(id, "deadline for a released task ignored");
            return;
        };

        if !task.expire(id) {
            // A TIMEOUT round is released by its own handler job.
            if task.status() == TaskStatus::Finished {
                self.release(id);
            }
            return;
        }

        tracing::debug!(id, "task timed out");
        let manager = Arc::downgrade(self);
        let handler = task.clone();
        // Timeout handlers bypass the queue capacity; only a stopped pool refuses them.
        let submitted = self.workers.submit_unbounded(move || {
            handler.run_timeout(id);
            if let Some(manager) = manager.upgrade() {
                manager.release(id);
            }
        });

        if submitted.is_err() {
            tracing::warn!(id, "worker pool stopped; running timeout handler on the timer thread");
            task.run_timeout(id);
            self.release(id);
        }
    }

    fn shutdown(self: &Arc<Self>, grace: Duration) -> ShutdownReport {
        if self.closing.swap(true, Ordering::AcqRel) {
            tracing::debug!("task manager already shutting down");
        } else {
            tracing::info!(?grace, active = self.active.lock().len(), "task manager shutting down");
        }

        let deadline = Instant::now() + grace;
        while !self.active.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let remaining: Vec<i64> = self.active.lock().keys().copied().collect();
        if !remaining.is_empty() {
            tracing::warn!(tasks = remaining.len(), "forcing remaining tasks through timeout");
        }
        for id in &remaining {
            self.timeout_task(*id);
        }

        self.workers.shutdown();
        self.timer.stop();
        self.close();

        ShutdownReport {
            drained: remaining.is_empty(),
            forced: remaining.len(),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pools.close_all();
            tracing::info!("task manager closed");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);

        // No handle is left to hand timeout jobs to the workers; run them here.
        let remaining: Vec<(i64, Arc<dyn ActiveTask>)> = self.active.lock().drain().collect();
        for (id, task) in remaining {
            if task.expire(id) {
                task.clone().run_timeout(id);
            }
            task.recycle(&self.pools);
        }

        self.workers.shutdown();
        self.timer.stop();
        self.close();
    }
}

/// Schedules [`AsyncTask`]s on a worker pool and enforces their timeouts.
///
/// Cloning is cheap: all clones share the same workers, timer and pools.
/// The manager shuts down when the last clone is dropped, without a grace
/// period; call [`AsyncTaskManager::shutdown`] to let active tasks settle.
#[derive(Clone)]
pub struct AsyncTaskManager {
    inner: Arc<Inner>,
}

impl AsyncTaskManager {
    /// Starts a [`ManagerBuilder`] with default settings.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// Builds a manager with the default configuration.
    pub fn new() -> Result<Self, ManagerError> {
        Self::with_config(ManagerConfig::default())
    }

    /// Spawns the workers, starts the timer thread and returns the manager.
    ///
    /// # Arguments
    /// * `config` - Worker count, queue and admission limits, timer settings
    ///
    /// # Returns
    /// The running manager, or [`ManagerError::Spawn`] / [`ManagerError::Timer`]
    /// if the threads or the OS timer could not be set up
    pub fn with_config(config: ManagerConfig) -> Result<Self, ManagerError> {
        let workers = WorkerPool::new(config.workers, config.queue_capacity, &config.name)
            .map_err(ManagerError::Spawn)?;

        let timer = TimerController::with_config(config.timer.clone());
        timer.init()?;

        tracing::info!(
            workers = workers.size(),
            max_active = ?config.max_active,
            "task manager started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                active: Spinlock::from_raw(RawSpinlock::named("manager.active"), HashMap::new()),
                pools: TaskPools::new(),
                next_id: AtomicI64::new(0),
                workers,
                timer,
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Hands out an UNSCHEDULED task with a fresh id, reusing a pooled
    /// instance when one is idle.
    pub fn create_task<T: AsyncTask>(&self) -> Arc<Task<T>> {
        let pool = self.inner.pools.get::<T>();
        let task = pool.create();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let previous = task.prepare(id, Arc::downgrade(&self.inner));
        if previous == 0 {
            tracing::trace!(id, "task created");
        } else {
            tracing::trace!(id, previous, "pooled task reused");
        }
        task
    }

    /// Returns a task that was created but never enqueued to its pool.
    ///
    /// False if the task is scheduled or already back in the pool.
    pub fn discard_task<T: AsyncTask>(&self, task: Arc<Task<T>>) -> bool {
        let id = task.id();
        if !task.is_unscheduled() || self.inner.lookup(id).is_some() {
            tracing::warn!(id, status = ?task.status(), "refusing to discard a scheduled task");
            return false;
        }

        match self.inner.pools.get::<T>().try_recycle(task) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(id, %err, "task not discarded");
                false
            }
        }
    }

    /// Schedules `task`: registers it as active, arms its timeout when the
    /// threshold is non-zero and submits its body to the workers.
    ///
    /// On error the task is left UNSCHEDULED and may be enqueued again.
    ///
    /// # Returns
    /// The id of the dispatched round, or why the task was refused
    pub fn enqueue<T: AsyncTask>(&self, task: Arc<Task<T>>) -> Result<i64, ManagerError> {
        let inner = &self.inner;
        if inner.closing.load(Ordering::Acquire) {
            return Err(ManagerError::ShuttingDown);
        }
        if !task.belongs_to(inner) {
            return Err(ManagerError::ForeignTask(task.id()));
        }

        let id = task.begin().map_err(|status| ManagerError::AlreadyScheduled {
            id: task.id(),
            status,
        })?;

        let active = {
            let mut map = inner.active.lock();
            if let Some(limit) = inner.config.max_active {
                if map.len() >= limit {
                    let active = map.len();
                    drop(map);
                    task.rollback(id);
                    return Err(ManagerError::Saturated { active, limit });
                }
            }
            map.insert(id, task.clone());
            map.len()
        };

        if active > inner.config.high_water_mark {
            tracing::warn!(active, id, "active task count above high-water mark");
        }

        let threshold = task.timeout_threshold();
        if threshold > 0 {
            let manager = Arc::downgrade(inner);
            let scheduled = inner.timer.schedule(i64::from(threshold), move || {
                if let Some(manager) = manager.upgrade() {
                    manager.timeout_task(id);
                }
            });

            if let Err(err) = scheduled {
                inner.active.lock().remove(&id);
                task.rollback(id);
                return Err(err.into());
            }
        }

        let body = task.clone();
        if let Err(source) = inner.workers.submit(move || body.run_process(id)) {
            // A timeout armed above finds nothing to do.
            inner.active.lock().remove(&id);
            task.rollback(id);
            if source == SubmitError::ShutDown {
                return Err(ManagerError::ShuttingDown);
            }
            return Err(ManagerError::Rejected { id, source });
        }

        tracing::trace!(id, threshold, "task enqueued");
        Ok(id)
    }

    /// Releases the active task `id`; false if it is not active.
    ///
    /// [`RunningTask::finish`](crate::RunningTask::finish) and the timeout
    /// path call this themselves.
    pub fn safe_release_task(&self, id: i64) -> bool {
        self.inner.release(id)
    }

    /// Number of active tasks.
    pub fn get_queue_length(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Looks up an active task by id. `None` if it is not active or of another type.
    pub fn get_safe_task<T: AsyncTask>(&self, id: i64) -> Option<Arc<Task<T>>> {
        self.inner.lookup(id)?.into_any().downcast::<Task<T>>().ok()
    }

    /// Status of the active task `id`.
    pub fn status_of(&self, id: i64) -> Option<TaskStatus> {
        self.inner.lookup(id).map(|task| task.status())
    }

    /// Task bodies waiting for a worker.
    pub fn queued_jobs(&self) -> usize {
        self.inner.workers.queued()
    }

    /// Timeouts armed and not yet fired.
    pub fn pending_timeouts(&self) -> usize {
        self.inner.timer.pending()
    }

    /// (live, idle) instance counts of the pool for `T`.
    pub fn pool_stats<T: AsyncTask>(&self) -> (usize, usize) {
        let pool = self.inner.pools.get::<T>();
        (pool.live(), pool.idle())
    }

    /// Checks if [`AsyncTaskManager::shutdown`] has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Stops accepting tasks, waits up to `grace` for active tasks to settle,
    /// forces the rest through their timeout handler, then stops the workers
    /// and the timer and closes every pooled task.
    ///
    /// Calling it again is harmless.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.shutdown(grace)
    }
}
