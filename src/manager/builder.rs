//! Fluent builder for [`AsyncTaskManager`] construction.

use std::thread;
use std::time::Duration;

use crate::error::ManagerError;
use crate::manager::AsyncTaskManager;
use crate::timer::TimerConfig;

/// Tunables for an [`AsyncTaskManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Number of worker threads.
    pub workers: usize,

    /// Bound on task bodies waiting for a worker; `None` means unbounded.
    pub queue_capacity: Option<usize>,

    /// Active-task count above which a warning is logged on every enqueue.
    pub high_water_mark: usize,

    /// Hard limit on active tasks; enqueue fails with
    /// [`ManagerError::Saturated`] once it is reached.
    pub max_active: Option<usize>,

    /// Prefix for worker thread names.
    pub name: String,

    pub timer: TimerConfig,
}

impl ManagerConfig {
    pub const DEFAULT_HIGH_WATER_MARK: usize = 1000;
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(4, |n| n.get()),
            queue_capacity: None,
            high_water_mark: Self::DEFAULT_HIGH_WATER_MARK,
            max_active: None,
            name: "tasktimer".to_owned(),
            timer: TimerConfig::default(),
        }
    }
}

/// Builder for constructing [`AsyncTaskManager`] instances with a fluent API.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use tasktimer::ManagerBuilder;
///
/// let manager = ManagerBuilder::new()
///     .workers(2)
///     .max_active(128)
///     .poll_interval(Duration::from_millis(200))
///     .build()
///     .unwrap();
/// assert_eq!(manager.get_queue_length(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManagerBuilder {
    config: ManagerConfig,
}

impl ManagerBuilder {
    /// Creates a builder holding the default [`ManagerConfig`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads. Zero is raised to one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Bounds the number of task bodies waiting for a worker.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    /// Sets the active-task count above which every enqueue logs a warning.
    ///
    /// Crossing the mark never refuses work; use [`ManagerBuilder::max_active`] for that.
    ///
    /// # Arguments
    /// * `mark` - Active tasks tolerated before warning
    pub fn high_water_mark(mut self, mark: usize) -> Self {
        self.config.high_water_mark = mark;
        self
    }

    /// Refuses enqueues while `limit` tasks are active.
    pub fn max_active(mut self, limit: usize) -> Self {
        self.config.max_active = Some(limit);
        self
    }

    /// How long the timer thread may sleep without a wake-up.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.timer.poll_interval = interval;
        self
    }

    /// Thread name prefix for the workers and the timer thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.config.timer.thread_name = format!("{name}-timer");
        self.config.name = name;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Spawns the workers, starts the timer and returns the manager.
    pub fn build(self) -> Result<AsyncTaskManager, ManagerError> {
        AsyncTaskManager::with_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_also_names_timer_thread() {
        let builder = ManagerBuilder::new().name("billing").workers(3);
        assert_eq!(builder.config().name, "billing");
        assert_eq!(builder.config().timer.thread_name, "billing-timer");
        assert_eq!(builder.config().workers, 3);
    }

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.high_water_mark, 1000);
        assert!(config.max_active.is_none());
        assert!(config.queue_capacity.is_none());
    }
}
