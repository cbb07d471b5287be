//! Deferred and periodic callbacks driven by a single timer thread.
//!
//! [`TimerController`] keeps pending callbacks in a min-heap ordered by
//! deadline and arms one OS timer to the earliest of them. Submitters never
//! touch the heap: they push onto a lock-free submission queue and wake the
//! timer thread, which moves submissions into the heap, re-arming the OS timer
//! whenever a newcomer is earlier than the current head.
//!
//! Callbacks run synchronously on the timer thread, so they must be short.
//!
//! # Lifecycle
//!
//! `UNINITIALIZED -> RUNNING -> STOPPING -> CLOSED`. [`TimerController::init`]
//! starts the thread and is idempotent while running; [`TimerController::stop`]
//! joins it and is idempotent too. A closed controller cannot be restarted.
//!
//! # Example
//!
//! ```
//! use tasktimer::TimerController;
//!
//! let timer = TimerController::new();
//! timer.init().unwrap();
//!
//! let answer = timer.delay_process(10, || 6 * 7).unwrap();
//! assert_eq!(answer.wait().unwrap(), 42);
//!
//! timer.stop();
//! ```

mod heap;
mod poller;
mod task;

pub use task::Deadline;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::TimerError;
use crate::pool::ObjectPool;
use crate::sync::{LockFreeQueue, RawSpinlock, Spinlock};
use heap::{Entry, TimerHeap};
use poller::{Events, Poller, Readiness, Signal};
use task::{Callback, TimerSlot};

/// Lifecycle of a [`TimerController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimerState {
    Uninitialized = 0,
    Running = 1,
    Stopping = 2,
    Closed = 3,
}

impl TimerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Closed,
        }
    }
}

/// Tunables for a [`TimerController`].
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Longest the timer thread blocks before sweeping for expired entries
    /// even without a wake-up.
    pub poll_interval: Duration,

    /// Name given to the timer thread.
    pub thread_name: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            thread_name: "tasktimer-timer".to_owned(),
        }
    }
}

/// The result of a [`TimerController::delay_process`] callback.
#[derive(Debug)]
pub struct Completion<R> {
    rx: Receiver<R>,
}

impl<R> Completion<R> {
    /// Blocks until the callback has run and returns its result.
    ///
    /// Fails with [`TimerError::Canceled`] if the controller stopped first.
    pub fn wait(self) -> Result<R, TimerError> {
        self.rx.recv().map_err(|_| TimerError::Canceled)
    }

    /// Like [`Completion::wait`], giving up after `timeout`.
    ///
    /// Returns the completion back if the callback has not fired yet.
    pub fn wait_timeout(self, timeout: Duration) -> Result<R, Result<Self, TimerError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(Ok(self)),
            Err(RecvTimeoutError::Disconnected) => Err(Err(TimerError::Canceled)),
        }
    }

    /// Returns the result if the callback has already run.
    pub fn try_get(&self) -> Result<Option<R>, TimerError> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TimerError::Canceled),
        }
    }
}

#[derive(Debug, Default)]
struct CycleState {
    canceled: AtomicBool,
    fired: AtomicU64,
}

/// Controls a callback scheduled with [`TimerController::cycle_process`].
#[derive(Debug, Clone)]
pub struct CycleHandle {
    state: Arc<CycleState>,
}

impl CycleHandle {
    /// Prevents any further firing. A firing already in progress completes.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::Release);
    }

    /// Checks if [`CycleHandle::cancel`] was called.
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    /// How many times the callback has run.
    pub fn fired(&self) -> u64 {
        self.state.fired.load(Ordering::Acquire)
    }
}

/// State shared between submitters and the timer thread.
struct Shared {
    poller: Poller,
    stop: AtomicBool,
    submissions: LockFreeQueue<Arc<TimerSlot>>,
    heap: Spinlock<TimerHeap>,
    pool: Arc<ObjectPool<TimerSlot>>,
    poll_interval: Duration,
}

struct Running {
    shared: Arc<Shared>,
    thread: JoinHandle<()>,
}

/// Schedules one-shot and periodic callbacks on a dedicated thread.
pub struct TimerController {
    config: TimerConfig,
    state: AtomicU8,
    running: Spinlock<Option<Running>>,
    pool: Arc<ObjectPool<TimerSlot>>,
}

impl Default for TimerController {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerController {
    /// Creates an uninitialized controller with the default configuration.
    pub fn new() -> Self {
        Self::with_config(TimerConfig::default())
    }

    /// Creates an uninitialized controller.
    ///
    /// Nothing is spawned until [`TimerController::init`].
    ///
    /// # Arguments
    /// * `config` - Poll interval and timer thread name
    pub fn with_config(config: TimerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(TimerState::Uninitialized as u8),
            running: Spinlock::from_raw(RawSpinlock::named("timer.running"), None),
            pool: Arc::new(ObjectPool::new("timer_task")),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TimerState {
        TimerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Checks if the controller accepts new callbacks.
    pub fn is_running(&self) -> bool {
        self.state() == TimerState::Running
    }

    /// Creates the OS descriptors, arms the timer and starts the timer thread.
    pub fn init(&self) -> Result<(), TimerError> {
        let mut running = self.running.lock();

        match self.state() {
            TimerState::Running => return Ok(()),
            TimerState::Stopping | TimerState::Closed => return Err(TimerError::Stopped),
            TimerState::Uninitialized => {}
        }

        let poller = Poller::new().map_err(TimerError::Init)?;
        poller
            .arm(Deadline::now().after(self.config.poll_interval))
            .map_err(TimerError::Arm)?;

        let shared = Arc::new(Shared {
            poller,
            stop: AtomicBool::new(false),
            submissions: LockFreeQueue::new(),
            heap: Spinlock::from_raw(RawSpinlock::named("timer.heap"), TimerHeap::default()),
            pool: self.pool.clone(),
            poll_interval: self.config.poll_interval,
        });

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(self.config.thread_name.clone())
                .spawn(move || shared.run())
                .map_err(TimerError::Spawn)?
        };

        *running = Some(Running { shared, thread });
        self.state
            .store(TimerState::Running as u8, Ordering::Release);

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "timer controller running"
        );
        Ok(())
    }

    /// Stops the timer thread and releases its descriptors.
    ///
    /// Callbacks that have not fired are discarded. Safe to call repeatedly.
    pub fn stop(&self) {
        let running = {
            let mut running = self.running.lock();
            let _ = self.state.compare_exchange(
                TimerState::Running as u8,
                TimerState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            running.take()
        };

        let Some(Running { shared, thread }) = running else {
            if self.state() == TimerState::Uninitialized {
                self.state.store(TimerState::Closed as u8, Ordering::Release);
            }
            return;
        };

        shared.stop.store(true, Ordering::Release);
        if let Err(err) = shared.poller.notify(Signal::Stop) {
            tracing::warn!(%err, "failed to wake timer thread; it exits on the next sweep");
        }

        if thread.thread().id() == thread::current().id() {
            tracing::debug!("timer stopped from its own thread; not joining");
        } else if thread.join().is_err() {
            tracing::error!("timer thread panicked");
        }

        self.state.store(TimerState::Closed as u8, Ordering::Release);
        tracing::info!("timer controller closed");
    }

    /// Runs `f` once, `delay_ms` milliseconds from now.
    pub fn delay_process<F, R>(&self, delay_ms: i64, f: F) -> Result<Completion<R>, TimerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if delay_ms < 0 {
            return Err(TimerError::NegativeDelay(delay_ms));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit(
            delay_ms,
            Callback::Once(Box::new(move || {
                let _ = tx.send(f());
            })),
        )?;

        Ok(Completion { rx })
    }

    /// Runs `f` once, `delay_ms` milliseconds from now, without a result channel.
    pub(crate) fn schedule<F>(&self, delay_ms: i64, f: F) -> Result<(), TimerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if delay_ms < 0 {
            return Err(TimerError::NegativeDelay(delay_ms));
        }

        self.submit(delay_ms, Callback::Once(Box::new(f)))
    }

    /// Runs `f` every `interval_ms` milliseconds, first after one interval.
    pub fn cycle_process<F>(&self, interval_ms: i64, mut f: F) -> Result<CycleHandle, TimerError>
    where
        F: FnMut() + Send + 'static,
    {
        if interval_ms <= 0 {
            return Err(TimerError::InvalidInterval(interval_ms));
        }

        let state = Arc::new(CycleState::default());
        let handle = CycleHandle {
            state: state.clone(),
        };

        self.submit(
            interval_ms,
            Callback::Repeat(Box::new(move || {
                if state.canceled.load(Ordering::Acquire) {
                    return false;
                }
                f();
                state.fired.fetch_add(1, Ordering::AcqRel);
                !state.canceled.load(Ordering::Acquire)
            })),
        )?;

        Ok(handle)
    }

    /// Number of callbacks that have been submitted and not yet fired.
    pub fn pending(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.shared.heap.lock().len() + running.shared.submissions.size())
            .unwrap_or(0)
    }

    fn submit(&self, interval: i64, callback: Callback) -> Result<(), TimerError> {
        if !self.is_running() {
            return Err(TimerError::Stopped);
        }

        // Held until the slot is queued so stop() cannot strand it.
        let running = self.running.lock();
        let shared = running
            .as_ref()
            .map(|running| running.shared.clone())
            .ok_or(TimerError::Stopped)?;

        let slot = shared.pool.create();
        let deadline = {
            let mut task = slot.lock();
            let now = Deadline::now();
            task.interval = interval;
            task.create_time = now;
            task.expect_time = now.after_millis(interval);
            task.callback = Some(callback);
            task.expect_time
        };

        tracing::debug!(interval_ms = interval, deadline = ?deadline, "timer task submitted");
        shared.submissions.push(slot.clone());

        if let Err(err) = shared.poller.notify(Signal::Submit) {
            // Retract: the timer thread recycles a slot without a callback.
            slot.lock().callback = None;
            return Err(TimerError::Notify(err));
        }

        drop(running);
        Ok(())
    }
}

impl Drop for TimerController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        let mut events = Events::with_capacity(8);

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let readiness = match self.poller.wait(&mut events, self.poll_interval) {
                Ok(readiness) => readiness,
                Err(err) => {
                    tracing::error!(%err, "timer poll failed; stopping timer thread");
                    break;
                }
            };

            if readiness.stop || self.stop.load(Ordering::Acquire) {
                break;
            }

            // Both run on every wake; a timeout wake is the liveness sweep.
            let Readiness { submitted, expired, .. } = readiness;
            tracing::trace!(submitted, expired, "timer thread woke");
            self.drain_submissions();
            self.fire_expired();
        }

        self.discard_pending();
        tracing::debug!("timer thread exited");
    }

    fn drain_submissions(&self) {
        while let Some(slot) = self.submissions.pop() {
            let deadline = slot.lock().expect_time;

            let mut heap = self.heap.lock();
            let earlier = heap.earliest().is_none_or(|earliest| deadline < earliest);
            heap.push(deadline, slot);
            drop(heap);

            if earlier {
                self.arm(deadline);
            }
        }
    }

    fn fire_expired(&self) {
        loop {
            let now = Deadline::now();
            let Some(entry) = self.heap.lock().pop_expired(now) else {
                break;
            };
            self.fire(entry, now);
        }

        let next = self.heap.lock().earliest();
        self.arm(next.unwrap_or_else(|| Deadline::now().after(self.poll_interval)));
    }

    fn fire(&self, entry: Entry, now: Deadline) {
        let Entry { deadline, slot, .. } = entry;
        let callback = slot.lock().callback.take();
        tracing::trace!(deadline = ?deadline, "timer task fired");

        match callback {
            None => {}
            Some(Callback::Once(f)) => {
                if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                    tracing::error!("timer callback panicked");
                }
            }
            Some(Callback::Repeat(mut f)) => {
                let again = panic::catch_unwind(AssertUnwindSafe(&mut f)).unwrap_or_else(|_| {
                    tracing::error!("cycle callback panicked; cancelling it");
                    false
                });

                if again {
                    let next = {
                        let mut task = slot.lock();
                        task.expect_time = task.next_cycle(now);
                        task.callback = Some(Callback::Repeat(f));
                        task.expect_time
                    };
                    self.heap.lock().push(next, slot);
                    return;
                }
            }
        }

        self.recycle(slot);
    }

    fn arm(&self, deadline: Deadline) {
        if let Err(err) = self.poller.arm(deadline) {
            tracing::warn!(%err, "failed to re-arm OS timer; relying on the poll interval");
        }
    }

    fn recycle(&self, slot: Arc<TimerSlot>) {
        slot.lock().reset();
        self.pool.recycle(slot);
    }

    fn discard_pending(&self) {
        let pending: Vec<_> = self.heap.lock().drain().map(|entry| entry.slot).collect();
        let mut discarded = pending.len();

        for slot in pending {
            self.recycle(slot);
        }
        while let Some(slot) = self.submissions.pop() {
            discarded += 1;
            self.recycle(slot);
        }

        if let Err(err) = self.poller.disarm() {
            tracing::debug!(%err, "failed to disarm OS timer");
        }
        if discarded > 0 {
            tracing::debug!(discarded, "discarded pending timer tasks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn schedule_fires_without_completion() {
        let timer = TimerController::new();
        timer.init().unwrap();

        let (tx, rx) = mpsc::channel();
        timer.schedule(10, move || tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(timer.pending(), 0);

        assert!(matches!(
            timer.schedule(-5, || ()),
            Err(TimerError::NegativeDelay(-5))
        ));

        timer.stop();
        assert!(matches!(timer.schedule(0, || ()), Err(TimerError::Stopped)));
    }

    #[test]
    fn stop_drops_scheduled_callbacks() {
        let timer = TimerController::new();
        timer.init().unwrap();

        let (tx, rx) = mpsc::channel::<()>();
        timer
            .schedule(5_000, move || {
                let _ = tx.send(());
            })
            .unwrap();

        timer.stop();
        assert!(matches!(rx.recv(), Err(mpsc::RecvError)), "Discarded callback must drop its captures");
    }
}
