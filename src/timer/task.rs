//! Deadlines and the scheduling record owned by the timer engine.

use std::mem::MaybeUninit;
use std::time::Duration;

use crate::sync::Spinlock;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// An absolute point on the monotonic clock.
///
/// Ordered by whole seconds first, then by the sub-second remainder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    secs: i64,
    nanos: i64,
}

impl Deadline {
    /// The current monotonic time.
    pub fn now() -> Self {
        let mut ts = MaybeUninit::<libc::timespec>::uninit();
        // SAFETY: CLOCK_MONOTONIC is always available and `ts` is writable.
        let ts = unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
            ts.assume_init()
        };

        Self::from_timespec(ts)
    }

    pub(crate) fn from_timespec(ts: libc::timespec) -> Self {
        Self::normalized(ts.tv_sec as i64, ts.tv_nsec as i64)
    }

    fn normalized(secs: i64, nanos: i64) -> Self {
        Self {
            secs: secs + nanos.div_euclid(NANOS_PER_SEC),
            nanos: nanos.rem_euclid(NANOS_PER_SEC),
        }
    }

    /// This deadline shifted by `ms` milliseconds.
    pub fn after_millis(self, ms: i64) -> Self {
        Self::normalized(
            self.secs + ms / 1000,
            self.nanos + (ms % 1000) * NANOS_PER_MILLI,
        )
    }

    /// This deadline shifted forward by `duration`.
    pub fn after(self, duration: Duration) -> Self {
        Self::normalized(
            self.secs + duration.as_secs() as i64,
            self.nanos + i64::from(duration.subsec_nanos()),
        )
    }

    /// Whole seconds on the monotonic clock.
    pub fn secs(&self) -> i64 {
        self.secs
    }

    /// Nanoseconds past [`Deadline::secs`], always below one second.
    pub fn subsec_nanos(&self) -> i64 {
        self.nanos
    }

    /// Time from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Deadline) -> Duration {
        if *self <= earlier {
            return Duration::ZERO;
        }

        let nanos = (self.secs - earlier.secs) * NANOS_PER_SEC + (self.nanos - earlier.nanos);
        Duration::from_nanos(nanos as u64)
    }

    pub(crate) fn as_timespec(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.secs as libc::time_t,
            tv_nsec: self.nanos as _,
        }
    }
}

pub(crate) enum Callback {
    Once(Box<dyn FnOnce() + Send>),
    /// Returns whether the timer should fire again.
    Repeat(Box<dyn FnMut() -> bool + Send>),
}

/// A pending delay or cycle.
#[derive(Default)]
pub(crate) struct TimerTask {
    pub(crate) interval: i64,
    pub(crate) create_time: Deadline,
    pub(crate) expect_time: Deadline,
    pub(crate) callback: Option<Callback>,
}

impl TimerTask {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// The next deadline of a cycle that just fired at `now`.
    pub(crate) fn next_cycle(&self, now: Deadline) -> Deadline {
        let next = self.expect_time.after_millis(self.interval);
        if next > now {
            next
        } else {
            now.after_millis(self.interval)
        }
    }
}

/// The pooled unit: the timer thread and submitters meet on this lock.
pub(crate) type TimerSlot = Spinlock<TimerTask>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_carry_into_seconds() {
        let base = Deadline::normalized(10, 900_000_000);
        let later = base.after_millis(250);

        assert_eq!(later.secs(), 11);
        assert_eq!(later.subsec_nanos(), 150_000_000);
        assert_eq!(
            later.saturating_duration_since(base),
            Duration::from_millis(250)
        );
        assert_eq!(base.saturating_duration_since(later), Duration::ZERO);
    }

    #[test]
    fn seconds_dominate_ordering() {
        let a = Deadline::normalized(1, 999_999_999);
        let b = Deadline::normalized(2, 0);
        assert!(a < b);
        assert!(Deadline::normalized(2, 1) > b);
    }

    #[test]
    fn lagging_cycle_restarts_from_now() {
        let mut task = TimerTask {
            interval: 100,
            expect_time: Deadline::normalized(5, 0),
            ..TimerTask::default()
        };
        let now = Deadline::normalized(5, 50_000_000);
        assert_eq!(task.next_cycle(now), Deadline::normalized(5, 100_000_000));

        task.expect_time = Deadline::normalized(4, 0);
        assert_eq!(task.next_cycle(now), Deadline::normalized(5, 150_000_000));
    }
}
