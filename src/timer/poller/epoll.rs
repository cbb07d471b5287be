use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{
    CLOCK_MONOTONIC, EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLLIN,
    TFD_CLOEXEC, TFD_NONBLOCK, TFD_TIMER_ABSTIME, epoll_create1, epoll_ctl, epoll_event,
    epoll_wait, eventfd, itimerspec, timerfd_create, timerfd_settime,
};

use super::{Readiness, Signal, cvt};
use crate::timer::task::Deadline;

const WAKE_TOKEN: u64 = 1;
const TIMER_TOKEN: u64 = 2;

// Written to the eventfd. The counter sums pending writes, so any read of at
// least STOP means a stop request arrived, whatever else was queued with it.
const SUBMIT: u64 = 1;
const STOP: u64 = 1 << 32;

/// Buffer of ready events filled by [`Poller::wait`].
pub(crate) struct Events(Vec<epoll_event>);

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity.max(2)))
    }
}

pub(crate) struct Poller {
    epoll: OwnedFd,
    wake: OwnedFd,
    timer: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscalls; each returned descriptor is owned from here on.
        let (epoll, wake, timer) = unsafe {
            let epoll = OwnedFd::from_raw_fd(cvt(epoll_create1(EPOLL_CLOEXEC))?);
            let wake = OwnedFd::from_raw_fd(cvt(eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC))?);
            let timer = OwnedFd::from_raw_fd(cvt(timerfd_create(
                CLOCK_MONOTONIC,
                TFD_NONBLOCK | TFD_CLOEXEC,
            ))?);
            (epoll, wake, timer)
        };

        let poller = Self { epoll, wake, timer };
        poller.add(poller.wake.as_raw_fd(), WAKE_TOKEN)?;
        poller.add(poller.timer.as_raw_fd(), TIMER_TOKEN)?;

        Ok(poller)
    }

    fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: both descriptors are open and `event` outlives the call.
        cvt(unsafe { epoll_ctl(self.epoll.as_raw_fd(), EPOLL_CTL_ADD, fd, &mut event) })?;
        Ok(())
    }

    /// Arms the OS timer to fire once at `deadline`, replacing any earlier arming.
    pub(crate) fn arm(&self, deadline: Deadline) -> io::Result<()> {
        let mut value = deadline.as_timespec();
        // An all-zero it_value would disarm instead of firing.
        if value.tv_sec == 0 && value.tv_nsec == 0 {
            value.tv_nsec = 1;
        }
        self.settime(value, TFD_TIMER_ABSTIME)
    }

    pub(crate) fn disarm(&self) -> io::Result<()> {
        self.settime(libc::timespec { tv_sec: 0, tv_nsec: 0 }, 0)
    }

    fn settime(&self, value: libc::timespec, flags: i32) -> io::Result<()> {
        let spec = itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        // SAFETY: `spec` is a valid itimerspec; the old value is not requested.
        cvt(unsafe { timerfd_settime(self.timer.as_raw_fd(), flags, &spec, ptr::null_mut()) })?;
        Ok(())
    }

    /// Wakes the thread blocked in [`Poller::wait`].
    pub(crate) fn notify(&self, signal: Signal) -> io::Result<()> {
        let value = match signal {
            Signal::Submit => SUBMIT,
            Signal::Stop => STOP,
        };

        // SAFETY: writes exactly eight bytes from a live u64.
        let written = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                (&value as *const u64).cast(),
                mem::size_of::<u64>(),
            )
        };

        if written < 0 {
            let err = io::Error::last_os_error();
            // A saturated counter already guarantees a pending wake-up.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Blocks until a wake signal, a timer expiry, or `timeout` elapses.
    pub(crate) fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<Readiness> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let capacity = events.0.capacity();
        events.0.clear();

        // SAFETY: the buffer has room for `capacity` entries.
        let count = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                events.0.as_mut_ptr(),
                capacity as i32,
                timeout_ms,
            )
        };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        // SAFETY: the kernel initialised the first `count` entries.
        unsafe { events.0.set_len(count as usize) };

        let mut readiness = Readiness::default();
        for event in &events.0 {
            let token = event.u64;
            match token {
                WAKE_TOKEN => {
                    let value = read_counter(&self.wake)?;
                    if value >= STOP {
                        readiness.stop = true;
                    } else if value > 0 {
                        readiness.submitted = true;
                    }
                }
                TIMER_TOKEN => {
                    read_counter(&self.timer)?;
                    readiness.expired = true;
                }
                _ => {}
            }
        }

        Ok(readiness)
    }
}

// Reads and resets an eventfd/timerfd counter; zero if nothing was pending.
fn read_counter(fd: &OwnedFd) -> io::Result<u64> {
    let mut value: u64 = 0;
    // SAFETY: reads exactly eight bytes into a live u64.
    let read = unsafe {
        libc::read(
            fd.as_raw_fd(),
            (&mut value as *mut u64).cast(),
            mem::size_of::<u64>(),
        )
    };

    if read < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }

    Ok(value)
}
