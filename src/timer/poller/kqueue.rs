use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::time::Duration;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_ONESHOT, EVFILT_TIMER, EVFILT_USER, NOTE_NSECONDS,
    NOTE_TRIGGER, kevent, kqueue,
};

use super::{Readiness, Signal, cvt};
use crate::timer::task::Deadline;

const SUBMIT_IDENT: usize = 1;
const STOP_IDENT: usize = 2;
const TIMER_IDENT: usize = 3;

/// Buffer of ready events filled by [`Poller::wait`].
pub(crate) struct Events(Vec<kevent>);

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity.max(3)))
    }
}

pub(crate) struct Poller {
    kqueue: OwnedFd,
}

fn change(ident: usize, filter: i16, flags: u16, fflags: u32, data: isize) -> kevent {
    kevent {
        ident,
        filter,
        flags,
        fflags,
        data,
        udata: ptr::null_mut(),
    }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall; the descriptor is owned from here on.
        let kqueue = unsafe { OwnedFd::from_raw_fd(cvt(kqueue())?) };
        let poller = Self { kqueue };

        for ident in [SUBMIT_IDENT, STOP_IDENT] {
            poller.apply(change(
                ident,
                EVFILT_USER,
                EV_ADD | EV_ENABLE | EV_CLEAR,
                0,
                0,
            ))?;
        }

        Ok(poller)
    }

    fn apply(&self, event: kevent) -> io::Result<()> {
        // SAFETY: submits one change and requests no events back.
        cvt(unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                &event,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })?;
        Ok(())
    }

    /// Arms the OS timer to fire once at `deadline`, replacing any earlier arming.
    pub(crate) fn arm(&self, deadline: Deadline) -> io::Result<()> {
        let delay = deadline.saturating_duration_since(Deadline::now());
        let nanos = delay.as_nanos().clamp(1, isize::MAX as u128) as isize;

        self.apply(change(
            TIMER_IDENT,
            EVFILT_TIMER,
            EV_ADD | EV_ENABLE | EV_ONESHOT,
            NOTE_NSECONDS,
            nanos,
        ))
    }

    pub(crate) fn disarm(&self) -> io::Result<()> {
        match self.apply(change(TIMER_IDENT, EVFILT_TIMER, EV_DELETE, 0, 0)) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    /// Wakes the thread blocked in [`Poller::wait`].
    pub(crate) fn notify(&self, signal: Signal) -> io::Result<()> {
        let ident = match signal {
            Signal::Submit => SUBMIT_IDENT,
            Signal::Stop => STOP_IDENT,
        };

        self.apply(change(ident, EVFILT_USER, 0, NOTE_TRIGGER, 0))
    }

    /// Blocks until a wake signal, a timer expiry, or `timeout` elapses.
    pub(crate) fn wait(&self, events: &mut Events, timeout: Duration) -> io::Result<Readiness> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: i64::from(timeout.subsec_nanos()),
        };
        let capacity = events.0.capacity();
        events.0.clear();

        // SAFETY: the buffer has room for `capacity` entries.
        let count = unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                events.0.as_mut_ptr(),
                capacity as i32,
                &ts,
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
            match (event.filter, event.ident) {
                (EVFILT_USER, STOP_IDENT) => readiness.stop = true,
                (EVFILT_USER, SUBMIT_IDENT) => readiness.submitted = true,
                (EVFILT_TIMER, TIMER_IDENT) => readiness.expired = true,
                _ => {}
            }
        }

        Ok(readiness)
    }
}
