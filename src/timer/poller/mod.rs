//! Readiness notification for the timer thread.
//!
//! A [`Poller`] bundles three kernel objects: a wait set, a one-shot timer
//! armed to an absolute [`Deadline`](crate::timer::Deadline), and a wake
//! channel that other threads signal with [`Signal::Submit`] or
//! [`Signal::Stop`]. The timer thread blocks in [`Poller::wait`] until either
//! side becomes ready or the liveness timeout elapses.
//!
//! - Linux: epoll + timerfd + eventfd ([`epoll`])
//! - macOS: kqueue with `EVFILT_TIMER` and `EVFILT_USER` ([`kqueue`])

use std::io;
use std::os::raw::c_int;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::{Events, Poller};

#[cfg(target_os = "macos")]
mod kqueue;
#[cfg(target_os = "macos")]
pub(crate) use kqueue::{Events, Poller};

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("the timer poller supports Linux (epoll) and macOS (kqueue) only");

/// What the timer thread is being woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Submit,
    Stop,
}

/// The outcome of one [`Poller::wait`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) submitted: bool,
    pub(crate) expired: bool,
    pub(crate) stop: bool,
}

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
