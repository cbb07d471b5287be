//! Job queue feeding the worker threads.
//!
//! A FIFO channel shared by every worker, with an optional capacity enforced
//! on regular submissions and a shutdown flag that rejects new work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};

use crate::error::SubmitError;

/// A unit of work executed by a worker thread.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Message {
    Run(Job),
    Stop,
}

pub(crate) struct JobQueue {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    pending: AtomicUsize,
    capacity: Option<usize>,
    shutdown: AtomicBool,
}

impl JobQueue {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();

        Self {
            sender,
            receiver,
            pending: AtomicUsize::new(0),
            capacity,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueues a job, refusing it when the queue is at capacity.
    pub(crate) fn push(&self, job: Job) -> Result<(), SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::ShutDown);
        }

        if let Some(capacity) = self.capacity {
            self.pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                    (pending < capacity).then_some(pending + 1)
                })
                .map_err(|_| SubmitError::Full { capacity })?;
        } else {
            self.pending.fetch_add(1, Ordering::AcqRel);
        }

        self.send(Message::Run(job))
    }

    /// Enqueues a job regardless of capacity.
    pub(crate) fn push_unbounded(&self, job: Job) -> Result<(), SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::ShutDown);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.send(Message::Run(job))
    }

    /// Queues one stop marker; the worker that receives it exits.
    pub(crate) fn push_stop(&self) {
        let _ = self.sender.send(Message::Stop);
    }

    fn send(&self, message: Message) -> Result<(), SubmitError> {
        // The queue owns a receiver, so the channel never disconnects.
        self.sender.send(message).map_err(|_| SubmitError::ShutDown)
    }

    /// Blocks until a job is available. Returns `None` on a stop marker.
    pub(crate) fn pop(&self) -> Option<Job> {
        match self.receiver.recv() {
            Ok(Message::Run(job)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Some(job)
            }
            Ok(Message::Stop) | Err(_) => None,
        }
    }

    /// Number of jobs waiting for a worker.
    pub(crate) fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Rejects all further submissions.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_limits_regular_pushes_only() {
        let queue = JobQueue::new(Some(1));

        assert!(queue.push(Box::new(|| {})).is_ok());
        assert_eq!(
            queue.push(Box::new(|| {})),
            Err(SubmitError::Full { capacity: 1 })
        );
        assert!(queue.push_unbounded(Box::new(|| {})).is_ok());
        assert_eq!(queue.len(), 2);

        assert!(queue.pop().is_some());
        assert!(queue.push(Box::new(|| {})).is_err());
        assert!(queue.pop().is_some());
        assert!(queue.push(Box::new(|| {})).is_ok());
    }

    #[test]
    fn shutdown_rejects_and_stop_ends_pop() {
        let queue = JobQueue::new(None);
        queue.push_stop();
        assert!(queue.pop().is_none());

        queue.shutdown();
        assert_eq!(queue.push(Box::new(|| {})), Err(SubmitError::ShutDown));
        assert_eq!(queue.push_unbounded(Box::new(|| {})), Err(SubmitError::ShutDown));
    }
}
