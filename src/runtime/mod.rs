//! Worker threads executing task bodies and timeout handlers.

pub(crate) mod queue;
mod worker;

pub use worker::WorkerPool;
