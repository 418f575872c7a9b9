//! Task queues
//!
//! - [`Task`]: a unit of work with an identity used for coalescing
//! - [`QueueService`]: named FIFO queues, one worker each
//! - [`WaitGroup`]: barrier over a set of enqueued tasks

mod service;
mod task;

pub use service::{QueueDump, QueueService, backoff};
pub use task::{EnqueueOptions, OnDone, Task, WaitGroup};
