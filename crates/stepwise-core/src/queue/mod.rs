//! Named job queues over a durable [`JobStore`](crate::repository::JobStore).
//!
//! `QueueManager` owns every job from enqueue to a terminal state. One
//! semaphore-bounded dispatcher loop per queue claims ready jobs and hands
//! them to a [`JobDispatcher`] (the processor registry in production).

pub mod manager;
pub mod worker;

pub use manager::{QueueError, QueueManager};
pub use worker::{JobContext, JobDispatcher};
