//! # Task Scheduling
//!
//! A bounded FIFO of tasks and the pool of OS threads that drains it.
//!
//! ```text
//!   submitters ──> [BoundedQueue<Task>] ──> worker-0 .. worker-N
//! ```
//!
//! The queue never blocks. Workers park on a condvar while it is empty;
//! submitters yield while it is full.

mod ring;
mod worker;

pub(crate) use worker::available_parallelism;
pub use ring::BoundedQueue;
pub use worker::{Task, WorkerPool, WorkerState};
