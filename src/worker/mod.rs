//! The `worker` module runs jobs off the priority queue.
//!
//! Job records live in a `JobBackend`; the queue carries only job ids.

pub mod backend;
pub mod runner;

pub use backend::{InMemoryBackend, Job, JobBackend, JobRef};
pub use runner::{Outcome, WorkOffSummary, Worker, default_retry_delay};
