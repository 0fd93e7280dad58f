//! # PopQueue
//!
//! `popqueue` is a priority-tiered, deferrable work queue built on a small
//! in-process message broker. Producers publish work with a priority and a
//! run time; a single consumer thread pops the highest-priority ready work,
//! blocking only when nothing is ready anywhere.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: Fanout exchanges, competing-consumer queues, channels, acknowledgments.
//! - `config`: Handles loading and managing configuration.
//! - `persistence`: Stores durable broker state in `sled`.
//! - `queue`: The priority dispatcher, deferred promoter and `QueueManager` facade.
//! - `utils`: Shared error type, logging and throughput reporting.
//! - `worker`: Job backend interface and the worker loop that runs jobs off the queue.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod queue;
pub mod utils;
pub mod worker;

pub use broker::Connection;
pub use queue::{PriorityLevel, QueueManager, WorkItem};
pub use utils::error::{QueueError, QueueResult};
