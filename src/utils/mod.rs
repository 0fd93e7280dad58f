//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `popqueue` crate: the shared error type,
//! logging initialisation and throughput reporting.

pub mod error;
pub mod logging;
pub mod throughput;

pub use error::{QueueError, QueueResult};
