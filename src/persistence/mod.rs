//! The `persistence` module stores durable broker state.
//!
//! Durable exchanges, durable queues and the messages routed to durable
//! queues are written to `sled`, an embedded key-value store, so that a
//! restarted broker finds its topology again and redelivers work that was
//! never acknowledged.

pub mod sled_store;

pub use sled_store::{ExchangeRecord, Persistence};

#[cfg(test)]
mod tests;
