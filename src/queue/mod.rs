//! The `queue` module is the priority-tiered, deferrable work queue.
//!
//! - `priority`: the three dispatch classes
//! - `work`: work items, ack handles and the JSON wire envelope
//! - `deferred_set`: time-ordered holding area for future work
//! - `mailbox`: single-slot handoff for async deliveries
//! - `dispatcher`: per-priority exchanges/queues, polling and blocking fetch
//! - `promoter`: moves matured deferred work onto the priority queues
//! - `manager`: the `QueueManager` facade
//!
//! Naming for a prefix `p`: priority exchanges `p.work.<priority>` each
//! bound to queue `p.balance.<priority>`, and the deferred exchange
//! `p.work.deferred` bound to queue `p.deferred`.

pub mod deferred_set;
pub mod dispatcher;
pub mod mailbox;
pub mod manager;
pub mod priority;
pub mod promoter;
pub mod work;

pub use deferred_set::{DeferredElement, DeferredSet};
pub use dispatcher::PriorityDispatcher;
pub use mailbox::Mailbox;
pub use manager::{ConsumerState, QueueManager};
pub use priority::PriorityLevel;
pub use promoter::{DeferredPromoter, DeferredWork};
pub use work::{AckHandle, WorkEnvelope, WorkItem};

pub fn work_exchange(prefix: &str, priority: PriorityLevel) -> String {
    format!("{prefix}.work.{priority}")
}

pub fn balance_queue(prefix: &str, priority: PriorityLevel) -> String {
    format!("{prefix}.balance.{priority}")
}

pub fn deferred_exchange(prefix: &str) -> String {
    format!("{prefix}.work.deferred")
}

pub fn deferred_queue(prefix: &str) -> String {
    format!("{prefix}.deferred")
}
