//! Exchange and queue bookkeeping
//!
//! An `Exchange` is a fanout router: it holds the names of the queues bound
//! to it and every publish is copied to each of them. A `Queue` holds its
//! ready messages in FIFO order and the tags of the consumers competing for
//! them. Duplicate bindings and duplicate consumer registrations are no-ops.
//!
//! Concurrency note: callers must synchronize access (the broker lock).

use std::collections::{BTreeSet, VecDeque};

use crate::broker::engine::ConsumerTag;
use crate::broker::message::Message;

#[derive(Debug, Default)]
pub struct Exchange {
    pub name: String,
    pub durable: bool,
    pub bindings: BTreeSet<String>,
}

impl Exchange {
    /// Create a new exchange with no bound queues.
    pub fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            bindings: BTreeSet::new(),
        }
    }

    /// Bind a queue. Returns false if it was already bound.
    pub fn bind(&mut self, queue: &str) -> bool {
        self.bindings.insert(queue.to_string())
    }

    pub fn unbind(&mut self, queue: &str) -> bool {
        self.bindings.remove(queue)
    }
}

/// A message waiting in a queue. `store_key` is set when a durable queue has
/// written it to persistence.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub store_key: Option<u64>,
    pub message: Message,
    pub redelivered: bool,
}

#[derive(Debug, Default)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub messages: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerTag>,
    cursor: usize,
}

impl Queue {
    pub fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    /// Register a competing consumer. Duplicate adds are ignored.
    pub fn add_consumer(&mut self, tag: &str) {
        if !self.consumers.iter().any(|c| c == tag) {
            self.consumers.push(tag.to_string());
        }
    }

    pub fn remove_consumer(&mut self, tag: &str) {
        self.consumers.retain(|c| c != tag);
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }
    }

    /// Consumers in round-robin order, starting with the one whose turn it is.
    pub fn consumer_rotation(&self) -> Vec<ConsumerTag> {
        let n = self.consumers.len();
        (0..n)
            .map(|i| self.consumers[(self.cursor + i) % n].clone())
            .collect()
    }

    /// Move the round-robin cursor past `tag` after it received a message.
    pub fn advance_past(&mut self, tag: &str) {
        if let Some(pos) = self.consumers.iter().position(|c| c == tag) {
            self.cursor = (pos + 1) % self.consumers.len();
        }
    }

    /// Put messages back at the head of the queue, preserving their order.
    pub fn requeue_front(&mut self, entries: Vec<QueuedMessage>) {
        for mut entry in entries.into_iter().rev() {
            entry.redelivered = true;
            self.messages.push_front(entry);
        }
    }
}
