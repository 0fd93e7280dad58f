//! Single-slot handoff between broker delivery callbacks and the consumer
//! thread.
//!
//! A callback `offer`s its delivery. If the slot is already occupied the
//! delivery is handed back so the callback can reject it with requeue.
//! Only one thread may `wait` at a time.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::broker::Delivery;
use crate::queue::priority::PriorityLevel;
use crate::utils::error::{QueueError, QueueResult};

#[derive(Debug)]
struct Pending {
    priority: PriorityLevel,
    delivery: Delivery,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Pending>,
    waiter: Option<ThreadId>,
    closed: bool,
}

impl Slot {
    fn take(&mut self, priority: Option<PriorityLevel>) -> Option<(PriorityLevel, Delivery)> {
        let matches = self
            .pending
            .as_ref()
            .is_some_and(|p| priority.is_none_or(|wanted| wanted == p.priority));
        if !matches {
            return None;
        }
        self.pending.take().map(|p| (p.priority, p.delivery))
    }
}

#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Slot>,
    filled: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a delivery. Returns it back if the slot is occupied or the
    /// mailbox is closed.
    pub fn offer(&self, priority: PriorityLevel, delivery: Delivery) -> Result<(), Delivery> {
        let mut slot = self.lock();
        if slot.closed || slot.pending.is_some() {
            return Err(delivery);
        }
        slot.pending = Some(Pending { priority, delivery });
        self.filled.notify_all();
        Ok(())
    }

    /// Priority of the held delivery, if any.
    pub fn peek_priority(&self) -> Option<PriorityLevel> {
        self.lock().pending.as_ref().map(|p| p.priority)
    }

    /// Take the held delivery if it matches `priority` (`None` matches any).
    pub fn take(&self, priority: Option<PriorityLevel>) -> Option<(PriorityLevel, Delivery)> {
        self.lock().take(priority)
    }

    /// Block until a delivery arrives or the mailbox is closed.
    pub fn wait(&self) -> QueueResult<(PriorityLevel, Delivery)> {
        let mut slot = self.lock();
        if let Some(owner) = slot.waiter {
            return Err(QueueError::ContractViolation(format!(
                "mailbox already has a blocked waiter ({owner:?})"
            )));
        }
        slot.waiter = Some(thread::current().id());

        let result = loop {
            if let Some(taken) = slot.take(None) {
                break Ok(taken);
            }
            if slot.closed {
                break Err(QueueError::Shutdown);
            }
            slot = self.filled.wait(slot).unwrap_or_else(PoisonError::into_inner);
        };

        slot.waiter = None;
        result
    }

    /// Refuse further offers and wake a blocked waiter. A delivery already
    /// held can still be taken.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        self.filled.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
