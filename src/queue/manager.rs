//! Queue manager facade
//!
//! `QueueManager` ties a `PriorityDispatcher` and a `DeferredPromoter` to one
//! injected `Connection`. Any number of threads may `publish`; exactly one
//! thread at a time may be inside `pop` or `try_pop`.
//!
//! `pop` merges the mailbox and the queues in strict priority order:
//! 1. mailbox holds HIGH work -> take it
//! 2. poll HIGH
//! 3. mailbox holds NORMAL work -> take it
//! 4. poll NORMAL
//! 5. block: take whatever the mailbox holds, else subscribe to all three
//!    queues and wait for the first delivery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::Connection;
use crate::config::QueueSettings;
use crate::queue::dispatcher::PriorityDispatcher;
use crate::queue::priority::PriorityLevel;
use crate::queue::promoter::DeferredPromoter;
use crate::queue::work::{WorkEnvelope, WorkItem};
use crate::utils::error::{QueueError, QueueResult};

/// What the consumer side of a `QueueManager` is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    BlockedWaiting,
    /// Idle, with an async delivery parked in the mailbox.
    HoldingMailbox,
}

/// Resets the consumer state to idle when a pop returns.
struct ConsumerGuard<'a> {
    state: &'a Mutex<ConsumerState>,
}

impl ConsumerGuard<'_> {
    fn set(&self, next: ConsumerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.set(ConsumerState::Idle);
    }
}

pub struct QueueManager {
    settings: QueueSettings,
    // Declared first so the promotion thread stops before the dispatcher's
    // channels close.
    promoter: DeferredPromoter,
    dispatcher: PriorityDispatcher,
    state: Mutex<ConsumerState>,
    shut_down: AtomicBool,
}

impl QueueManager {
    /// Set up (idempotently) the exchanges and queues for
    /// `settings.prefix` and start the deferred promoter. Managers with the
    /// same prefix share queues.
    pub fn new(connection: &Connection, settings: &QueueSettings) -> QueueResult<Self> {
        let dispatcher = PriorityDispatcher::new(connection, &settings.prefix)?;
        let promoter = DeferredPromoter::start(connection, settings)?;
        info!(prefix = %settings.prefix, "queue manager ready");

        Ok(Self {
            settings: settings.clone(),
            promoter,
            dispatcher,
            state: Mutex::new(ConsumerState::Idle),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.settings.prefix
    }

    /// Publish `work` to run at `run_at`. Work due now or in the past goes
    /// straight to its priority queue; later work is deferred.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        work: &T,
        priority: PriorityLevel,
        run_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let envelope = WorkEnvelope::new(serde_json::to_value(work)?, priority, run_at);
        if run_at <= Utc::now() {
            self.dispatcher.publish_immediate(&envelope)
        } else {
            self.promoter.defer(&envelope)
        }
    }

    pub fn publish_now<T: Serialize + ?Sized>(&self, work: &T, priority: PriorityLevel) -> QueueResult<()> {
        self.publish(work, priority, Utc::now())
    }

    /// Return the highest-priority ready work, blocking until some exists.
    pub fn pop(&self) -> QueueResult<WorkItem> {
        let guard = self.enter()?;

        for priority in [PriorityLevel::High, PriorityLevel::Normal] {
            if let Some(item) = self.dispatcher.take_mailbox(Some(priority))? {
                return Ok(item);
            }
            if let Some(item) = self.dispatcher.poll_priority(priority)? {
                return Ok(item);
            }
        }

        if let Some(item) = self.dispatcher.take_mailbox(None)? {
            return Ok(item);
        }

        guard.set(ConsumerState::BlockedWaiting);
        let item = self.dispatcher.subscribe_and_wait()?;
        debug!(priority = %item.priority(), "woken with work");
        Ok(item)
    }

    /// Like `pop`, but returns `None` instead of blocking.
    pub fn try_pop(&self) -> QueueResult<Option<WorkItem>> {
        let _guard = self.enter()?;

        for priority in PriorityLevel::ALL {
            if let Some(item) = self.dispatcher.take_mailbox(Some(priority))? {
                return Ok(Some(item));
            }
            if let Some(item) = self.dispatcher.poll_priority(priority)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Acknowledge popped work. The item must come from this manager.
    pub fn ack(&self, item: &WorkItem) -> QueueResult<()> {
        self.dispatcher.ack(item.ack_handle())
    }

    /// Hand popped work back without finishing it. It returns to the head
    /// of its queue and the next `pop` sees it with `redelivered` set.
    pub fn release(&self, item: &WorkItem) -> QueueResult<()> {
        debug!(priority = %item.priority(), "releasing popped work");
        self.dispatcher.release(item.ack_handle())
    }

    /// Deferred items waiting in memory for their run time.
    pub fn deferred_len(&self) -> usize {
        self.promoter.len()
    }

    /// Ready messages across the priority queues.
    pub fn ready_len(&self) -> QueueResult<usize> {
        self.dispatcher.ready_len()
    }

    /// Drop every pending message for this prefix, deferred ones included.
    pub fn purge(&self) -> QueueResult<usize> {
        let purged = self.dispatcher.purge()? + self.promoter.purge()?;
        info!(prefix = %self.settings.prefix, purged, "purged queues");
        Ok(purged)
    }

    pub fn consumer_state(&self) -> ConsumerState {
        let state = *self.lock_state();
        if state == ConsumerState::Idle && self.dispatcher.mailbox_priority().is_some() {
            ConsumerState::HoldingMailbox
        } else {
            state
        }
    }

    /// Stop the promoter and wake a blocked `pop` with `QueueError::Shutdown`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.promoter.shutdown();
        self.dispatcher.close_mailbox();
        let unsettled = self.dispatcher.unacked_len();
        if unsettled > 0 {
            warn!(prefix = %self.settings.prefix, unsettled, "unacknowledged work returns to its queues once the manager is dropped");
        }
        info!(prefix = %self.settings.prefix, "queue manager shut down");
    }

    fn lock_state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> QueueResult<ConsumerGuard<'_>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(QueueError::Shutdown);
        }

        let mut state = self.lock_state();
        if matches!(*state, ConsumerState::Polling | ConsumerState::BlockedWaiting) {
            warn!(state = ?*state, "concurrent pop rejected");
            return Err(QueueError::ContractViolation(
                "pop called while another thread is popping from this queue manager".into(),
            ));
        }
        *state = ConsumerState::Polling;
        Ok(ConsumerGuard { state: &self.state })
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
