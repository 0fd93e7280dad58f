//! Priority dispatcher
//!
//! Owns one durable fanout exchange and one durable competing-consumer
//! queue per priority, plus two channels:
//! - a publisher channel for `publish_immediate`
//! - a consumer channel with prefetch 1 used both for polling and for the
//!   short-lived subscriptions of `subscribe_and_wait`
//!
//! Async deliveries land in a single-slot `Mailbox`. A delivery that finds
//! the slot occupied is rejected with requeue, so a ready message is always
//! either on its queue or in the mailbox, never in both.
//!
//! Bodies that fail to decode are acknowledged and dropped with a warning
//! wherever they are found.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Channel, ConsumerTag, Connection, Delivery};
use crate::queue::mailbox::Mailbox;
use crate::queue::priority::PriorityLevel;
use crate::queue::work::{AckHandle, WorkEnvelope, WorkItem};
use crate::queue::{balance_queue, work_exchange};
use crate::utils::error::{QueueError, QueueResult};

pub struct PriorityDispatcher {
    prefix: String,
    publisher: Channel,
    consumer: Channel,
    mailbox: Arc<Mailbox>,
}

impl PriorityDispatcher {
    /// Declare the per-priority exchanges and queues (idempotent) and open
    /// the dispatcher's channels.
    pub fn new(connection: &Connection, prefix: &str) -> QueueResult<Self> {
        let publisher = connection.create_channel()?;
        let consumer = connection.create_channel()?;
        consumer.set_prefetch(1)?;

        for priority in PriorityLevel::ALL {
            let exchange = work_exchange(prefix, priority);
            let queue = balance_queue(prefix, priority);
            publisher.declare_exchange(&exchange, true)?;
            publisher.declare_queue(&queue, true)?;
            publisher.bind_queue(&queue, &exchange)?;
        }
        info!(prefix, "priority queues declared");

        Ok(Self {
            prefix: prefix.to_string(),
            publisher,
            consumer,
            mailbox: Arc::new(Mailbox::new()),
        })
    }

    pub fn publish_immediate(&self, envelope: &WorkEnvelope) -> QueueResult<()> {
        let exchange = work_exchange(&self.prefix, envelope.priority);
        self.publisher
            .publish(&exchange, envelope.headers(), envelope.encode()?)?;
        debug!(exchange = %exchange, "published work");
        Ok(())
    }

    /// Non-blocking fetch from a single priority queue.
    pub fn poll_priority(&self, priority: PriorityLevel) -> QueueResult<Option<WorkItem>> {
        let queue = balance_queue(&self.prefix, priority);
        while let Some(delivery) = self.consumer.basic_get(&queue)? {
            if let Some(item) = self.decode_or_drop(&delivery, priority)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Fetch from HIGH, NORMAL, BULK in that order and return the first hit.
    pub fn poll_once(&self) -> QueueResult<Option<WorkItem>> {
        for priority in PriorityLevel::ALL {
            if let Some(item) = self.poll_priority(priority)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Take the mailbox content if it matches `priority` (`None` = any).
    pub fn take_mailbox(&self, priority: Option<PriorityLevel>) -> QueueResult<Option<WorkItem>> {
        while let Some((found, delivery)) = self.mailbox.take(priority) {
            if let Some(item) = self.decode_or_drop(&delivery, found)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    pub fn mailbox_priority(&self) -> Option<PriorityLevel> {
        self.mailbox.peek_priority()
    }

    /// Subscribe to all three queues, block until one delivery arrives and
    /// cancel the subscriptions again. Whichever message arrives first wins,
    /// so callers poll before blocking.
    pub fn subscribe_and_wait(&self) -> QueueResult<WorkItem> {
        let mut tags = Vec::with_capacity(PriorityLevel::ALL.len());
        let result = self.wait_subscribed(&mut tags);

        for tag in &tags {
            if let Err(e) = self.consumer.cancel(tag) {
                debug!(consumer = %tag, error = %e, "failed to cancel subscription");
            }
        }
        result
    }

    fn wait_subscribed(&self, tags: &mut Vec<ConsumerTag>) -> QueueResult<WorkItem> {
        for priority in PriorityLevel::ALL {
            tags.push(self.subscribe(priority)?);
        }
        debug!(prefix = %self.prefix, "blocking for work");

        loop {
            let (priority, delivery) = self.mailbox.wait()?;
            if let Some(item) = self.decode_or_drop(&delivery, priority)? {
                return Ok(item);
            }
        }
    }

    fn subscribe(&self, priority: PriorityLevel) -> QueueResult<ConsumerTag> {
        let mailbox = Arc::clone(&self.mailbox);
        let channel = self.consumer.handle();
        self.consumer
            .consume(&balance_queue(&self.prefix, priority), move |delivery| {
                if let Err(delivery) = mailbox.offer(priority, delivery) {
                    debug!(
                        delivery_tag = delivery.delivery_tag,
                        %priority,
                        "mailbox occupied, requeueing delivery"
                    );
                    if let Err(e) = channel.reject(delivery.delivery_tag, true) {
                        warn!(delivery_tag = delivery.delivery_tag, error = %e, "failed to requeue delivery");
                    }
                }
            })
    }

    /// Acknowledge a handle produced by this dispatcher.
    pub fn ack(&self, handle: AckHandle) -> QueueResult<()> {
        self.check_owner(handle)?;
        self.consumer.ack(handle.delivery_tag)
    }

    /// Return unfinished work to the head of its queue, flagged redelivered.
    pub fn release(&self, handle: AckHandle) -> QueueResult<()> {
        self.check_owner(handle)?;
        self.consumer.reject(handle.delivery_tag, true)
    }

    /// Deliveries taken through this dispatcher and not yet settled.
    pub fn unacked_len(&self) -> usize {
        self.consumer.unacked_count()
    }

    fn check_owner(&self, handle: AckHandle) -> QueueResult<()> {
        if handle.channel != self.consumer.id() {
            return Err(QueueError::ContractViolation(format!(
                "ack handle belongs to channel {}, not this queue manager's channel {}",
                handle.channel,
                self.consumer.id()
            )));
        }
        Ok(())
    }

    /// Drop all ready messages from the three queues and the mailbox.
    pub fn purge(&self) -> QueueResult<usize> {
        let mut purged = 0;
        for priority in PriorityLevel::ALL {
            purged += self
                .publisher
                .purge_queue(&balance_queue(&self.prefix, priority))?;
        }
        if let Some((_, delivery)) = self.mailbox.take(None) {
            self.consumer.ack(delivery.delivery_tag)?;
            purged += 1;
        }
        Ok(purged)
    }

    /// Ready messages across the three queues.
    pub fn ready_len(&self) -> QueueResult<usize> {
        let mut total = 0;
        for priority in PriorityLevel::ALL {
            total += self
                .publisher
                .queue_len(&balance_queue(&self.prefix, priority))?;
        }
        Ok(total)
    }

    /// Wake a thread blocked in `subscribe_and_wait` with `QueueError::Shutdown`.
    pub fn close_mailbox(&self) {
        self.mailbox.close();
    }

    fn decode_or_drop(&self, delivery: &Delivery, priority: PriorityLevel) -> QueueResult<Option<WorkItem>> {
        match WorkItem::from_delivery(delivery, priority) {
            Ok(item) => Ok(Some(item)),
            Err(e) => {
                warn!(
                    queue = %delivery.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "dropping malformed message"
                );
                self.consumer.ack(delivery.delivery_tag)?;
                Ok(None)
            }
        }
    }
}
