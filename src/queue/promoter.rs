//! Deferred promoter
//!
//! Work published with a future `run_at` goes to the deferred exchange. The
//! promoter consumes the deferred queue on its own channel with no prefetch
//! limit and parks every arrival in a `DeferredSet`, leaving the broker
//! message un-acknowledged. A dedicated thread waits on the set and, when an
//! element matures, acknowledges the deferred message and republishes the
//! work to the exchange of its original priority.
//!
//! Between those two steps there is a window where a crash loses the item
//! (`ack_first`) or duplicates it (`publish_first`); `QueueSettings::promotion`
//! picks which.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::broker::{Channel, ChannelHandle, ConsumerTag, Connection};
use crate::config::{PromotionOrder, QueueSettings};
use crate::queue::deferred_set::{DeferredElement, DeferredSet};
use crate::queue::work::{AckHandle, WorkEnvelope};
use crate::queue::{deferred_exchange, deferred_queue, work_exchange};
use crate::utils::error::QueueResult;

/// A deferred envelope together with the handle of its broker message.
#[derive(Debug, Clone)]
pub struct DeferredWork {
    pub envelope: WorkEnvelope,
    pub ack_handle: AckHandle,
}

/// State shared with the promotion thread.
pub(super) struct Promotion {
    pub(super) prefix: String,
    pub(super) channel: ChannelHandle,
    pub(super) set: Arc<DeferredSet<DeferredWork>>,
    pub(super) order: PromotionOrder,
    pub(super) poll: Duration,
    pub(super) running: Arc<AtomicBool>,
}

impl Promotion {
    fn run(self) {
        info!(prefix = %self.prefix, order = self.order.as_str(), "deferred promoter started");
        while self.running.load(Ordering::Acquire) {
            match self.set.take_next_ready_or_wait(self.poll) {
                Ok(Some(element)) => self.promote(element),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "deferred promoter cannot wait, stopping");
                    break;
                }
            }
        }
        info!(prefix = %self.prefix, "deferred promoter stopped");
    }

    pub(super) fn promote(&self, element: DeferredElement<DeferredWork>) {
        let work = element.item;
        let priority = work.envelope.priority;
        let tag = work.ack_handle.delivery_tag;

        match self.order {
            PromotionOrder::AckFirst => {
                if let Err(e) = self.channel.ack(tag) {
                    // The message stays with the broker and will come back.
                    warn!(delivery_tag = tag, error = %e, "could not ack matured deferred message, skipping");
                    return;
                }
                if let Err(e) = self.republish(&work.envelope) {
                    error!(%priority, error = %e, "deferred work lost: acked but not republished");
                    return;
                }
            }
            PromotionOrder::PublishFirst => {
                if let Err(e) = self.republish(&work.envelope) {
                    if e.is_closed() {
                        // Closing the channel already returned the message to the deferred queue.
                        error!(%priority, delivery_tag = tag, error = %e, "cannot republish deferred work, giving up");
                        return;
                    }
                    warn!(%priority, error = %e, "republish failed, will retry");
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(self.poll).unwrap_or(chrono::Duration::seconds(1));
                    self.set.insert(retry_at, work);
                    return;
                }
                if let Err(e) = self.channel.ack(tag) {
                    warn!(delivery_tag = tag, error = %e, "republished but ack failed, work may run twice");
                }
            }
        }
        debug!(%priority, run_at = %element.run_at, "promoted deferred work");
    }

    fn republish(&self, envelope: &WorkEnvelope) -> QueueResult<()> {
        self.channel.publish(
            &work_exchange(&self.prefix, envelope.priority),
            envelope.headers(),
            envelope.encode()?,
        )
    }
}

pub struct DeferredPromoter {
    prefix: String,
    channel: Channel,
    set: Arc<DeferredSet<DeferredWork>>,
    running: Arc<AtomicBool>,
    intake: Mutex<Option<ConsumerTag>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredPromoter {
    /// Declare the deferred exchange and queue, start the intake
    /// subscription and the promotion thread.
    pub fn start(connection: &Connection, settings: &QueueSettings) -> QueueResult<Self> {
        let prefix = settings.prefix.as_str();
        let channel = connection.create_channel()?;
        channel.set_prefetch(0)?;

        let exchange = deferred_exchange(prefix);
        let queue = deferred_queue(prefix);
        channel.declare_exchange(&exchange, true)?;
        channel.declare_queue(&queue, true)?;
        channel.bind_queue(&queue, &exchange)?;

        let set = Arc::new(DeferredSet::new());
        let running = Arc::new(AtomicBool::new(true));

        let intake_set = Arc::clone(&set);
        let intake_channel = channel.handle();
        let intake = channel.consume(&queue, move |delivery| {
            match WorkEnvelope::decode(delivery.payload()) {
                Ok(envelope) => {
                    debug!(run_at = %envelope.run_at(), priority = %envelope.priority, "deferred work received");
                    intake_set.insert(
                        envelope.run_at(),
                        DeferredWork {
                            envelope,
                            ack_handle: AckHandle::of(&delivery),
                        },
                    );
                }
                Err(e) => {
                    warn!(delivery_tag = delivery.delivery_tag, error = %e, "dropping malformed deferred message");
                    if let Err(e) = intake_channel.ack(delivery.delivery_tag) {
                        warn!(error = %e, "failed to ack malformed deferred message");
                    }
                }
            }
        })?;

        let promotion = Promotion {
            prefix: prefix.to_string(),
            channel: channel.handle(),
            set: Arc::clone(&set),
            order: settings.promotion,
            poll: settings.deferred_poll(),
            running: Arc::clone(&running),
        };
        let thread = thread::Builder::new()
            .name(format!("{prefix}-promoter"))
            .spawn(move || promotion.run())?;

        Ok(Self {
            prefix: prefix.to_string(),
            channel,
            set,
            running,
            intake: Mutex::new(Some(intake)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Publish an envelope to the deferred exchange.
    pub fn defer(&self, envelope: &WorkEnvelope) -> QueueResult<()> {
        self.channel.publish(
            &deferred_exchange(&self.prefix),
            envelope.headers(),
            envelope.encode()?,
        )?;
        debug!(run_at = %envelope.run_at(), priority = %envelope.priority, "deferred work published");
        Ok(())
    }

    /// Deferred items currently held in memory.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Drop every deferred item, both held in memory and still queued.
    pub fn purge(&self) -> QueueResult<usize> {
        let mut purged = self.channel.purge_queue(&deferred_queue(&self.prefix))?;
        for element in self.set.drain() {
            self.channel.ack(element.item.ack_handle.delivery_tag)?;
            purged += 1;
        }
        Ok(purged)
    }

    /// Stop the promotion thread and the intake subscription. Items still
    /// held return to the deferred queue when the channel closes.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.set.interrupt();

        let tag = self.intake.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tag) = tag {
            if let Err(e) = self.channel.cancel(&tag) {
                debug!(error = %e, "failed to cancel deferred intake");
            }
        }

        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(prefix = %self.prefix, "deferred promoter thread panicked");
            }
        }
    }
}

impl Drop for DeferredPromoter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
