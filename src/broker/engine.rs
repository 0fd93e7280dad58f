//! Broker engine
//!
//! This module contains the in-process broker responsible for:
//! - managing fanout exchanges, competing-consumer queues and their bindings
//! - routing published messages to every bound queue
//! - handing messages to channels, either on request (`basic_get`) or by
//!   pushing them to registered consumers
//! - tracking un-acknowledged deliveries per channel and returning them to
//!   their queues when a channel closes or a delivery is rejected
//! - writing durable queues through the `Persistence` abstraction
//!
//! Concurrency and usage notes:
//! - The API here is synchronous and designed to be held behind a lock by
//!   `Connection`. Methods that can hand messages to consumers return the
//!   resulting `Dispatch` list instead of invoking callbacks, so callers run
//!   them after releasing the lock.
//! - A channel's prefetch limit caps how many consumer deliveries may be
//!   un-acknowledged on it at once (0 = unlimited). `basic_get` is not
//!   subject to the limit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::{Delivery, Headers, Message};
use crate::broker::queue::{Exchange, Queue, QueuedMessage};
use crate::persistence::{ExchangeRecord, Persistence};
use crate::utils::error::{QueueError, QueueResult};

pub type ChannelId = u64;
pub type DeliveryTag = u64;
pub type ConsumerTag = String;

/// Callback invoked with each message pushed to a consumer.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// A delivery the broker has committed to a consumer, waiting to be handed
/// to its callback outside the broker lock.
pub struct Dispatch {
    pub(crate) callback: DeliveryCallback,
    pub(crate) delivery: Delivery,
}

impl Dispatch {
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn run(self) {
        (self.callback)(self.delivery)
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

struct Consumer {
    queue: String,
    channel: ChannelId,
    callback: DeliveryCallback,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    entry: QueuedMessage,
    via_consumer: bool,
}

#[derive(Debug, Default)]
struct ChannelState {
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0
            || self.unacked.values().filter(|u| u.via_consumer).count()
                < usize::from(self.prefetch)
    }

    fn deliver(
        &mut self,
        channel: ChannelId,
        queue: &str,
        entry: QueuedMessage,
        via_consumer: bool,
    ) -> Delivery {
        self.next_tag += 1;
        let delivery = Delivery {
            channel,
            delivery_tag: self.next_tag,
            queue: queue.to_string(),
            redelivered: entry.redelivered,
            message: entry.message.clone(),
        };
        self.unacked.insert(
            self.next_tag,
            Unacked {
                queue: queue.to_string(),
                entry,
                via_consumer,
            },
        );
        delivery
    }
}

fn exchange_record(exchange: &Exchange) -> ExchangeRecord {
    ExchangeRecord {
        name: exchange.name.clone(),
        bindings: exchange.bindings.iter().cloned().collect(),
    }
}

/// The broker owns all exchanges, queues, channels and consumers.
pub struct Broker {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    channels: HashMap<ChannelId, ChannelState>,
    consumers: HashMap<ConsumerTag, Consumer>,
    next_channel: ChannelId,
    persistence: Option<Persistence>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// A purely in-memory broker. Durable declarations are accepted but
    /// nothing outlives the process.
    pub fn new() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            channels: HashMap::new(),
            consumers: HashMap::new(),
            next_channel: 0,
            persistence: None,
        }
    }

    /// A broker backed by `persistence`. Durable exchanges, durable queues
    /// and their stored messages are restored before this returns.
    pub fn with_persistence(persistence: Persistence) -> QueueResult<Self> {
        let mut broker = Self::new();

        for name in persistence.load_queue_names()? {
            let mut queue = Queue::new(&name, true);
            for (key, message) in persistence.load_messages(&name)? {
                queue.messages.push_back(QueuedMessage {
                    store_key: Some(key),
                    message,
                    redelivered: false,
                });
            }
            debug!(queue = %name, messages = queue.len(), "restored durable queue");
            broker.queues.insert(name, queue);
        }

        for record in persistence.load_exchanges()? {
            let mut exchange = Exchange::new(&record.name, true);
            for queue in &record.bindings {
                exchange.bind(queue);
            }
            broker.exchanges.insert(record.name, exchange);
        }

        broker.persistence = Some(persistence);
        Ok(broker)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Declare a fanout exchange. Re-declaring with the same durability is a
    /// no-op; a different durability is an error.
    pub fn declare_exchange(&mut self, name: &str, durable: bool) -> QueueResult<()> {
        if let Some(existing) = self.exchanges.get(name) {
            if existing.durable != durable {
                return Err(QueueError::InvalidArgument(format!(
                    "exchange '{name}' already declared with durable={}",
                    existing.durable
                )));
            }
            return Ok(());
        }

        let exchange = Exchange::new(name, durable);
        if let (Some(persistence), true) = (&self.persistence, durable) {
            persistence.save_exchange(&exchange_record(&exchange))?;
        }
        self.exchanges.insert(name.to_string(), exchange);
        debug!(exchange = name, durable, "declared exchange");
        Ok(())
    }

    /// Declare a queue. Same idempotency rules as exchanges.
    pub fn declare_queue(&mut self, name: &str, durable: bool) -> QueueResult<()> {
        if let Some(existing) = self.queues.get(name) {
            if existing.durable != durable {
                return Err(QueueError::InvalidArgument(format!(
                    "queue '{name}' already declared with durable={}",
                    existing.durable
                )));
            }
            return Ok(());
        }

        if let (Some(persistence), true) = (&self.persistence, durable) {
            persistence.save_queue(name)?;
        }
        self.queues.insert(name.to_string(), Queue::new(name, durable));
        debug!(queue = name, durable, "declared queue");
        Ok(())
    }

    pub fn bind_queue(&mut self, queue: &str, exchange: &str) -> QueueResult<()> {
        if !self.queues.contains_key(queue) {
            return Err(QueueError::UnknownQueue(queue.to_string()));
        }
        let ex = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| QueueError::UnknownExchange(exchange.to_string()))?;

        if ex.bind(queue) && ex.durable {
            if let Some(persistence) = &self.persistence {
                persistence.save_exchange(&exchange_record(ex))?;
            }
        }
        Ok(())
    }

    pub fn unbind_queue(&mut self, queue: &str, exchange: &str) -> QueueResult<()> {
        let ex = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| QueueError::UnknownExchange(exchange.to_string()))?;

        if ex.unbind(queue) && ex.durable {
            if let Some(persistence) = &self.persistence {
                persistence.save_exchange(&exchange_record(ex))?;
            }
        }
        Ok(())
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Number of ready (not yet delivered) messages in `queue`.
    pub fn queue_len(&self, queue: &str) -> QueueResult<usize> {
        self.queues
            .get(queue)
            .map(Queue::len)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    /// Drop every ready message in `queue`. Un-acknowledged deliveries are
    /// not affected.
    pub fn purge_queue(&mut self, queue: &str) -> QueueResult<usize> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let drained: Vec<QueuedMessage> = q.messages.drain(..).collect();

        if let Some(persistence) = &self.persistence {
            for key in drained.iter().filter_map(|entry| entry.store_key) {
                persistence.remove_message(queue, key)?;
            }
        }
        Ok(drained.len())
    }

    pub fn open_channel(&mut self) -> ChannelId {
        self.next_channel += 1;
        self.channels
            .insert(self.next_channel, ChannelState::default());
        self.next_channel
    }

    pub fn is_channel_open(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    pub fn set_prefetch(&mut self, channel: ChannelId, count: u16) -> QueueResult<Vec<Dispatch>> {
        self.channel_mut(channel)?.prefetch = count;
        Ok(self.dispatch_all())
    }

    pub fn unacked_count(&self, channel: ChannelId) -> usize {
        self.channels
            .get(&channel)
            .map(|state| state.unacked.len())
            .unwrap_or(0)
    }

    /// Close a channel: cancel its consumers and return its un-acknowledged
    /// messages to the head of their queues, flagged as redelivered.
    pub fn close_channel(&mut self, channel: ChannelId) -> Vec<Dispatch> {
        let Some(state) = self.channels.remove(&channel) else {
            return Vec::new();
        };

        let tags: Vec<ConsumerTag> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in &tags {
            self.cancel(tag);
        }

        let requeued = state.unacked.len();
        let mut returned: HashMap<String, Vec<QueuedMessage>> = HashMap::new();
        for (_, unacked) in state.unacked {
            returned.entry(unacked.queue).or_default().push(unacked.entry);
        }
        for (name, entries) in returned {
            match self.queues.get_mut(&name) {
                Some(queue) => queue.requeue_front(entries),
                None => warn!(queue = %name, "dropping unacknowledged messages for a missing queue"),
            }
        }

        if requeued > 0 {
            debug!(channel, requeued, "closed channel, requeued unacknowledged messages");
        }
        self.dispatch_all()
    }

    /// Publish to every queue bound to `exchange`.
    pub fn publish(
        &mut self,
        exchange: &str,
        headers: Headers,
        payload: impl Into<String>,
    ) -> QueueResult<Vec<Dispatch>> {
        let targets: Vec<String> = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| QueueError::UnknownExchange(exchange.to_string()))?
            .bindings
            .iter()
            .cloned()
            .collect();

        let message = Message::new(exchange, headers, payload);
        if targets.is_empty() {
            debug!(exchange, message_id = %message.message_id, "exchange has no bound queues, message dropped");
        }

        let mut dispatches = Vec::new();
        for name in targets {
            let Some(queue) = self.queues.get_mut(&name) else {
                warn!(exchange, queue = %name, "binding refers to a missing queue");
                continue;
            };
            let store_key = match (&self.persistence, queue.durable) {
                (Some(persistence), true) => Some(persistence.store_message(&name, &message)?),
                _ => None,
            };
            queue.messages.push_back(QueuedMessage {
                store_key,
                message: message.clone(),
                redelivered: false,
            });
            dispatches.extend(self.dispatch(&name));
        }
        Ok(dispatches)
    }

    /// Take the head of `queue`, leaving it un-acknowledged on `channel`.
    pub fn basic_get(&mut self, channel: ChannelId, queue: &str) -> QueueResult<Option<Delivery>> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(QueueError::ChannelClosed(channel))?;
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

        Ok(q
            .messages
            .pop_front()
            .map(|entry| state.deliver(channel, queue, entry, false)))
    }

    /// Register a consumer on `queue` for `channel`. Ready messages may be
    /// dispatched to it immediately.
    pub fn consume(
        &mut self,
        channel: ChannelId,
        queue: &str,
        callback: DeliveryCallback,
    ) -> QueueResult<(ConsumerTag, Vec<Dispatch>)> {
        if !self.channels.contains_key(&channel) {
            return Err(QueueError::ChannelClosed(channel));
        }
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

        let tag = format!("ctag-{channel}-{}", Uuid::new_v4().simple());
        q.add_consumer(&tag);
        self.consumers.insert(
            tag.clone(),
            Consumer {
                queue: queue.to_string(),
                channel,
                callback,
            },
        );

        let dispatches = self.dispatch(queue);
        Ok((tag, dispatches))
    }

    /// Remove a consumer. Returns false if the tag was unknown.
    pub fn cancel(&mut self, tag: &str) -> bool {
        match self.consumers.remove(tag) {
            Some(consumer) => {
                if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                    queue.remove_consumer(tag);
                }
                true
            }
            None => false,
        }
    }

    pub fn ack(&mut self, channel: ChannelId, delivery_tag: DeliveryTag) -> QueueResult<Vec<Dispatch>> {
        let unacked = self.take_unacked(channel, delivery_tag)?;

        if let (Some(persistence), Some(key)) = (&self.persistence, unacked.entry.store_key) {
            persistence.remove_message(&unacked.queue, key)?;
        }

        // Only consumer deliveries hold a prefetch slot.
        if unacked.via_consumer {
            Ok(self.dispatch_all())
        } else {
            Ok(Vec::new())
        }
    }

    /// Reject a delivery. With `requeue` it goes back to the head of its
    /// queue; otherwise it is discarded.
    pub fn reject(
        &mut self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> QueueResult<Vec<Dispatch>> {
        let unacked = self.take_unacked(channel, delivery_tag)?;

        if requeue {
            match self.queues.get_mut(&unacked.queue) {
                Some(queue) => queue.requeue_front(vec![unacked.entry]),
                None => warn!(queue = %unacked.queue, "cannot requeue to a missing queue"),
            }
        } else if let (Some(persistence), Some(key)) = (&self.persistence, unacked.entry.store_key) {
            persistence.remove_message(&unacked.queue, key)?;
        }

        Ok(self.dispatch_all())
    }

    /// Close every channel and release the persistence handle.
    pub(crate) fn shutdown(&mut self) -> QueueResult<()> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            // Nobody is left to run callbacks for these.
            drop(self.close_channel(id));
        }
        self.consumers.clear();

        if let Some(persistence) = self.persistence.take() {
            persistence.flush()?;
        }
        Ok(())
    }

    fn channel_mut(&mut self, channel: ChannelId) -> QueueResult<&mut ChannelState> {
        self.channels
            .get_mut(&channel)
            .ok_or(QueueError::ChannelClosed(channel))
    }

    fn take_unacked(&mut self, channel: ChannelId, delivery_tag: DeliveryTag) -> QueueResult<Unacked> {
        self.channel_mut(channel)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(QueueError::UnknownDeliveryTag {
                channel,
                delivery_tag,
            })
    }

    /// Push ready messages of `queue_name` to consumers with free prefetch
    /// slots, round-robin.
    fn dispatch(&mut self, queue_name: &str) -> Vec<Dispatch> {
        let Self {
            queues,
            channels,
            consumers,
            ..
        } = self;

        let mut out = Vec::new();
        let Some(queue) = queues.get_mut(queue_name) else {
            return out;
        };

        while !queue.is_empty() && queue.has_consumers() {
            let chosen = queue.consumer_rotation().into_iter().find(|tag| {
                consumers
                    .get(tag)
                    .and_then(|c| channels.get(&c.channel))
                    .is_some_and(ChannelState::has_capacity)
            });
            let Some(tag) = chosen else { break };
            let Some(consumer) = consumers.get(&tag) else { break };
            let Some(state) = channels.get_mut(&consumer.channel) else { break };
            let Some(entry) = queue.messages.pop_front() else { break };

            queue.advance_past(&tag);
            let delivery = state.deliver(consumer.channel, queue_name, entry, true);
            debug!(
                queue = queue_name,
                consumer = %tag,
                delivery_tag = delivery.delivery_tag,
                "dispatching to consumer"
            );
            out.push(Dispatch {
                callback: Arc::clone(&consumer.callback),
                delivery,
            });
        }
        out
    }

    fn dispatch_all(&mut self) -> Vec<Dispatch> {
        let names: Vec<String> = self
            .queues
            .values()
            .filter(|q| q.has_consumers() && !q.is_empty())
            .map(|q| q.name.clone())
            .collect();

        let mut out = Vec::new();
        for name in names {
            out.extend(self.dispatch(&name));
        }
        out
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("exchanges", &self.exchanges.len())
            .field("queues", &self.queues.len())
            .field("channels", &self.channels.len())
            .field("consumers", &self.consumers.len())
            .field("persistence", &self.persistence)
            .finish()
    }
}
