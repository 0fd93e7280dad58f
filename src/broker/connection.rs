//! Connections and channels
//!
//! A `Connection` owns one `Broker` behind a mutex plus a single delivery
//! thread. Every consumer callback runs on that thread, never while the
//! broker lock is held, so a callback may call back into the broker (ack,
//! reject, cancel) without deadlocking.
//!
//! Dispatches are handed to the delivery thread while the broker lock is
//! still held. The handoff never blocks, and doing it under the lock keeps
//! callbacks in the order the broker committed the deliveries.
//!
//! A `Channel` is the owning handle returned by `Connection::create_channel`.
//! Dropping it closes the channel, which returns its un-acknowledged
//! deliveries to their queues. `ChannelHandle` is a cloneable, non-owning
//! view used from inside callbacks.

use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::broker::engine::{
    Broker, ChannelId, ConsumerTag, DeliveryCallback, DeliveryTag, Dispatch,
};
use crate::broker::message::{Delivery, Headers};
use crate::config::BrokerSettings;
use crate::persistence::Persistence;
use crate::utils::error::{QueueError, QueueResult};

const DELIVERY_THREAD: &str = "popqueue-delivery";

struct Inner {
    broker: Mutex<Broker>,
    executor: Mutex<Option<mpsc::Sender<Dispatch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !*self.closed.get_mut() {
            let broker = self.broker.get_mut().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = broker.shutdown() {
                warn!(error = %e, "failed to shut down broker on drop");
            }
        }
    }
}

/// Shared handle to an in-process broker. Cloning is cheap and every clone
/// talks to the same broker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Open a broker according to `settings`: durable when a data directory
    /// is configured, purely in-memory otherwise.
    pub fn open(settings: &BrokerSettings) -> QueueResult<Self> {
        let broker = match &settings.data_dir {
            Some(dir) => {
                info!(data_dir = %dir, "opening durable broker");
                Broker::with_persistence(Persistence::open(dir)?)?
            }
            None => {
                info!("opening in-memory broker");
                Broker::new()
            }
        };
        Self::from_broker(broker)
    }

    pub fn in_memory() -> QueueResult<Self> {
        Self::from_broker(Broker::new())
    }

    pub fn from_broker(broker: Broker) -> QueueResult<Self> {
        let (tx, rx) = mpsc::channel::<Dispatch>();
        let worker = thread::Builder::new()
            .name(DELIVERY_THREAD.to_string())
            .spawn(move || {
                for dispatch in rx {
                    let tag = dispatch.delivery().delivery_tag;
                    if panic::catch_unwind(AssertUnwindSafe(|| dispatch.run())).is_err() {
                        error!(delivery_tag = tag, "consumer callback panicked");
                    }
                }
                debug!("delivery thread exiting");
            })?;

        Ok(Self {
            inner: Arc::new(Inner {
                broker: Mutex::new(broker),
                executor: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn create_channel(&self) -> QueueResult<Channel> {
        let id = self.with_broker(|broker| Ok(broker.open_channel()))?;
        debug!(channel = id, "opened channel");
        Ok(Channel {
            handle: ChannelHandle {
                id,
                connection: self.clone(),
            },
        })
    }

    /// Close every channel, flush persistence and stop the delivery thread.
    /// Calling it again is a no-op.
    pub fn close(&self) -> QueueResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self
            .inner
            .broker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();

        // Dropping the sender lets the delivery thread drain and exit.
        drop(
            self.inner
                .executor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                debug!("connection closed from its own delivery thread, not joining");
            } else if handle.join().is_err() {
                warn!("delivery thread panicked");
            }
        }

        info!("connection closed");
        result
    }

    /// Run `f` against the broker under its lock.
    pub(crate) fn with_broker<R>(
        &self,
        f: impl FnOnce(&mut Broker) -> QueueResult<R>,
    ) -> QueueResult<R> {
        if self.is_closed() {
            return Err(QueueError::ConnectionClosed);
        }
        let mut broker = self
            .inner
            .broker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut broker)
    }

    /// Like `with_broker`, for operations that may commit deliveries to
    /// consumers.
    fn dispatching<R>(
        &self,
        f: impl FnOnce(&mut Broker) -> QueueResult<(R, Vec<Dispatch>)>,
    ) -> QueueResult<R> {
        self.with_broker(|broker| {
            let (result, dispatches) = f(broker)?;
            self.hand_off(dispatches);
            Ok(result)
        })
    }

    fn hand_off(&self, dispatches: Vec<Dispatch>) {
        if dispatches.is_empty() {
            return;
        }
        let executor = self
            .inner
            .executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = executor.as_ref() else {
            debug!(count = dispatches.len(), "connection closing, dispatches dropped");
            return;
        };
        for dispatch in dispatches {
            if let Err(mpsc::SendError(lost)) = tx.send(dispatch) {
                warn!(
                    delivery_tag = lost.delivery().delivery_tag,
                    "delivery thread gone, dispatch dropped"
                );
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Non-owning view of an open channel.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    id: ChannelId,
    connection: Connection,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn with_open<R>(&self, f: impl FnOnce(&mut Broker) -> QueueResult<R>) -> QueueResult<R> {
        self.connection.with_broker(|broker| {
            if !broker.is_channel_open(self.id) {
                return Err(QueueError::ChannelClosed(self.id));
            }
            f(broker)
        })
    }

    pub fn declare_exchange(&self, name: &str, durable: bool) -> QueueResult<()> {
        self.with_open(|broker| broker.declare_exchange(name, durable))
    }

    pub fn declare_queue(&self, name: &str, durable: bool) -> QueueResult<()> {
        self.with_open(|broker| broker.declare_queue(name, durable))
    }

    pub fn bind_queue(&self, queue: &str, exchange: &str) -> QueueResult<()> {
        self.with_open(|broker| broker.bind_queue(queue, exchange))
    }

    pub fn purge_queue(&self, queue: &str) -> QueueResult<usize> {
        self.with_open(|broker| broker.purge_queue(queue))
    }

    pub fn queue_len(&self, queue: &str) -> QueueResult<usize> {
        self.with_open(|broker| broker.queue_len(queue))
    }

    pub fn unacked_count(&self) -> usize {
        self.connection
            .with_broker(|broker| Ok(broker.unacked_count(self.id)))
            .unwrap_or(0)
    }

    /// Limit un-acknowledged consumer deliveries on this channel; 0 lifts
    /// the limit.
    pub fn set_prefetch(&self, count: u16) -> QueueResult<()> {
        self.connection.dispatching(|broker| Ok(((), broker.set_prefetch(self.id, count)?)))
    }

    pub fn publish(
        &self,
        exchange: &str,
        headers: Headers,
        payload: impl Into<String>,
    ) -> QueueResult<()> {
        let payload = payload.into();
        self.connection.dispatching(|broker| {
            if !broker.is_channel_open(self.id) {
                return Err(QueueError::ChannelClosed(self.id));
            }
            Ok(((), broker.publish(exchange, headers, payload)?))
        })
    }

    pub fn basic_get(&self, queue: &str) -> QueueResult<Option<Delivery>> {
        self.connection
            .with_broker(|broker| broker.basic_get(self.id, queue))
    }

    /// Start pushing messages from `queue` to `callback` on the delivery
    /// thread. Returns the consumer tag to cancel with.
    pub fn consume<F>(&self, queue: &str, callback: F) -> QueueResult<ConsumerTag>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let callback: DeliveryCallback = Arc::new(callback);
        self.connection
            .dispatching(|broker| broker.consume(self.id, queue, callback))
    }

    pub fn cancel(&self, tag: &str) -> QueueResult<bool> {
        self.connection.with_broker(|broker| Ok(broker.cancel(tag)))
    }

    pub fn ack(&self, delivery_tag: DeliveryTag) -> QueueResult<()> {
        self.connection
            .dispatching(|broker| Ok(((), broker.ack(self.id, delivery_tag)?)))
    }

    pub fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> QueueResult<()> {
        self.connection.dispatching(|broker| {
            Ok(((), broker.reject(self.id, delivery_tag, requeue)?))
        })
    }

    /// Close the channel. Closing twice, or after the connection closed, is
    /// not an error.
    pub fn close(&self) -> QueueResult<()> {
        match self
            .connection
            .dispatching(|broker| Ok(((), broker.close_channel(self.id))))
        {
            Err(QueueError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }
}

/// Owning channel handle; the channel closes when this is dropped.
#[derive(Debug)]
pub struct Channel {
    handle: ChannelHandle,
}

impl Channel {
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }
}

impl Deref for Channel {
    type Target = ChannelHandle;

    fn deref(&self) -> &ChannelHandle {
        &self.handle
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.handle.close() {
            debug!(channel = self.handle.id, error = %e, "error closing channel on drop");
        }
    }
}
