//! The `broker` module is the message substrate the work queue runs on.
//!
//! It provides durable fanout exchanges, competing-consumer queues, channels
//! with a prefetch limit, `basic_get`, push consumers, explicit ack/reject
//! and requeue-on-close. Durable state goes through `crate::persistence`.

pub mod connection;
pub mod engine;
pub mod message;
pub mod queue;

pub use connection::{Channel, ChannelHandle, Connection};
pub use engine::{Broker, ChannelId, ConsumerTag, DeliveryTag};
pub use message::{Delivery, Headers, Message};
