use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::engine::{ChannelId, DeliveryTag};

/// Message headers. Kept ordered so stored messages serialize deterministically.
pub type Headers = BTreeMap<String, String>;

/// A message as published onto an exchange.
///
/// This structure is what durable queues write to the persistence layer, so
/// it is serializable.
///
/// # Fields
///
/// - `message_id` - Broker-assigned unique id (UUID v4).
/// - `exchange` - The exchange the message was published to.
/// - `headers` - Producer supplied metadata, readable without parsing the body.
/// - `payload` - The message body, usually a JSON document.
/// - `timestamp` - Milliseconds since the UNIX epoch when the broker accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub exchange: String,
    #[serde(default)]
    pub headers: Headers,
    pub payload: String,
    pub timestamp: i64,
}

impl Message {
    pub fn new(exchange: &str, headers: Headers, payload: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            exchange: exchange.to_string(),
            headers,
            payload: payload.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// A message handed to a channel, either by `basic_get` or by a consumer
/// callback. It stays un-acknowledged on `channel` until `delivery_tag` is
/// acked or rejected there.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: ChannelId,
    pub delivery_tag: DeliveryTag,
    pub queue: String,
    pub redelivered: bool,
    pub message: Message,
}

impl Delivery {
    pub fn payload(&self) -> &str {
        &self.message.payload
    }
}
