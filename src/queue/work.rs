//! Work items and their wire format
//!
//! Every message on the work exchanges carries a JSON body of the form
//! `{"run_at": <epoch seconds>, "priority": "high|normal|bulk", "payload": ...}`.
//! The priority and run time are duplicated into the `job_priority` and
//! `run_at` headers so they can be inspected without parsing the body.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::{ChannelId, Delivery, DeliveryTag, Headers};
use crate::queue::priority::PriorityLevel;
use crate::utils::error::QueueResult;

pub const PRIORITY_HEADER: &str = "job_priority";
pub const RUN_AT_HEADER: &str = "run_at";

/// Identifies an un-acknowledged delivery. Only valid on the channel that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckHandle {
    pub channel: ChannelId,
    pub delivery_tag: DeliveryTag,
}

impl AckHandle {
    pub fn of(delivery: &Delivery) -> Self {
        Self {
            channel: delivery.channel,
            delivery_tag: delivery.delivery_tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEnvelope {
    pub run_at: f64,
    pub priority: PriorityLevel,
    pub payload: Value,
}

impl WorkEnvelope {
    pub fn new(payload: Value, priority: PriorityLevel, run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: to_epoch_secs(run_at),
            priority,
            payload,
        }
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        from_epoch_secs(self.run_at)
    }

    pub fn encode(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(body: &str) -> QueueResult<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(PRIORITY_HEADER.to_string(), self.priority.to_string());
        headers.insert(
            RUN_AT_HEADER.to_string(),
            self.run_at().to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        headers
    }
}

fn to_epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
}

fn from_epoch_secs(secs: f64) -> DateTime<Utc> {
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A unit of ready work handed out by `QueueManager::pop`. It stays
/// un-acknowledged until passed to `QueueManager::ack`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    payload: Value,
    priority: PriorityLevel,
    run_at: DateTime<Utc>,
    ack_handle: AckHandle,
    redelivered: bool,
}

impl WorkItem {
    /// Decode a delivery taken off the queue for `priority`. The queue the
    /// message came from decides the priority, not the body.
    pub(crate) fn from_delivery(delivery: &Delivery, priority: PriorityLevel) -> QueueResult<Self> {
        let envelope = WorkEnvelope::decode(delivery.payload())?;
        Ok(Self {
            run_at: envelope.run_at(),
            payload: envelope.payload,
            priority,
            ack_handle: AckHandle::of(delivery),
            redelivered: delivery.redelivered,
        })
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserialize the payload into the producer's type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(T::deserialize(&self.payload)?)
    }

    pub fn priority(&self) -> PriorityLevel {
        self.priority
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    pub fn ack_handle(&self) -> AckHandle {
        self.ack_handle
    }

    /// True when the broker handed this message out before without an ack.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}
