//! The `error` module defines the error type shared by every `popqueue` module.
//!
//! Errors fall into a few families:
//! - broker errors (unknown exchange/queue, closed channel or connection)
//! - contract violations, which indicate a programming error in the host
//!   process (a second blocked consumer, acking a handle twice or on the
//!   wrong channel)
//! - malformed messages, which the consumer paths acknowledge and drop
//! - infrastructure errors from sled, `config` and the OS

use crate::broker::{ChannelId, DeliveryTag};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("unknown delivery tag {delivery_tag} on channel {channel}")]
    UnknownDeliveryTag {
        channel: ChannelId,
        delivery_tag: DeliveryTag,
    },

    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue manager is shutting down")]
    Shutdown,
}

impl QueueError {
    /// True for errors caused by the caller breaking the single-consumer or
    /// acknowledgment contract. These are never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            QueueError::ContractViolation(_) | QueueError::UnknownDeliveryTag { .. }
        )
    }

    /// True when the channel or connection an operation needed is gone.
    /// Retrying on the same handle cannot succeed.
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::ChannelClosed(_) | QueueError::ConnectionClosed)
    }
}

/// Result type for queue and broker operations
pub type QueueResult<T> = Result<T, QueueError>;
