use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker substrate, the work queue and logging.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the broker.
///
/// With a `data_dir` durable exchanges, queues and their messages are kept
/// in a sled database there. Without one the broker is purely in-memory.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BrokerSettings {
    pub data_dir: Option<String>,
}

/// Order of the two steps that promote a matured deferred item.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromotionOrder {
    /// Acknowledge the deferred message, then republish it. A failed
    /// republish loses the item.
    #[default]
    AckFirst,
    /// Republish, then acknowledge. A failed acknowledgment can produce a
    /// duplicate.
    PublishFirst,
}

impl PromotionOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionOrder::AckFirst => "ack_first",
            PromotionOrder::PublishFirst => "publish_first",
        }
    }
}

/// Configuration settings for the priority work queue.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub prefix: String,
    pub deferred_poll_ms: u64,
    pub promotion: PromotionOrder,
}

impl QueueSettings {
    /// Default settings under another name prefix.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..Self::default()
        }
    }

    pub fn deferred_poll(&self) -> Duration {
        Duration::from_millis(self.deferred_poll_ms)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "popqueue".to_string(),
            deferred_poll_ms: 1000,
            promotion: PromotionOrder::AckFirst,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub data_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialQueueSettings {
    pub prefix: Option<String>,
    pub deferred_poll_ms: Option<u64>,
    pub promotion: Option<PromotionOrder>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}
