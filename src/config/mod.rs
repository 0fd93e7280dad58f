//! The `config` module loads `Settings` from an optional `config/default.*`
//! file and `POPQUEUE_*` environment variables, filling gaps with defaults.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, PromotionOrder, QueueSettings, Settings};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the broker, queue and logging configurations
///
/// Environment variables use the `POPQUEUE_` prefix and `__` between
/// sections, e.g. `POPQUEUE_QUEUE__DEFERRED_POLL_MS=250`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("POPQUEUE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    let settings = Settings {
        broker: BrokerSettings {
            data_dir: partial
                .broker
                .as_ref()
                .and_then(|b| b.data_dir.clone())
                .or(default.broker.data_dir),
        },
        queue: QueueSettings {
            prefix: partial
                .queue
                .as_ref()
                .and_then(|q| q.prefix.clone())
                .unwrap_or(default.queue.prefix),
            deferred_poll_ms: partial
                .queue
                .as_ref()
                .and_then(|q| q.deferred_poll_ms)
                .unwrap_or(default.queue.deferred_poll_ms),
            promotion: partial
                .queue
                .as_ref()
                .and_then(|q| q.promotion)
                .unwrap_or(default.queue.promotion),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    };

    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.queue.prefix.trim().is_empty() {
        return Err(ConfigError::Message("queue.prefix must not be empty".into()));
    }
    if settings.queue.deferred_poll_ms == 0 {
        return Err(ConfigError::Message(
            "queue.deferred_poll_ms must be greater than zero".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
