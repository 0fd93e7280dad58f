use std::env;
use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::{PromotionOrder, QueueSettings, Settings, load_config};

/// Run `f` with a fresh temporary directory as the working directory.
fn in_temp_cwd<R>(f: impl FnOnce() -> R) -> R {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");
    let result = f();
    env::set_current_dir(orig).expect("restore cwd");
    result
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert!(settings.broker.data_dir.is_none());
    assert_eq!(settings.queue.prefix, "popqueue");
    assert_eq!(settings.queue.deferred_poll_ms, 1000);
    assert_eq!(settings.queue.promotion, PromotionOrder::AckFirst);
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_queue_settings_helpers() {
    let settings = QueueSettings::with_prefix("reports");
    assert_eq!(settings.prefix, "reports");
    assert_eq!(settings.deferred_poll(), Duration::from_secs(1));
    assert_eq!(PromotionOrder::PublishFirst.as_str(), "publish_first");
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    let settings = in_temp_cwd(load_config).expect("load_config failed");
    assert_eq!(settings.queue.prefix, "popqueue");
    assert!(settings.broker.data_dir.is_none());
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let settings = in_temp_cwd(|| {
        fs::create_dir_all("config").expect("create config dir");
        let toml = r#"
            [broker]
            data_dir = "/var/lib/popqueue"

            [queue]
            prefix = "billing"
            promotion = "publish_first"
        "#;
        fs::write("config/default.toml", toml).expect("write config file");
        load_config()
    })
    .expect("load_config failed");

    assert_eq!(settings.broker.data_dir.as_deref(), Some("/var/lib/popqueue"));
    assert_eq!(settings.queue.prefix, "billing");
    assert_eq!(settings.queue.promotion, PromotionOrder::PublishFirst);
    // Not in the file, so still the default.
    assert_eq!(settings.queue.deferred_poll_ms, 1000);
}

#[test]
#[serial]
fn load_config_env_overrides_file() {
    let settings = temp_env::with_vars(
        [
            ("POPQUEUE_QUEUE__PREFIX", Some("from_env")),
            ("POPQUEUE_QUEUE__DEFERRED_POLL_MS", Some("250")),
            ("POPQUEUE_LOGGING__LEVEL", Some("debug")),
        ],
        || {
            in_temp_cwd(|| {
                fs::create_dir_all("config").expect("create config dir");
                fs::write("config/default.toml", "[queue]\nprefix = \"from_file\"\n")
                    .expect("write config file");
                load_config()
            })
        },
    )
    .expect("load_config failed");

    assert_eq!(settings.queue.prefix, "from_env");
    assert_eq!(settings.queue.deferred_poll_ms, 250);
    assert_eq!(settings.logging.level, "debug");
}

#[test]
#[serial]
fn load_config_rejects_zero_poll_interval() {
    let result = temp_env::with_var("POPQUEUE_QUEUE__DEFERRED_POLL_MS", Some("0"), || {
        in_temp_cwd(load_config)
    });
    assert!(result.is_err());
}

#[test]
#[serial]
fn load_config_rejects_unknown_promotion_order() {
    let result = temp_env::with_var("POPQUEUE_QUEUE__PROMOTION", Some("sometimes"), || {
        in_temp_cwd(load_config)
    });
    assert!(result.is_err());
}
