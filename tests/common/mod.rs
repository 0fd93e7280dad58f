#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use popqueue::config::QueueSettings;
use popqueue::{Connection, QueueManager};

/// A fresh in-memory broker and a manager with a short promoter poll.
pub fn setup(prefix: &str) -> (Connection, QueueManager) {
    let connection = Connection::in_memory().expect("open broker");
    let manager = QueueManager::new(&connection, &settings(prefix)).expect("create manager");
    (connection, manager)
}

pub fn settings(prefix: &str) -> QueueSettings {
    let mut settings = QueueSettings::with_prefix(prefix);
    settings.deferred_poll_ms = 50;
    settings
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
