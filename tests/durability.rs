mod common;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::tempdir;

use common::{settings, wait_until};
use popqueue::config::BrokerSettings;
use popqueue::{Connection, PriorityLevel, QueueManager};

fn open(dir: &std::path::Path) -> Connection {
    Connection::open(&BrokerSettings {
        data_dir: Some(dir.to_string_lossy().into_owned()),
    })
    .expect("open durable broker")
}

#[test]
fn unacked_work_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let connection = open(dir.path());
        let manager = QueueManager::new(&connection, &settings("durable")).unwrap();
        manager.publish_now(&json!("done"), PriorityLevel::High).unwrap();
        manager.publish_now(&json!("in-flight"), PriorityLevel::High).unwrap();
        manager.publish_now(&json!("waiting"), PriorityLevel::Bulk).unwrap();

        let done = manager.try_pop().unwrap().unwrap();
        manager.ack(&done).unwrap();
        let in_flight = manager.try_pop().unwrap().unwrap();
        assert_eq!(in_flight.payload(), &json!("in-flight"));

        drop(manager);
        connection.close().unwrap();
    }

    let connection = open(dir.path());
    let manager = QueueManager::new(&connection, &settings("durable")).unwrap();
    let mut payloads = Vec::new();
    while let Some(item) = manager.try_pop().unwrap() {
        payloads.push(item.payload().clone());
        manager.ack(&item).unwrap();
    }
    assert_eq!(payloads, vec![json!("in-flight"), json!("waiting")]);
    connection.close().unwrap();
}

#[test]
fn deferred_work_survives_restart() {
    let dir = tempdir().unwrap();
    let run_at = Utc::now() + chrono::Duration::milliseconds(300);
    {
        let connection = open(dir.path());
        let manager = QueueManager::new(&connection, &settings("durable-deferred")).unwrap();
        manager.publish(&json!("later"), PriorityLevel::Normal, run_at).unwrap();
        assert!(wait_until(Duration::from_secs(2), || manager.deferred_len() == 1));

        drop(manager);
        connection.close().unwrap();
    }

    let connection = open(dir.path());
    let manager = QueueManager::new(&connection, &settings("durable-deferred")).unwrap();
    let item = manager.pop().unwrap();
    assert_eq!(item.payload(), &json!("later"));
    assert!(Utc::now() >= run_at);
    manager.ack(&item).unwrap();
    connection.close().unwrap();
}
