use super::{ExchangeRecord, Persistence};
use crate::broker::message::{Headers, Message};

use tempfile::tempdir;

fn message(payload: &str) -> Message {
    Message::new("test.exchange", Headers::new(), payload)
}

#[test]
fn test_store_and_load_message() {
    let persistence = Persistence::temporary().unwrap();

    let key = persistence.store_message("jobs", &message("hello")).unwrap();
    let messages = persistence.load_messages("jobs").unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, key);
    assert_eq!(messages[0].1.payload, "hello");
    assert_eq!(messages[0].1.exchange, "test.exchange");
}

#[test]
fn test_load_preserves_publish_order() {
    let persistence = Persistence::temporary().unwrap();

    for i in 0..5 {
        persistence
            .store_message("ordered", &message(&format!("msg{i}")))
            .unwrap();
    }

    let payloads: Vec<_> = persistence
        .load_messages("ordered")
        .unwrap()
        .into_iter()
        .map(|(_, m)| m.payload)
        .collect();
    assert_eq!(payloads, vec!["msg0", "msg1", "msg2", "msg3", "msg4"]);
}

#[test]
fn test_remove_message() {
    let persistence = Persistence::temporary().unwrap();
    let first = persistence.store_message("jobs", &message("a")).unwrap();
    persistence.store_message("jobs", &message("b")).unwrap();

    persistence.remove_message("jobs", first).unwrap();

    let messages = persistence.load_messages("jobs").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1.payload, "b");
}

#[test]
fn test_queues_are_isolated() {
    let persistence = Persistence::temporary().unwrap();
    persistence.store_message("left", &message("l")).unwrap();

    assert!(persistence.load_messages("right").unwrap().is_empty());
}

#[test]
fn test_topology_roundtrip() {
    let persistence = Persistence::temporary().unwrap();
    let record = ExchangeRecord {
        name: "app.work.high".into(),
        bindings: vec!["app.balance.high".into()],
    };

    persistence.save_exchange(&record).unwrap();
    persistence.save_queue("app.balance.high").unwrap();
    persistence.save_queue("app.balance.high").unwrap();

    assert_eq!(persistence.load_exchanges().unwrap(), vec![record]);
    assert_eq!(
        persistence.load_queue_names().unwrap(),
        vec!["app.balance.high".to_string()]
    );
}

#[test]
fn test_messages_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let persistence = Persistence::open(dir.path()).unwrap();
        persistence.store_message("jobs", &message("durable")).unwrap();
        persistence.flush().unwrap();
    }

    let reopened = Persistence::open(dir.path()).unwrap();
    let messages = reopened.load_messages("jobs").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1.payload, "durable");
}
