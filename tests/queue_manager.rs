mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};

use common::{settings, setup, wait_until};
use popqueue::broker::Headers;
use popqueue::config::PromotionOrder;
use popqueue::queue::{ConsumerState, work_exchange};
use popqueue::{Connection, PriorityLevel, QueueError, QueueManager};

#[test]
fn pop_returns_work_in_priority_order() {
    let (_connection, manager) = setup("order");
    manager.publish_now(&json!("bulk"), PriorityLevel::Bulk).unwrap();
    manager.publish_now(&json!("normal"), PriorityLevel::Normal).unwrap();
    manager.publish_now(&json!("high"), PriorityLevel::High).unwrap();

    let mut popped = Vec::new();
    for _ in 0..3 {
        let item = manager.pop().unwrap();
        popped.push((item.priority(), item.payload().clone()));
        manager.ack(&item).unwrap();
    }

    assert_eq!(
        popped,
        vec![
            (PriorityLevel::High, json!("high")),
            (PriorityLevel::Normal, json!("normal")),
            (PriorityLevel::Bulk, json!("bulk")),
        ]
    );
    assert!(manager.try_pop().unwrap().is_none());
}

#[test]
fn fifo_within_a_priority() {
    let (_connection, manager) = setup("fifo");
    for i in 0..5 {
        manager.publish_now(&i, PriorityLevel::Normal).unwrap();
    }

    let order: Vec<i64> = (0..5)
        .map(|_| {
            let item = manager.try_pop().unwrap().unwrap();
            manager.ack(&item).unwrap();
            item.payload_as().unwrap()
        })
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[test]
fn no_loss_or_duplication_with_concurrent_producers() {
    let (_connection, manager) = setup("concurrent");
    let manager = Arc::new(manager);
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let priority = PriorityLevel::ALL[i % 3];
                    manager
                        .publish_now(&json!({"p": p, "i": i}), priority)
                        .unwrap();
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for _ in 0..PRODUCERS * PER_PRODUCER {
        let item = manager.pop().unwrap();
        assert!(seen.insert(item.payload().to_string()), "duplicate {:?}", item.payload());
        manager.ack(&item).unwrap();
    }
    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
    assert!(manager.try_pop().unwrap().is_none());
}

#[test]
fn blocking_pop_wakes_on_publish() {
    let (_connection, manager) = setup("blocking");
    let manager = Arc::new(manager);

    let consumer = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let item = manager.pop().unwrap();
            manager.ack(&item).unwrap();
            item.payload().clone()
        })
    };

    assert!(wait_until(Duration::from_secs(2), || {
        manager.consumer_state() == ConsumerState::BlockedWaiting
    }));
    manager.publish_now(&json!("late"), PriorityLevel::Bulk).unwrap();

    assert_eq!(consumer.join().unwrap(), json!("late"));
    assert_eq!(manager.consumer_state(), ConsumerState::Idle);
}

#[test]
fn deferred_work_matures_on_time_and_keeps_priority() {
    let (_connection, manager) = setup("deferred");
    let delay = chrono::Duration::milliseconds(500);
    let run_at = Utc::now() + delay;
    manager.publish(&json!("later"), PriorityLevel::High, run_at).unwrap();

    assert!(wait_until(Duration::from_secs(1), || manager.deferred_len() == 1));
    thread::sleep(Duration::from_millis(200));
    assert!(manager.try_pop().unwrap().is_none());

    let mut found = None;
    let deadline = Instant::now() + Duration::from_secs(3);
    while found.is_none() && Instant::now() < deadline {
        found = manager.try_pop().unwrap();
        if found.is_none() {
            thread::sleep(Duration::from_millis(10));
        }
    }

    let item = found.expect("deferred work never matured");
    assert!(Utc::now() >= run_at);
    assert!(Utc::now() < run_at + chrono::Duration::milliseconds(700));
    assert_eq!(item.priority(), PriorityLevel::High);
    assert_eq!(item.payload(), &json!("later"));
    manager.ack(&item).unwrap();
    assert_eq!(manager.deferred_len(), 0);
}

#[test]
fn blocking_pop_wakes_on_matured_deferred_work() {
    let (_connection, manager) = setup("deferred-block");
    manager
        .publish(
            &json!("soon"),
            PriorityLevel::Normal,
            Utc::now() + chrono::Duration::milliseconds(200),
        )
        .unwrap();

    let started = Instant::now();
    let item = manager.pop().unwrap();
    assert_eq!(item.payload(), &json!("soon"));
    assert!(started.elapsed() < Duration::from_secs(3));
    manager.ack(&item).unwrap();
}

#[test]
fn past_run_at_is_published_immediately() {
    let (_connection, manager) = setup("past");
    manager
        .publish(
            &json!("overdue"),
            PriorityLevel::Normal,
            Utc::now() - chrono::Duration::seconds(30),
        )
        .unwrap();

    let item = manager.try_pop().unwrap().expect("overdue work should be ready");
    assert_eq!(item.payload(), &json!("overdue"));
    assert_eq!(manager.deferred_len(), 0);
}

#[test]
fn concurrent_pop_is_a_contract_violation() {
    let (_connection, manager) = setup("double-pop");
    let manager = Arc::new(manager);

    let blocked = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.pop())
    };
    assert!(wait_until(Duration::from_secs(2), || {
        manager.consumer_state() == ConsumerState::BlockedWaiting
    }));

    let err = manager.try_pop().unwrap_err();
    assert!(err.is_contract_violation());

    manager.publish_now(&json!(1), PriorityLevel::Normal).unwrap();
    let item = blocked.join().unwrap().unwrap();
    manager.ack(&item).unwrap();
}

#[test]
fn ack_rejects_foreign_and_repeated_handles() {
    let (connection, first) = setup("ack");
    let second = QueueManager::new(&connection, &settings("ack")).unwrap();
    first.publish_now(&json!("x"), PriorityLevel::Normal).unwrap();

    let item = first.try_pop().unwrap().unwrap();
    assert!(second.ack(&item).unwrap_err().is_contract_violation());

    first.ack(&item).unwrap();
    assert!(first.ack(&item).unwrap_err().is_contract_violation());
}

#[test]
fn managers_with_the_same_prefix_share_queues() {
    let (connection, producer) = setup("shared");
    let consumer = QueueManager::new(&connection, &settings("shared")).unwrap();
    let other = QueueManager::new(&connection, &settings("other")).unwrap();

    producer.publish_now(&json!("shared"), PriorityLevel::High).unwrap();

    assert!(other.try_pop().unwrap().is_none());
    let item = consumer.try_pop().unwrap().unwrap();
    assert_eq!(item.payload(), &json!("shared"));
    consumer.ack(&item).unwrap();
}

#[test]
fn malformed_messages_are_dropped() {
    let (connection, manager) = setup("malformed");
    let channel = connection.create_channel().unwrap();
    channel
        .publish(
            &work_exchange("malformed", PriorityLevel::High),
            Headers::new(),
            "{not json",
        )
        .unwrap();
    manager.publish_now(&json!("good"), PriorityLevel::High).unwrap();

    let item = manager.try_pop().unwrap().unwrap();
    assert_eq!(item.payload(), &Value::from("good"));
    manager.ack(&item).unwrap();
    assert!(manager.try_pop().unwrap().is_none());
    assert_eq!(manager.ready_len().unwrap(), 0);
}

#[test]
fn shutdown_unblocks_pop() {
    let (_connection, manager) = setup("shutdown");
    let manager = Arc::new(manager);

    let blocked = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.pop())
    };
    assert!(wait_until(Duration::from_secs(2), || {
        manager.consumer_state() == ConsumerState::BlockedWaiting
    }));

    manager.shutdown();
    assert!(matches!(blocked.join().unwrap(), Err(QueueError::Shutdown)));
    assert!(matches!(manager.pop(), Err(QueueError::Shutdown)));
}

#[test]
fn unacked_work_is_redelivered_after_manager_drop() {
    let (connection, manager) = setup("redeliver");
    manager.publish_now(&json!("important"), PriorityLevel::Normal).unwrap();

    let item = manager.try_pop().unwrap().unwrap();
    assert!(!item.redelivered());
    drop(manager);

    let manager = QueueManager::new(&connection, &settings("redeliver")).unwrap();
    let again = manager.try_pop().unwrap().unwrap();
    assert_eq!(again.payload(), &json!("important"));
    assert!(again.redelivered());
    manager.ack(&again).unwrap();
}

#[test]
fn purge_drops_ready_and_deferred_work() {
    let (_connection, manager) = setup("purge");
    manager.publish_now(&json!(1), PriorityLevel::High).unwrap();
    manager.publish_now(&json!(2), PriorityLevel::Bulk).unwrap();
    manager
        .publish(
            &json!(3),
            PriorityLevel::Normal,
            Utc::now() + chrono::Duration::seconds(60),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || manager.deferred_len() == 1));

    assert_eq!(manager.purge().unwrap(), 3);
    assert_eq!(manager.deferred_len(), 0);
    assert!(manager.try_pop().unwrap().is_none());
}

#[test]
fn matured_bulk_work_loses_to_later_high_work() {
    let (_connection, manager) = setup("deferred-bulk");
    let run_at = Utc::now() + chrono::Duration::milliseconds(300);
    manager.publish(&json!("deferred bulk"), PriorityLevel::Bulk, run_at).unwrap();

    assert!(wait_until(Duration::from_secs(3), || manager.ready_len().unwrap() == 1));
    assert_eq!(manager.deferred_len(), 0);
    manager.publish_now(&json!("fresh high"), PriorityLevel::High).unwrap();

    let first = manager.pop().unwrap();
    manager.ack(&first).unwrap();
    let second = manager.pop().unwrap();
    manager.ack(&second).unwrap();

    assert_eq!(first.priority(), PriorityLevel::High);
    assert_eq!(first.payload(), &json!("fresh high"));
    assert_eq!(second.priority(), PriorityLevel::Bulk);
    assert_eq!(second.payload(), &json!("deferred bulk"));
}

#[test]
fn publish_first_promotion_delivers_once_on_time() {
    let connection = Connection::in_memory().unwrap();
    let mut settings = settings("publish-first");
    settings.promotion = PromotionOrder::PublishFirst;
    let manager = QueueManager::new(&connection, &settings).unwrap();

    let run_at = Utc::now() + chrono::Duration::milliseconds(300);
    manager.publish(&json!("once"), PriorityLevel::Normal, run_at).unwrap();
    assert!(wait_until(Duration::from_secs(1), || manager.deferred_len() == 1));
    assert!(manager.try_pop().unwrap().is_none());

    let mut found = None;
    let deadline = Instant::now() + Duration::from_secs(3);
    while found.is_none() && Instant::now() < deadline {
        found = manager.try_pop().unwrap();
        if found.is_none() {
            thread::sleep(Duration::from_millis(10));
        }
    }

    let item = found.expect("deferred work never matured");
    assert!(Utc::now() >= run_at);
    assert_eq!(item.priority(), PriorityLevel::Normal);
    assert_eq!(item.payload(), &json!("once"));
    manager.ack(&item).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(manager.try_pop().unwrap().is_none());
    assert_eq!(manager.deferred_len(), 0);
    assert_eq!(manager.ready_len().unwrap(), 0);
}
