//! Persistence layer backed by `sled`
//!
//! Durable broker state lives here so it survives a restart:
//! - `exchanges`: one JSON record per durable exchange, including its bindings
//! - `queues`: the names of durable queues
//! - `queue:<name>`: the messages currently held by a durable queue, keyed by
//!   a sled-generated id (big-endian) so iteration yields publish order
//!
//! A message is written when it is routed to a durable queue and removed when
//! it is acknowledged, rejected without requeue, or purged. Messages that were delivered but never
//! acknowledged are still on disk and come back after a restart.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::warn;

use crate::broker::message::Message;
use crate::utils::error::QueueResult;

const EXCHANGES_TREE: &str = "exchanges";
const QUEUES_TREE: &str = "queues";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExchangeRecord {
    pub name: String,
    pub bindings: Vec<String>,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A database that is deleted when dropped.
    pub fn temporary() -> QueueResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn queue_tree(&self, queue: &str) -> QueueResult<sled::Tree> {
        Ok(self.db.open_tree(format!("queue:{queue}"))?)
    }

    /// Store a message for a durable queue and return its key.
    pub fn store_message(&self, queue: &str, msg: &Message) -> QueueResult<u64> {
        let serialized = serde_json::to_vec(msg)?;
        let key = self.db.generate_id()?;
        self.queue_tree(queue)?
            .insert(key.to_be_bytes(), serialized)?;
        Ok(key)
    }

    pub fn remove_message(&self, queue: &str, key: u64) -> QueueResult<()> {
        self.queue_tree(queue)?.remove(key.to_be_bytes())?;
        Ok(())
    }

    /// Load a queue's stored messages in publish order. Entries that no
    /// longer decode are skipped.
    pub fn load_messages(&self, queue: &str) -> QueueResult<Vec<(u64, Message)>> {
        let tree = self.queue_tree(queue)?;
        let mut messages = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (key, value) = entry?;
            let Ok(key_bytes) = <[u8; 8]>::try_from(key.as_ref()) else {
                warn!(queue, "skipping stored message with malformed key");
                continue;
            };
            match serde_json::from_slice::<Message>(&value) {
                Ok(msg) => messages.push((u64::from_be_bytes(key_bytes), msg)),
                Err(e) => warn!(queue, error = %e, "skipping undecodable stored message"),
            }
        }
        Ok(messages)
    }

    pub fn save_exchange(&self, record: &ExchangeRecord) -> QueueResult<()> {
        let serialized = serde_json::to_vec(record)?;
        self.db
            .open_tree(EXCHANGES_TREE)?
            .insert(record.name.as_bytes(), serialized)?;
        Ok(())
    }

    pub fn load_exchanges(&self) -> QueueResult<Vec<ExchangeRecord>> {
        let tree = self.db.open_tree(EXCHANGES_TREE)?;
        let mut records = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    pub fn save_queue(&self, name: &str) -> QueueResult<()> {
        self.db
            .open_tree(QUEUES_TREE)?
            .insert(name.as_bytes(), &b""[..])?;
        Ok(())
    }

    pub fn load_queue_names(&self) -> QueueResult<Vec<String>> {
        let tree = self.db.open_tree(QUEUES_TREE)?;
        let mut names = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    pub fn flush(&self) -> QueueResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
