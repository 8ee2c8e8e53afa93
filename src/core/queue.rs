//! Queue declarations and their durable table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::core::args::{decode_args, encode_args, Arguments};
use crate::core::store::{StoreError, Table};

const TABLE_NAME: &str = "queues";
const MAX_NAME_LEN: usize = 255;

/// Queue names become message log file names, so they are limited to ASCII
/// alphanumerics, `_`, `-` and `.`, and may not start with `.`.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDef {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub args: Arguments,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRow {
    name: String,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    args: String,
}

impl From<&QueueDef> for QueueRow {
    fn from(q: &QueueDef) -> Self {
        Self {
            name: q.name.clone(),
            durable: q.durable,
            exclusive: q.exclusive,
            auto_delete: q.auto_delete,
            args: encode_args(&q.args),
        }
    }
}

impl From<QueueRow> for QueueDef {
    fn from(row: QueueRow) -> Self {
        Self {
            name: row.name,
            durable: row.durable,
            exclusive: row.exclusive,
            auto_delete: row.auto_delete,
            args: decode_args(&row.args),
        }
    }
}

#[derive(Debug)]
struct Inner {
    table: Table<QueueRow>,
    queues: HashMap<String, Arc<QueueDef>>,
}

/// Owns every declared queue definition.
#[derive(Debug)]
pub struct QueueManager {
    inner: Mutex<Inner>,
}

impl QueueManager {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let table: Table<QueueRow> = Table::open(dir, TABLE_NAME)?;
        let queues: HashMap<_, _> = table
            .load()?
            .into_iter()
            .map(|row| (row.name.clone(), Arc::new(QueueDef::from(row))))
            .collect();
        debug!(target: "relaymq::queue", count = queues.len(), "Recovered queues");

        Ok(Self {
            inner: Mutex::new(Inner { table, queues }),
        })
    }

    /// Declares a queue; idempotent on name. Returns `false` only when a
    /// durable queue could not be persisted.
    pub fn declare(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.queues.contains_key(name) {
            debug!(target: "relaymq::queue", name, "Queue already declared");
            return true;
        }

        let queue = QueueDef {
            name: name.to_string(),
            durable,
            exclusive,
            auto_delete,
            args,
        };
        if durable {
            if let Err(e) = inner.table.insert(QueueRow::from(&queue)) {
                error!(target: "relaymq::queue", name, error = %e, "Failed to persist queue");
                return false;
            }
        }
        inner.queues.insert(name.to_string(), Arc::new(queue));
        true
    }

    pub fn delete(&self, name: &str) {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.queues.remove(name) else {
            return;
        };
        if queue.durable {
            if let Err(e) = inner.table.delete_where(|row| row.name == name) {
                error!(target: "relaymq::queue", name, error = %e, "Failed to remove persisted queue");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<QueueDef>> {
        self.inner.lock().queues.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    /// Snapshot of every queue, used to seed message stores at startup.
    pub fn all(&self) -> Vec<Arc<QueueDef>> {
        self.inner.lock().queues.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.table.truncate() {
            error!(target: "relaymq::queue", error = %e, "Failed to truncate queue table");
        }
        inner.queues.clear();
    }
}
