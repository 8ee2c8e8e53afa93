//! Exchange-to-queue bindings and their durable table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::core::store::{StoreError, Table};

const TABLE_NAME: &str = "bindings";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        binding_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            binding_key: binding_key.into(),
        }
    }
}

/// Bindings of one exchange, keyed by queue name.
type QueueBindings = HashMap<String, Arc<Binding>>;

#[derive(Debug)]
struct Inner {
    table: Table<Binding>,
    by_exchange: HashMap<String, QueueBindings>,
}

/// Owns every binding. A queue is bound at most once per exchange.
#[derive(Debug)]
pub struct BindingManager {
    inner: Mutex<Inner>,
}

impl BindingManager {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let table: Table<Binding> = Table::open(dir, TABLE_NAME)?;
        let mut by_exchange: HashMap<String, QueueBindings> = HashMap::new();
        let mut count = 0usize;
        for binding in table.load()? {
            by_exchange
                .entry(binding.exchange.clone())
                .or_default()
                .insert(binding.queue.clone(), Arc::new(binding));
            count += 1;
        }
        debug!(target: "relaymq::binding", count, "Recovered bindings");

        Ok(Self {
            inner: Mutex::new(Inner { table, by_exchange }),
        })
    }

    /// Binds `queue` to `exchange`. Already-bound pairs are left untouched,
    /// including their key. `durable` decides whether the binding is
    /// persisted; callers pass `true` only when both endpoints are durable.
    pub fn bind(&self, exchange: &str, queue: &str, binding_key: &str, durable: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner
            .by_exchange
            .get(exchange)
            .is_some_and(|qb| qb.contains_key(queue))
        {
            debug!(target: "relaymq::binding", exchange, queue, "Queue already bound");
            return true;
        }

        let binding = Binding::new(exchange, queue, binding_key);
        if durable {
            if let Err(e) = inner.table.insert(binding.clone()) {
                error!(target: "relaymq::binding", exchange, queue, error = %e, "Failed to persist binding");
                return false;
            }
        }
        inner
            .by_exchange
            .entry(exchange.to_string())
            .or_default()
            .insert(queue.to_string(), Arc::new(binding));
        true
    }

    pub fn unbind(&self, exchange: &str, queue: &str) {
        let mut inner = self.inner.lock();
        let Some(qb) = inner.by_exchange.get_mut(exchange) else {
            return;
        };
        if qb.remove(queue).is_none() {
            return;
        }
        if let Err(e) = inner
            .table
            .delete_where(|b| b.exchange == exchange && b.queue == queue)
        {
            error!(target: "relaymq::binding", exchange, queue, error = %e, "Failed to remove persisted binding");
        }
    }

    /// Drops every binding of `exchange`.
    pub fn remove_exchange_bindings(&self, exchange: &str) {
        let mut inner = self.inner.lock();
        if inner.by_exchange.remove(exchange).is_none() {
            return;
        }
        if let Err(e) = inner.table.delete_where(|b| b.exchange == exchange) {
            error!(target: "relaymq::binding", exchange, error = %e, "Failed to remove persisted bindings");
        }
    }

    /// Drops the bindings of `queue` across every exchange.
    pub fn remove_queue_bindings(&self, queue: &str) {
        let mut inner = self.inner.lock();
        let mut removed = 0usize;
        for qb in inner.by_exchange.values_mut() {
            if qb.remove(queue).is_some() {
                removed += 1;
            }
        }
        if removed == 0 {
            return;
        }
        if let Err(e) = inner.table.delete_where(|b| b.queue == queue) {
            error!(target: "relaymq::binding", queue, error = %e, "Failed to remove persisted bindings");
        }
    }

    pub fn get(&self, exchange: &str, queue: &str) -> Option<Arc<Binding>> {
        self.inner
            .lock()
            .by_exchange
            .get(exchange)
            .and_then(|qb| qb.get(queue).cloned())
    }

    pub fn exists(&self, exchange: &str, queue: &str) -> bool {
        self.get(exchange, queue).is_some()
    }

    /// Snapshot of the bindings of `exchange`.
    pub fn exchange_bindings(&self, exchange: &str) -> Vec<Arc<Binding>> {
        self.inner
            .lock()
            .by_exchange
            .get(exchange)
            .map(|qb| qb.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_exchange.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.table.truncate() {
            error!(target: "relaymq::binding", error = %e, "Failed to truncate binding table");
        }
        inner.by_exchange.clear();
    }
}
