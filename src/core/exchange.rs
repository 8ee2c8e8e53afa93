//! Exchange declarations and their durable table.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::args::{decode_args, encode_args, Arguments};
use crate::core::routing::ExchangeType;
use crate::core::store::{StoreError, Table};

const TABLE_NAME: &str = "exchanges";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub args: Arguments,
}

impl Exchange {
    pub fn new(
        name: impl Into<String>,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            durable,
            auto_delete,
            args,
        }
    }
}

/// Persisted shape of an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExchangeRow {
    name: String,
    kind: i32,
    durable: bool,
    auto_delete: bool,
    args: String,
}

impl From<&Exchange> for ExchangeRow {
    fn from(ex: &Exchange) -> Self {
        Self {
            name: ex.name.clone(),
            kind: ex.kind.code(),
            durable: ex.durable,
            auto_delete: ex.auto_delete,
            args: encode_args(&ex.args),
        }
    }
}

impl ExchangeRow {
    fn into_exchange(self) -> Option<Exchange> {
        let kind = ExchangeType::from_code(self.kind)?;
        Some(Exchange {
            name: self.name,
            kind,
            durable: self.durable,
            auto_delete: self.auto_delete,
            args: decode_args(&self.args),
        })
    }
}

#[derive(Debug)]
struct Inner {
    table: Table<ExchangeRow>,
    exchanges: HashMap<String, Arc<Exchange>>,
}

/// Owns every declared exchange. Durable exchanges are mirrored in the
/// `exchanges` table and reloaded by [`ExchangeManager::open`].
#[derive(Debug)]
pub struct ExchangeManager {
    inner: Mutex<Inner>,
}

impl ExchangeManager {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let table: Table<ExchangeRow> = Table::open(dir, TABLE_NAME)?;
        let mut exchanges = HashMap::new();
        for row in table.load()? {
            let name = row.name.clone();
            match row.into_exchange() {
                Some(ex) => {
                    exchanges.insert(name, Arc::new(ex));
                }
                None => warn!(target: "relaymq::exchange", %name, "Skipping row with unknown exchange type"),
            }
        }
        debug!(target: "relaymq::exchange", count = exchanges.len(), "Recovered exchanges");

        Ok(Self {
            inner: Mutex::new(Inner { table, exchanges }),
        })
    }

    /// Declares an exchange. Re-declaring an existing name succeeds without
    /// touching the stored attributes. Returns `false` only when a durable
    /// exchange could not be persisted.
    pub fn declare(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.exchanges.contains_key(name) {
            debug!(target: "relaymq::exchange", name, "Exchange already declared");
            return true;
        }

        let exchange = Exchange::new(name, kind, durable, auto_delete, args);
        if durable {
            if let Err(e) = inner.table.insert(ExchangeRow::from(&exchange)) {
                error!(target: "relaymq::exchange", name, error = %e, "Failed to persist exchange");
                return false;
            }
        }
        inner.exchanges.insert(name.to_string(), Arc::new(exchange));
        true
    }

    /// Removes an exchange. Absent names are a no-op.
    pub fn delete(&self, name: &str) {
        let mut inner = self.inner.lock();
        let Some(exchange) = inner.exchanges.remove(name) else {
            return;
        };
        if exchange.durable {
            if let Err(e) = inner.table.delete_where(|row| row.name == name) {
                error!(target: "relaymq::exchange", name, error = %e, "Failed to remove persisted exchange");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Exchange>> {
        self.inner.lock().exchanges.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().exchanges.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every exchange, in memory and on disk.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.table.truncate() {
            error!(target: "relaymq::exchange", error = %e, "Failed to truncate exchange table");
        }
        inner.exchanges.clear();
    }
}
