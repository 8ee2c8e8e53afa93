//! Virtual host: the topology managers and message store behind one broker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::core::args::Arguments;
use crate::core::binding::{Binding, BindingManager};
use crate::core::error::BrokerError;
use crate::core::exchange::{Exchange, ExchangeManager};
use crate::core::message::{BasicProperties, Message, MessageManager};
use crate::core::queue::{self, QueueDef, QueueManager};
use crate::core::routing::{self, ExchangeType};

const META_DIR: &str = "meta";

#[derive(Debug)]
pub struct VirtualHost {
    name: String,
    data_dir: PathBuf,
    exchanges: ExchangeManager,
    queues: QueueManager,
    bindings: BindingManager,
    messages: MessageManager,
}

impl VirtualHost {
    /// Opens the metadata tables under `<data_dir>/meta` and recovers every
    /// durable queue's messages. Any failure here is fatal for startup.
    pub fn open(name: impl Into<String>, data_dir: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let name = name.into();
        let data_dir = data_dir.as_ref().to_path_buf();
        let meta = data_dir.join(META_DIR);

        let exchanges = ExchangeManager::open(&meta)?;
        let queues = QueueManager::open(&meta)?;
        let bindings = BindingManager::open(&meta)?;
        let messages = MessageManager::new(&data_dir);

        for queue in queues.all() {
            messages.init_queue_messages(&queue.name, queue.durable)?;
        }

        info!(
            target: "relaymq::vhost",
            vhost = %name,
            exchanges = exchanges.len(),
            queues = queues.len(),
            bindings = bindings.len(),
            "Virtual host ready"
        );

        Ok(Self {
            name,
            data_dir,
            exchanges,
            queues,
            bindings,
            messages,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        self.exchanges.declare(name, kind, durable, auto_delete, args)
    }

    /// Deletes an exchange after dropping its bindings.
    pub fn delete_exchange(&self, name: &str) {
        self.bindings.remove_exchange_bindings(name);
        self.exchanges.delete(name);
    }

    /// Declares a queue together with its message store. Names that are not
    /// usable as log file names are refused.
    pub fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        if !queue::is_valid_queue_name(name) {
            warn!(target: "relaymq::vhost", "{}", BrokerError::malformed("queue name", name));
            return false;
        }
        if self.queues.exists(name) {
            debug!(target: "relaymq::vhost", queue = name, "Queue already declared");
            return true;
        }
        if let Err(e) = self.messages.init_queue_messages(name, durable) {
            error!(target: "relaymq::vhost", queue = name, error = %e, "Failed to open queue message store");
            return false;
        }
        if !self.queues.declare(name, durable, exclusive, auto_delete, args) {
            self.messages.destroy_queue_messages(name);
            return false;
        }
        true
    }

    /// Deletes a queue, its bindings on every exchange, and its messages.
    pub fn delete_queue(&self, name: &str) {
        self.bindings.remove_queue_bindings(name);
        self.messages.destroy_queue_messages(name);
        self.queues.delete(name);
    }

    /// Binds `queue` to `exchange`. Fails when either side is missing or the
    /// key is not a valid binding pattern.
    pub fn bind(&self, exchange: &str, queue: &str, binding_key: &str) -> bool {
        let Some(ex) = self.exchanges.get(exchange) else {
            warn!(target: "relaymq::vhost", "{}", BrokerError::not_found("exchange", exchange));
            return false;
        };
        let Some(q) = self.queues.get(queue) else {
            warn!(target: "relaymq::vhost", "{}", BrokerError::not_found("queue", queue));
            return false;
        };
        if !routing::is_valid_binding_key(binding_key) {
            warn!(target: "relaymq::vhost", "{}", BrokerError::malformed("binding key", binding_key));
            return false;
        }
        self.bindings
            .bind(exchange, queue, binding_key, ex.durable && q.durable)
    }

    pub fn unbind(&self, exchange: &str, queue: &str) {
        self.bindings.unbind(exchange, queue);
    }

    /// Routes a message through `exchange` and stores a copy in each matching
    /// queue. Returns the queues that accepted it, or `None` when the
    /// exchange does not exist.
    pub fn publish(
        &self,
        exchange: &str,
        properties: &BasicProperties,
        body: &Bytes,
    ) -> Option<Vec<String>> {
        let Some(ex) = self.exchanges.get(exchange) else {
            warn!(target: "relaymq::vhost", "{}", BrokerError::not_found("exchange", exchange));
            return None;
        };

        let mut stored = Vec::new();
        for binding in self.bindings.exchange_bindings(exchange) {
            if !routing::route(ex.kind, &properties.routing_key, &binding.binding_key) {
                continue;
            }
            let Some(queue) = self.queues.get(&binding.queue) else {
                debug!(target: "relaymq::vhost", queue = %binding.queue, "Binding points at a missing queue");
                continue;
            };
            if self
                .messages
                .insert(&queue.name, properties.clone(), body.clone(), queue.durable)
            {
                stored.push(queue.name.clone());
            }
        }
        debug!(
            target: "relaymq::vhost",
            exchange,
            routing_key = %properties.routing_key,
            matched = stored.len(),
            "Routed message"
        );
        Some(stored)
    }

    /// Pops the next message of `queue` for delivery.
    pub fn basic_front(&self, queue: &str) -> Option<Message> {
        self.messages.front(queue)
    }

    pub fn basic_ack(&self, queue: &str, msg_id: &str) -> bool {
        self.messages.ack(queue, msg_id)
    }

    pub fn exists_exchange(&self, name: &str) -> bool {
        self.exchanges.exists(name)
    }

    pub fn exists_queue(&self, name: &str) -> bool {
        self.queues.exists(name)
    }

    pub fn exists_binding(&self, exchange: &str, queue: &str) -> bool {
        self.bindings.exists(exchange, queue)
    }

    pub fn exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.get(name)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<QueueDef>> {
        self.queues.get(name)
    }

    pub fn all_queues(&self) -> Vec<Arc<QueueDef>> {
        self.queues.all()
    }

    pub fn exchange_bindings(&self, exchange: &str) -> Vec<Arc<Binding>> {
        self.bindings.exchange_bindings(exchange)
    }

    pub fn messages(&self) -> &MessageManager {
        &self.messages
    }

    /// Removes all topology and messages, on disk as well.
    pub fn clear(&self) {
        self.bindings.clear();
        self.messages.clear();
        self.queues.clear();
        self.exchanges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::DeliveryMode;
    use tempfile::TempDir;

    fn vhost(dir: &TempDir) -> VirtualHost {
        VirtualHost::open("test", dir.path()).unwrap()
    }

    fn props(rk: &str) -> BasicProperties {
        BasicProperties::new(rk, DeliveryMode::Durable)
    }

    #[test]
    fn bind_requires_both_endpoints_and_valid_key() {
        let dir = TempDir::new().unwrap();
        let vh = vhost(&dir);
        vh.declare_exchange("ex", ExchangeType::Topic, false, false, Arguments::new());
        assert!(!vh.bind("ex", "q", "a.#"));

        vh.declare_queue("q", false, false, false, Arguments::new());
        assert!(!vh.bind("nope", "q", "a.#"));
        assert!(!vh.bind("ex", "q", "a.#.#"));
        assert!(vh.bind("ex", "q", "a.#"));
        assert!(vh.exists_binding("ex", "q"));
    }

    #[test]
    fn queue_names_cannot_escape_the_data_dir() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let vh = VirtualHost::open("test", &data).unwrap();

        for name in ["../../escaped", "../escaped", "nested/escaped", ".escaped"] {
            assert!(!vh.declare_queue(name, true, false, false, Arguments::new()), "{name}");
            assert!(!vh.exists_queue(name));
        }
        assert!(!dir.path().join("escaped.mqd").exists());
        assert!(!data.join("escaped.mqd").exists());
        assert!(!data.join("messages").join("nested").exists());

        assert!(vh.declare_queue("escaped", true, false, false, Arguments::new()));
        assert!(data.join("messages").join("escaped.mqd").exists());
    }

    #[test]
    fn publish_to_missing_exchange_fails() {
        let dir = TempDir::new().unwrap();
        let vh = vhost(&dir);
        assert!(vh.publish("ghost", &props("a"), &Bytes::new()).is_none());
    }

    #[test]
    fn publish_with_no_match_still_succeeds() {
        let dir = TempDir::new().unwrap();
        let vh = vhost(&dir);
        vh.declare_exchange("ex", ExchangeType::Direct, false, false, Arguments::new());
        vh.declare_queue("q", false, false, false, Arguments::new());
        vh.bind("ex", "q", "exact");

        assert_eq!(vh.publish("ex", &props("other"), &Bytes::new()), Some(vec![]));
        assert_eq!(
            vh.publish("ex", &props("exact"), &Bytes::new()),
            Some(vec!["q".to_string()])
        );
    }

    #[test]
    fn fanout_reaches_every_bound_queue() {
        let dir = TempDir::new().unwrap();
        let vh = vhost(&dir);
        vh.declare_exchange("fan", ExchangeType::Fanout, false, false, Arguments::new());
        for q in ["a", "b", "c"] {
            vh.declare_queue(q, false, false, false, Arguments::new());
            vh.bind("fan", q, "");
        }
        let mut hit = vh.publish("fan", &props("x"), &Bytes::new()).unwrap();
        hit.sort();
        assert_eq!(hit, vec!["a", "b", "c"]);
    }

    #[test]
    fn deleting_queue_cascades_bindings_only() {
        let dir = TempDir::new().unwrap();
        let vh = vhost(&dir);
        vh.declare_exchange("ex1", ExchangeType::Direct, true, false, Arguments::new());
        vh.declare_exchange("ex2", ExchangeType::Topic, true, false, Arguments::new());
        vh.declare_queue("q", true, false, false, Arguments::new());
        vh.bind("ex1", "q", "k");
        vh.bind("ex2", "q", "k.#");
        vh.publish("ex1", &props("k"), &Bytes::from_static(b"m")).unwrap();

        vh.delete_queue("q");
        assert!(!vh.exists_binding("ex1", "q"));
        assert!(!vh.exists_binding("ex2", "q"));
        assert!(vh.exists_exchange("ex1"));
        assert!(vh.exists_exchange("ex2"));
        assert!(!dir.path().join("messages").join("q.mqd").exists());
    }

    #[test]
    fn deleting_exchange_cascades_its_bindings() {
        let dir = TempDir::new().unwrap();
        let vh = vhost(&dir);
        vh.declare_exchange("ex", ExchangeType::Direct, false, false, Arguments::new());
        vh.declare_queue("q", false, false, false, Arguments::new());
        vh.bind("ex", "q", "k");

        vh.delete_exchange("ex");
        assert!(!vh.exists_binding("ex", "q"));
        assert!(vh.exists_queue("q"));
        assert!(vh.exchange_bindings("ex").is_empty());
    }

    #[test]
    fn restart_recovers_topology_and_messages() {
        let dir = TempDir::new().unwrap();
        {
            let vh = vhost(&dir);
            vh.declare_exchange("ex", ExchangeType::Topic, true, false, Arguments::new());
            vh.declare_queue("q", true, false, false, Arguments::new());
            vh.declare_queue("tmp", false, false, false, Arguments::new());
            vh.bind("ex", "q", "news.#");
            vh.bind("ex", "tmp", "news.#");
            for i in 0..3 {
                vh.publish("ex", &props("news.sport"), &Bytes::from(format!("m{i}")))
                    .unwrap();
            }
        }

        let vh = vhost(&dir);
        assert!(vh.exists_exchange("ex"));
        assert!(vh.exists_queue("q"));
        assert!(!vh.exists_queue("tmp"));
        assert!(vh.exists_binding("ex", "q"));
        assert!(!vh.exists_binding("ex", "tmp"));
        assert_eq!(vh.messages().pending_count("q"), 3);
        assert_eq!(vh.basic_front("q").unwrap().body, Bytes::from("m0"));
    }

    #[test]
    fn clear_wipes_everything() {
        let dir = TempDir::new().unwrap();
        let vh = vhost(&dir);
        vh.declare_exchange("ex", ExchangeType::Topic, true, false, Arguments::new());
        vh.declare_queue("q", true, false, false, Arguments::new());
        vh.bind("ex", "q", "#");
        vh.clear();
        assert!(!vh.exists_exchange("ex"));
        assert!(!vh.exists_queue("q"));
        assert!(vh.all_queues().is_empty());
        drop(vh);

        let vh = vhost(&dir);
        assert!(!vh.exists_queue("q"));
    }
}
