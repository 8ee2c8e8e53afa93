//! Queue subscribers and round-robin selection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::core::message::BasicProperties;

/// Sink a consumer's messages are pushed into.
pub trait Deliver: Send + Sync {
    fn deliver(&self, consumer_tag: &str, properties: &BasicProperties, body: &Bytes);
}

impl<F> Deliver for F
where
    F: Fn(&str, &BasicProperties, &Bytes) + Send + Sync,
{
    fn deliver(&self, consumer_tag: &str, properties: &BasicProperties, body: &Bytes) {
        self(consumer_tag, properties, body)
    }
}

pub struct Consumer {
    pub tag: String,
    pub queue: String,
    pub auto_ack: bool,
    callback: Arc<dyn Deliver>,
}

impl Consumer {
    pub fn new(
        tag: impl Into<String>,
        queue: impl Into<String>,
        auto_ack: bool,
        callback: Arc<dyn Deliver>,
    ) -> Self {
        Self {
            tag: tag.into(),
            queue: queue.into(),
            auto_ack,
            callback,
        }
    }

    pub fn deliver(&self, properties: &BasicProperties, body: &Bytes) {
        self.callback.deliver(&self.tag, properties, body);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    list: Vec<Arc<Consumer>>,
    cursor: u64,
}

/// Subscribers of one queue.
#[derive(Debug)]
pub struct QueueConsumers {
    queue: String,
    inner: Mutex<Subscribers>,
}

impl QueueConsumers {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            inner: Mutex::new(Subscribers::default()),
        }
    }

    /// Adds a subscriber. Returns `None` when `tag` is already subscribed.
    pub fn create(
        &self,
        tag: &str,
        auto_ack: bool,
        callback: Arc<dyn Deliver>,
    ) -> Option<Arc<Consumer>> {
        let mut inner = self.inner.lock();
        if inner.list.iter().any(|c| c.tag == tag) {
            debug!(target: "relaymq::consumer", queue = %self.queue, tag, "Consumer tag already subscribed");
            return None;
        }
        let consumer = Arc::new(Consumer::new(tag, self.queue.clone(), auto_ack, callback));
        inner.list.push(Arc::clone(&consumer));
        Some(consumer)
    }

    pub fn remove(&self, tag: &str) {
        self.inner.lock().list.retain(|c| c.tag != tag);
    }

    /// Next subscriber in round-robin order.
    pub fn choose(&self) -> Option<Arc<Consumer>> {
        let mut inner = self.inner.lock();
        if inner.list.is_empty() {
            return None;
        }
        let idx = (inner.cursor % inner.list.len() as u64) as usize;
        inner.cursor = inner.cursor.wrapping_add(1);
        Some(Arc::clone(&inner.list[idx]))
    }

    pub fn exists(&self, tag: &str) -> bool {
        self.inner.lock().list.iter().any(|c| c.tag == tag)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }
}

/// Subscriber sets of every queue, kept aligned with the declared queues.
#[derive(Debug, Default)]
pub struct ConsumerManager {
    queues: DashMap<String, Arc<QueueConsumers>>,
}

impl ConsumerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_queue_consumer(&self, queue: &str) {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueConsumers::new(queue)));
    }

    pub fn destroy_queue_consumer(&self, queue: &str) {
        self.queues.remove(queue);
    }

    fn get(&self, queue: &str) -> Option<Arc<QueueConsumers>> {
        self.queues.get(queue).map(|q| Arc::clone(q.value()))
    }

    pub fn create(
        &self,
        tag: &str,
        queue: &str,
        auto_ack: bool,
        callback: Arc<dyn Deliver>,
    ) -> Option<Arc<Consumer>> {
        let Some(consumers) = self.get(queue) else {
            debug!(target: "relaymq::consumer", queue, tag, "No consumer set for queue");
            return None;
        };
        consumers.create(tag, auto_ack, callback)
    }

    pub fn remove(&self, tag: &str, queue: &str) {
        if let Some(consumers) = self.get(queue) {
            consumers.remove(tag);
        }
    }

    pub fn choose(&self, queue: &str) -> Option<Arc<Consumer>> {
        self.get(queue)?.choose()
    }

    pub fn exists(&self, tag: &str, queue: &str) -> bool {
        self.get(queue).is_some_and(|c| c.exists(tag))
    }

    /// `true` for unknown queues as well as queues without subscribers.
    pub fn is_empty(&self, queue: &str) -> bool {
        self.get(queue).map_or(true, |c| c.is_empty())
    }

    pub fn clear(&self) {
        self.queues.clear();
    }
}
