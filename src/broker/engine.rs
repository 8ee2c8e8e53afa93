//! Broker engine: topology, publish and consume operations over one virtual
//! host, with deliveries dispatched on the worker pool.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::broker::pool::DeliveryPool;
use crate::config::DeliveryConfig;
use crate::core::consumer::{Consumer, ConsumerManager, Deliver};
use crate::core::message::BasicProperties;
use crate::core::{routing, Arguments, BrokerError, ExchangeType, VirtualHost};

#[derive(Debug)]
pub struct Broker {
    vhost: Arc<VirtualHost>,
    consumers: Arc<ConsumerManager>,
    pool: DeliveryPool,
}

impl Broker {
    /// Wraps a recovered virtual host. Every existing queue gets an empty
    /// consumer set.
    pub fn new(vhost: VirtualHost, delivery: &DeliveryConfig) -> std::io::Result<Self> {
        let consumers = ConsumerManager::new();
        for queue in vhost.all_queues() {
            consumers.init_queue_consumer(&queue.name);
        }
        let pool = DeliveryPool::new(delivery.worker_threads, delivery.queue_capacity)?;
        info!(
            target: "relaymq::broker",
            workers = delivery.worker_threads,
            capacity = delivery.queue_capacity,
            "Delivery pool started"
        );

        Ok(Self {
            vhost: Arc::new(vhost),
            consumers: Arc::new(consumers),
            pool,
        })
    }

    pub fn vhost(&self) -> &VirtualHost {
        &self.vhost
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        self.vhost
            .declare_exchange(name, kind, durable, auto_delete, args)
    }

    pub fn delete_exchange(&self, name: &str) -> bool {
        self.vhost.delete_exchange(name);
        true
    }

    pub fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: Arguments,
    ) -> bool {
        self.consumers.init_queue_consumer(name);
        let ok = self
            .vhost
            .declare_queue(name, durable, exclusive, auto_delete, args);
        if !ok && !self.vhost.exists_queue(name) {
            self.consumers.destroy_queue_consumer(name);
        }
        ok
    }

    pub fn delete_queue(&self, name: &str) -> bool {
        self.consumers.destroy_queue_consumer(name);
        self.vhost.delete_queue(name);
        true
    }

    pub fn bind(&self, exchange: &str, queue: &str, binding_key: &str) -> bool {
        self.vhost.bind(exchange, queue, binding_key)
    }

    pub fn unbind(&self, exchange: &str, queue: &str) -> bool {
        self.vhost.unbind(exchange, queue);
        true
    }

    /// Routes and stores a message, then schedules one delivery task per
    /// matched queue. Fails on an unknown exchange or a malformed routing
    /// key; succeeds even when nothing matched.
    ///
    /// Blocks the calling thread while the delivery pool is full. Async
    /// callers should go through `tokio::task::block_in_place`, as the
    /// server does.
    pub fn publish(&self, exchange: &str, properties: BasicProperties, body: Bytes) -> bool {
        if !routing::is_valid_routing_key(&properties.routing_key) {
            warn!(target: "relaymq::broker", "{}", BrokerError::malformed("routing key", properties.routing_key));
            return false;
        }
        let Some(queues) = self.vhost.publish(exchange, &properties, &body) else {
            return false;
        };
        for queue in queues {
            self.schedule_delivery(queue);
        }
        true
    }

    pub fn ack(&self, queue: &str, msg_id: &str) -> bool {
        self.vhost.basic_ack(queue, msg_id)
    }

    /// Subscribes `tag` to `queue`. `None` when the queue does not exist or
    /// the tag is already subscribed there.
    pub fn subscribe(
        &self,
        tag: &str,
        queue: &str,
        auto_ack: bool,
        callback: Arc<dyn Deliver>,
    ) -> Option<Arc<Consumer>> {
        if !self.vhost.exists_queue(queue) {
            warn!(target: "relaymq::broker", "{}", BrokerError::not_found("queue", queue));
            return None;
        }
        self.consumers.create(tag, queue, auto_ack, callback)
    }

    pub fn cancel(&self, tag: &str, queue: &str) {
        self.consumers.remove(tag, queue);
    }

    fn schedule_delivery(&self, queue: String) {
        let vhost = Arc::clone(&self.vhost);
        let consumers = Arc::clone(&self.consumers);
        let accepted = self
            .pool
            .submit(move || deliver_one(&vhost, &consumers, &queue));
        if !accepted {
            debug!(target: "relaymq::broker", "Delivery task rejected");
        }
    }

    /// Stops the delivery pool after draining queued tasks.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// One delivery attempt: pop the head of `queue`, hand it to the next
/// subscriber, and acknowledge it straight away for auto-ack subscribers.
///
/// A message popped while the queue has no subscriber stays awaiting
/// acknowledgement.
pub(crate) fn deliver_one(vhost: &VirtualHost, consumers: &ConsumerManager, queue: &str) {
    let Some(msg) = vhost.basic_front(queue) else {
        return;
    };
    let Some(consumer) = consumers.choose(queue) else {
        debug!(target: "relaymq::broker", queue, id = msg.id(), "No consumer for message");
        return;
    };

    consumer.deliver(&msg.properties, &msg.body);
    if consumer.auto_ack {
        vhost.basic_ack(queue, msg.id());
    }
}
